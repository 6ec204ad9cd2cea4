//! Broker connection setup, error mapping, and the translation between
//! wire-level policy strings and the backend SDK's configuration enums.

use std::time::Duration;

use async_nats::jetstream;
use manifold_core::{Error, Result};

pub async fn connect(args: &crate::Args) -> anyhow::Result<async_nats::Client> {
    let mut options = async_nats::ConnectOptions::new();
    if !args.nats_user.is_empty() {
        options = options.user_and_password(args.nats_user.clone(), args.nats_password.clone());
    }
    let client = options.connect(args.nats_url()).await?;
    tracing::info!(url = %args.nats_url(), "connected to broker");
    Ok(client)
}

/// Map a broker error into the taxonomy. The SDK spreads failures across
/// many per-operation error enums, so the mapping keys on the normalized
/// error text the server returns.
pub fn classify<E: std::fmt::Display>(context: &str, err: E) -> Error {
    let text = err.to_string();
    let lower = text.to_lowercase();
    let detail = format!("{context}: {text}");

    if lower.contains("not found") || lower.contains("no message found") {
        Error::NotFound(detail)
    } else if lower.contains("already in use") || lower.contains("already exists") {
        Error::AlreadyExists(detail)
    } else if lower.contains("timed out") || lower.contains("timeout") {
        Error::DeadlineExceeded(detail)
    } else if lower.contains("no responders") {
        Error::Unavailable(detail)
    } else if lower.contains("connection") || lower.contains("disconnected") {
        Error::Unavailable(detail)
    } else if lower.contains("invalid")
        || lower.contains("maximum payload")
        || lower.contains("wrong last sequence")
    {
        Error::InvalidArgument(detail)
    } else if lower.contains("insufficient") || lower.contains("resources exceeded") {
        Error::ResourceExhausted(detail)
    } else {
        Error::Internal(detail)
    }
}

pub fn storage_type(storage: &str) -> Result<jetstream::stream::StorageType> {
    match storage {
        "" | "file" => Ok(jetstream::stream::StorageType::File),
        "memory" => Ok(jetstream::stream::StorageType::Memory),
        other => Err(Error::InvalidArgument(format!(
            "unknown storage type '{other}'"
        ))),
    }
}

pub fn storage_name(storage: jetstream::stream::StorageType) -> &'static str {
    match storage {
        jetstream::stream::StorageType::File => "file",
        jetstream::stream::StorageType::Memory => "memory",
    }
}

pub fn discard_policy(discard: &str) -> Result<jetstream::stream::DiscardPolicy> {
    match discard {
        "" | "old" => Ok(jetstream::stream::DiscardPolicy::Old),
        "new" => Ok(jetstream::stream::DiscardPolicy::New),
        other => Err(Error::InvalidArgument(format!(
            "unknown discard policy '{other}'"
        ))),
    }
}

pub fn discard_name(discard: jetstream::stream::DiscardPolicy) -> &'static str {
    match discard {
        jetstream::stream::DiscardPolicy::Old => "old",
        jetstream::stream::DiscardPolicy::New => "new",
    }
}

pub fn deliver_policy(
    policy: &str,
    opt_start_seq: u64,
) -> Result<jetstream::consumer::DeliverPolicy> {
    use jetstream::consumer::DeliverPolicy;
    if opt_start_seq > 0 {
        return Ok(DeliverPolicy::ByStartSequence {
            start_sequence: opt_start_seq,
        });
    }
    match policy {
        "" | "all" => Ok(DeliverPolicy::All),
        "last" => Ok(DeliverPolicy::Last),
        "new" => Ok(DeliverPolicy::New),
        other => Err(Error::InvalidArgument(format!(
            "unknown deliver policy '{other}'"
        ))),
    }
}

pub fn deliver_name(policy: &jetstream::consumer::DeliverPolicy) -> &'static str {
    use jetstream::consumer::DeliverPolicy;
    match policy {
        DeliverPolicy::All => "all",
        DeliverPolicy::Last => "last",
        DeliverPolicy::New => "new",
        DeliverPolicy::ByStartSequence { .. } => "by_start_sequence",
        _ => "all",
    }
}

pub fn ack_policy(policy: &str) -> Result<jetstream::consumer::AckPolicy> {
    use jetstream::consumer::AckPolicy;
    match policy {
        "" | "explicit" => Ok(AckPolicy::Explicit),
        "all" => Ok(AckPolicy::All),
        "none" => Ok(AckPolicy::None),
        other => Err(Error::InvalidArgument(format!(
            "unknown ack policy '{other}'"
        ))),
    }
}

pub fn ack_name(policy: jetstream::consumer::AckPolicy) -> &'static str {
    use jetstream::consumer::AckPolicy;
    match policy {
        AckPolicy::Explicit => "explicit",
        AckPolicy::All => "all",
        AckPolicy::None => "none",
    }
}

pub fn replay_policy(policy: &str) -> Result<jetstream::consumer::ReplayPolicy> {
    use jetstream::consumer::ReplayPolicy;
    match policy {
        "" | "instant" => Ok(ReplayPolicy::Instant),
        "original" => Ok(ReplayPolicy::Original),
        other => Err(Error::InvalidArgument(format!(
            "unknown replay policy '{other}'"
        ))),
    }
}

pub fn replay_name(policy: jetstream::consumer::ReplayPolicy) -> &'static str {
    use jetstream::consumer::ReplayPolicy;
    match policy {
        ReplayPolicy::Instant => "instant",
        ReplayPolicy::Original => "original",
    }
}

/// `Request` and pull fetches treat a zero timeout as the default.
pub fn effective_timeout(timeout_ms: i64, default: Duration) -> Duration {
    if timeout_ms <= 0 {
        default
    } else {
        Duration::from_millis(timeout_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_text_maps_to_taxonomy() {
        assert!(matches!(
            classify("get_stream", "stream not found"),
            Error::NotFound(_)
        ));
        assert!(matches!(
            classify("create_stream", "stream name already in use with a different configuration"),
            Error::AlreadyExists(_)
        ));
        assert!(matches!(
            classify("request", "request timed out"),
            Error::DeadlineExceeded(_)
        ));
        assert!(matches!(
            classify("request", "no responders"),
            Error::Unavailable(_)
        ));
        assert!(matches!(
            classify("publish", "maximum payload exceeded"),
            Error::InvalidArgument(_)
        ));
        assert!(matches!(classify("publish", "boom"), Error::Internal(_)));
    }

    #[test]
    fn policies_round_trip() {
        assert_eq!(ack_name(ack_policy("explicit").unwrap()), "explicit");
        assert_eq!(ack_name(ack_policy("").unwrap()), "explicit");
        assert_eq!(storage_name(storage_type("memory").unwrap()), "memory");
        assert_eq!(discard_name(discard_policy("new").unwrap()), "new");
        assert_eq!(replay_name(replay_policy("original").unwrap()), "original");
        assert!(ack_policy("sometimes").is_err());
        assert!(storage_type("tape").is_err());
    }

    #[test]
    fn start_sequence_overrides_deliver_policy() {
        use jetstream::consumer::DeliverPolicy;
        assert!(matches!(
            deliver_policy("all", 42).unwrap(),
            DeliverPolicy::ByStartSequence { start_sequence: 42 }
        ));
        assert!(matches!(deliver_policy("last", 0).unwrap(), DeliverPolicy::Last));
    }

    #[test]
    fn zero_timeout_uses_default() {
        let default = Duration::from_secs(30);
        assert_eq!(effective_timeout(0, default), default);
        assert_eq!(effective_timeout(-1, default), default);
        assert_eq!(effective_timeout(1500, default), Duration::from_millis(1500));
    }
}
