//! Tenant name derivation.
//!
//! Pure functions mapping `(user_id, organization_id, logical_name)` to the
//! physical names used against each backend, and the inverse used when
//! listings strip the tenant prefix. For all distinct users the derived
//! namespaces are disjoint; that disjointness is the isolation mechanism.

use crate::error::{Error, Result};

/// Minimum and maximum object-store bucket name length, applied to the
/// sanitised logical name.
const BUCKET_NAME_MIN: usize = 3;
const BUCKET_NAME_MAX: usize = 63;

/// Lowercase and replace characters the object store forbids. Underscores
/// become hyphens; any other character outside `[a-z0-9.-]` also becomes a
/// hyphen.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Physical object-store bucket: `user-{sanitize(user_id)}-{logical}`.
pub fn bucket(user_id: &str, logical: &str) -> Result<String> {
    let logical = sanitize(logical);
    if logical.len() < BUCKET_NAME_MIN || logical.len() > BUCKET_NAME_MAX {
        return Err(Error::InvalidArgument(format!(
            "bucket name '{logical}' must be {BUCKET_NAME_MIN}-{BUCKET_NAME_MAX} characters after sanitisation"
        )));
    }
    let physical = format!("user-{}-{logical}", sanitize(user_id));
    if physical.len() > BUCKET_NAME_MAX {
        return Err(Error::InvalidArgument(format!(
            "bucket name '{logical}' exceeds the backend limit once prefixed"
        )));
    }
    Ok(physical)
}

/// Strip the tenant prefix from a physical bucket name, returning the
/// logical name a listing should surface. `None` if the bucket belongs to a
/// different tenant.
pub fn strip_bucket(user_id: &str, physical: &str) -> Option<String> {
    physical
        .strip_prefix(&format!("user-{}-", sanitize(user_id)))
        .map(str::to_owned)
}

/// Broker subject: `user.{user_id}.{logical}`. Wildcard segments in the
/// logical subject are preserved; only the tenant prefix is prepended.
pub fn subject(user_id: &str, logical: &str) -> String {
    format!("user.{user_id}.{logical}")
}

pub fn strip_subject(user_id: &str, physical: &str) -> Option<String> {
    physical
        .strip_prefix(&format!("user.{user_id}."))
        .map(str::to_owned)
}

/// Broker stream: `user-{user_id}-{logical}`.
pub fn stream(user_id: &str, logical: &str) -> String {
    format!("user-{user_id}-{logical}")
}

pub fn strip_stream(user_id: &str, physical: &str) -> Option<String> {
    physical
        .strip_prefix(&format!("user-{user_id}-"))
        .map(str::to_owned)
}

/// Broker key-value bucket: `kv-user-{user_id}-{logical}`.
pub fn kv_bucket(user_id: &str, logical: &str) -> String {
    format!("kv-user-{user_id}-{logical}")
}

/// Broker object bucket: `obj-user-{user_id}-{logical}`.
pub fn obj_bucket(user_id: &str, logical: &str) -> String {
    format!("obj-user-{user_id}-{logical}")
}

/// Cache key: `{org_id}:{user_id}:{logical}`.
pub fn cache_key(organization_id: &str, user_id: &str, logical: &str) -> String {
    format!("{organization_id}:{user_id}:{logical}")
}

pub fn strip_cache_key(organization_id: &str, user_id: &str, physical: &str) -> Option<String> {
    physical
        .strip_prefix(&format!("{organization_id}:{user_id}:"))
        .map(str::to_owned)
}

/// Columnar-analytics schema: `org_{organization_id}`. Organizations with
/// no id share the default schema `org_default`.
pub fn analytics_schema(organization_id: &str) -> String {
    if organization_id.is_empty() {
        "org_default".to_string()
    } else {
        format!("org_{}", sanitize_identifier(organization_id))
    }
}

/// Sanitise a value for use as a SQL identifier fragment: lowercase, with
/// anything outside `[a-z0-9_]` replaced by an underscore.
pub fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_are_sanitized_and_prefixed() {
        assert_eq!(bucket("alice", "photos").unwrap(), "user-alice-photos");
        assert_eq!(bucket("Alice_B", "My_Photos").unwrap(), "user-alice-b-my-photos");
    }

    #[test]
    fn bucket_names_outside_bounds_are_rejected() {
        // Two characters after sanitisation.
        assert!(matches!(bucket("alice", "xy"), Err(Error::InvalidArgument(_))));
        assert!(bucket("alice", "xyz").is_ok());
        let long = "a".repeat(64);
        assert!(matches!(bucket("alice", &long), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn distinct_users_derive_disjoint_names() {
        let a = bucket("alice", "shared").unwrap();
        let b = bucket("bob", "shared").unwrap();
        assert_ne!(a, b);
        assert_ne!(subject("alice", "orders.created"), subject("bob", "orders.created"));
        assert_ne!(cache_key("org", "alice", "k"), cache_key("org", "bob", "k"));
    }

    #[test]
    fn listing_strips_the_tenant_prefix() {
        let physical = bucket("alice", "photos").unwrap();
        assert_eq!(strip_bucket("alice", &physical).as_deref(), Some("photos"));
        assert_eq!(strip_bucket("bob", &physical), None);
    }

    #[test]
    fn subjects_keep_wildcards_intact() {
        assert_eq!(subject("alice", "a.*.b"), "user.alice.a.*.b");
        assert_eq!(subject("alice", "orders.>"), "user.alice.orders.>");
        assert_eq!(
            strip_subject("alice", "user.alice.orders.created").as_deref(),
            Some("orders.created")
        );
        assert_eq!(strip_subject("bob", "user.alice.orders.created"), None);
    }

    #[test]
    fn stream_and_sub_api_names_compose() {
        assert_eq!(stream("alice", "s1"), "user-alice-s1");
        assert_eq!(kv_bucket("alice", "cfg"), "kv-user-alice-cfg");
        assert_eq!(obj_bucket("alice", "blobs"), "obj-user-alice-blobs");
        assert_eq!(strip_stream("alice", "user-alice-s1").as_deref(), Some("s1"));
    }

    #[test]
    fn cache_keys_round_trip() {
        let physical = cache_key("acme", "alice", "session:42");
        assert_eq!(physical, "acme:alice:session:42");
        assert_eq!(
            strip_cache_key("acme", "alice", &physical).as_deref(),
            Some("session:42")
        );
    }

    #[test]
    fn analytics_schemas_are_org_scoped() {
        assert_eq!(analytics_schema("acme"), "org_acme");
        assert_eq!(analytics_schema("Acme-Corp"), "org_acme_corp");
        assert_eq!(analytics_schema(""), "org_default");
    }
}
