//! Redis connection management and error mapping.

use manifold_core::Error;

pub fn connect(url: &str) -> anyhow::Result<(deadpool_redis::Pool, redis::Client)> {
    let pool = deadpool_redis::Config::from_url(url)
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))?;
    // Pub/sub needs a dedicated connection outside the pool.
    let client = redis::Client::open(url)?;
    Ok((pool, client))
}

pub fn classify_pool(context: &str, err: deadpool_redis::PoolError) -> Error {
    Error::Unavailable(format!("{context}: cache pool: {err}"))
}

/// Table-driven mapping from backend errors into the taxonomy.
pub fn classify(context: &str, err: redis::RedisError) -> Error {
    use redis::ErrorKind;

    let detail = format!("{context}: {err}");
    if err.is_timeout() {
        return Error::DeadlineExceeded(detail);
    }

    match err.kind() {
        ErrorKind::IoError
        | ErrorKind::ClusterDown
        | ErrorKind::MasterDown
        | ErrorKind::BusyLoadingError
        | ErrorKind::TryAgain => Error::Unavailable(detail),
        ErrorKind::AuthenticationFailed => Error::PermissionDenied(detail),
        ErrorKind::TypeError => Error::InvalidArgument(detail),
        ErrorKind::ResponseError => {
            // WRONGTYPE and syntax errors come back as bare response errors.
            if detail.contains("WRONGTYPE") {
                Error::FailedPrecondition(detail)
            } else {
                Error::InvalidArgument(detail)
            }
        }
        ErrorKind::NoScriptError | ErrorKind::InvalidClientConfig => Error::InvalidArgument(detail),
        _ => Error::Internal(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_error(kind: redis::ErrorKind, message: &'static str) -> redis::RedisError {
        redis::RedisError::from((kind, message))
    }

    #[test]
    fn io_errors_mean_unavailable() {
        assert!(matches!(
            classify("get", redis_error(redis::ErrorKind::IoError, "refused")),
            Error::Unavailable(_)
        ));
    }

    #[test]
    fn auth_failures_mean_permission_denied() {
        assert!(matches!(
            classify(
                "get",
                redis_error(redis::ErrorKind::AuthenticationFailed, "bad password")
            ),
            Error::PermissionDenied(_)
        ));
    }

    #[test]
    fn wrongtype_means_failed_precondition() {
        let err = redis::RedisError::from((
            redis::ErrorKind::ResponseError,
            "WRONGTYPE",
            "Operation against a key holding the wrong kind of value".to_string(),
        ));
        assert!(matches!(classify("get", err), Error::FailedPrecondition(_)));
    }
}
