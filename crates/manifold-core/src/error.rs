//! The universal error taxonomy.
//!
//! Adapters map backend errors into [`Error`] at the boundary and never let
//! backend-specific types cross the gRPC surface. The mapping to gRPC codes
//! and HTTP statuses is fixed here so every adapter reports failures
//! identically.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Stable lowercase identifier, recorded in audit records and metrics
    /// labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::PermissionDenied(_) => "permission_denied",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::FailedPrecondition(_) => "failed_precondition",
            Error::Unavailable(_) => "unavailable",
            Error::DeadlineExceeded(_) => "deadline_exceeded",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::Internal(_) => "internal",
        }
    }

    pub fn grpc_code(&self) -> tonic::Code {
        match self {
            Error::PermissionDenied(_) => tonic::Code::PermissionDenied,
            Error::InvalidArgument(_) => tonic::Code::InvalidArgument,
            Error::NotFound(_) => tonic::Code::NotFound,
            Error::AlreadyExists(_) => tonic::Code::AlreadyExists,
            Error::FailedPrecondition(_) => tonic::Code::FailedPrecondition,
            Error::Unavailable(_) => tonic::Code::Unavailable,
            Error::DeadlineExceeded(_) => tonic::Code::DeadlineExceeded,
            Error::ResourceExhausted(_) => tonic::Code::ResourceExhausted,
            Error::Internal(_) => tonic::Code::Internal,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Error::PermissionDenied(_) => 403,
            Error::InvalidArgument(_) => 400,
            Error::NotFound(_) => 404,
            Error::AlreadyExists(_) | Error::FailedPrecondition(_) => 409,
            Error::Unavailable(_) => 503,
            Error::DeadlineExceeded(_) => 504,
            Error::ResourceExhausted(_) => 429,
            Error::Internal(_) => 500,
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> tonic::Status {
        tonic::Status::new(err.grpc_code(), err.to_string())
    }
}

/// The inverse mapping used by the gateway when it translates an adapter's
/// gRPC status into an HTTP response.
pub fn http_status_for_code(code: tonic::Code) -> u16 {
    match code {
        tonic::Code::Ok => 200,
        tonic::Code::PermissionDenied | tonic::Code::Unauthenticated => 403,
        tonic::Code::InvalidArgument => 400,
        tonic::Code::NotFound => 404,
        tonic::Code::AlreadyExists | tonic::Code::FailedPrecondition => 409,
        tonic::Code::Unavailable => 503,
        tonic::Code::DeadlineExceeded => 504,
        tonic::Code::ResourceExhausted => 429,
        _ => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_codes_match_the_taxonomy() {
        assert_eq!(
            Error::PermissionDenied("x".into()).grpc_code(),
            tonic::Code::PermissionDenied
        );
        assert_eq!(
            Error::InvalidArgument("x".into()).grpc_code(),
            tonic::Code::InvalidArgument
        );
        assert_eq!(Error::NotFound("x".into()).grpc_code(), tonic::Code::NotFound);
        assert_eq!(
            Error::AlreadyExists("x".into()).grpc_code(),
            tonic::Code::AlreadyExists
        );
        assert_eq!(
            Error::Unavailable("x".into()).grpc_code(),
            tonic::Code::Unavailable
        );
        assert_eq!(
            Error::DeadlineExceeded("x".into()).grpc_code(),
            tonic::Code::DeadlineExceeded
        );
    }

    #[test]
    fn http_statuses_match_the_taxonomy() {
        assert_eq!(Error::PermissionDenied("x".into()).http_status(), 403);
        assert_eq!(Error::InvalidArgument("x".into()).http_status(), 400);
        assert_eq!(Error::NotFound("x".into()).http_status(), 404);
        assert_eq!(Error::AlreadyExists("x".into()).http_status(), 409);
        assert_eq!(Error::FailedPrecondition("x".into()).http_status(), 409);
        assert_eq!(Error::Unavailable("x".into()).http_status(), 503);
        assert_eq!(Error::DeadlineExceeded("x".into()).http_status(), 504);
        assert_eq!(Error::ResourceExhausted("x".into()).http_status(), 429);
        assert_eq!(Error::Internal("x".into()).http_status(), 500);
    }

    #[test]
    fn status_round_trip_preserves_code_and_message() {
        let status: tonic::Status = Error::NotFound("object a.txt".into()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert_eq!(status.message(), "not found: object a.txt");
        assert_eq!(http_status_for_code(status.code()), 404);
    }
}
