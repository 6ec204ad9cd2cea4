//! S3 client construction and the mapping from SDK errors into the
//! universal taxonomy.

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use manifold_core::Error;

pub fn client(args: &crate::Args) -> aws_sdk_s3::Client {
    let scheme = if args.minio_secure { "https" } else { "http" };
    let endpoint = format!("{scheme}://{}:{}", args.minio_host, args.minio_port);

    let credentials = Credentials::new(
        args.minio_user.clone(),
        args.minio_password.clone(),
        None,
        None,
        "static",
    );

    let config = aws_sdk_s3::config::Builder::new()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(args.minio_region.clone()))
        .endpoint_url(endpoint)
        .credentials_provider(credentials)
        // MinIO serves buckets under the path, not a subdomain.
        .force_path_style(true)
        .build();

    aws_sdk_s3::Client::from_conf(config)
}

/// Translate one SDK error into the taxonomy. Transport-level failures map
/// first; everything else is table-driven on the S3 error code.
pub fn classify<E>(context: &str, err: SdkError<E>) -> Error
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    match &err {
        SdkError::TimeoutError(_) => {
            return Error::DeadlineExceeded(format!("{context}: backend timed out"));
        }
        SdkError::DispatchFailure(_) => {
            return Error::Unavailable(format!("{context}: backend unreachable"));
        }
        _ => (),
    }

    let code = err.meta().code().unwrap_or_default().to_string();
    let message = err
        .meta()
        .message()
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{err:?}"));

    // Some probes (HeadObject, HeadBucket) surface a bare 404 with no error
    // code in the body.
    if code.is_empty() && is_http_status(&err, 404) {
        return Error::NotFound(format!("{context}: {message}"));
    }

    classify_code(context, &code, &message)
}

/// The code table itself, kept separate from the SDK error plumbing.
pub(crate) fn classify_code(context: &str, code: &str, message: &str) -> Error {
    let detail = format!("{context}: {message}");
    match code {
        "NoSuchBucket" | "NoSuchKey" | "NotFound" | "NoSuchUpload" | "NoSuchVersion"
        | "NoSuchTagSet" | "NoSuchLifecycleConfiguration" | "NoSuchBucketPolicy" => {
            Error::NotFound(detail)
        }
        "BucketAlreadyExists" | "BucketAlreadyOwnedByYou" => Error::AlreadyExists(detail),
        "BucketNotEmpty" | "PreconditionFailed" => Error::FailedPrecondition(detail),
        "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" => {
            Error::PermissionDenied(detail)
        }
        "InvalidBucketName" | "InvalidArgument" | "InvalidPart" | "InvalidPartOrder"
        | "EntityTooLarge" | "EntityTooSmall" | "InvalidRange" | "MalformedXML" => {
            Error::InvalidArgument(detail)
        }
        "SlowDown" | "TooManyRequests" => Error::ResourceExhausted(detail),
        "RequestTimeout" => Error::DeadlineExceeded(detail),
        "ServiceUnavailable" => Error::Unavailable(detail),
        _ => Error::Internal(detail),
    }
}

fn is_http_status<E>(err: &SdkError<E>, status: u16) -> bool {
    match err {
        SdkError::ServiceError(ctx) => ctx.raw().status().as_u16() == status,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_codes_map_to_taxonomy() {
        assert!(matches!(
            classify_code("op", "NoSuchKey", "m"),
            Error::NotFound(_)
        ));
        assert!(matches!(
            classify_code("op", "BucketAlreadyOwnedByYou", "m"),
            Error::AlreadyExists(_)
        ));
        assert!(matches!(
            classify_code("op", "BucketNotEmpty", "m"),
            Error::FailedPrecondition(_)
        ));
        assert!(matches!(
            classify_code("op", "AccessDenied", "m"),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_code("op", "EntityTooLarge", "m"),
            Error::InvalidArgument(_)
        ));
        assert!(matches!(
            classify_code("op", "SlowDown", "m"),
            Error::ResourceExhausted(_)
        ));
        assert!(matches!(
            classify_code("op", "SomethingNovel", "m"),
            Error::Internal(_)
        ));
    }

    #[test]
    fn details_carry_operation_context() {
        let err = classify_code("create_bucket", "NoSuchBucket", "missing");
        assert_eq!(err.to_string(), "not found: create_bucket: missing");
    }
}
