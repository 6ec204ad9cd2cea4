//! End-to-end behaviour of the shared RPC envelope: caller validation,
//! tenant name derivation, and audit emission compose the way every
//! adapter relies on.

use std::sync::Arc;

use manifold_core::audit::AuditStatus;
use manifold_core::{tenant, AdapterContext, AuditSink, Error, RequireUserId};

fn context(audit: &AuditSink) -> AdapterContext {
    AdapterContext::new("minio", Arc::new(RequireUserId), audit.clone())
}

#[tokio::test]
async fn tenant_isolation_holds_across_users() {
    // Identical logical names, distinct users: physical namespaces are
    // disjoint everywhere a name is derived.
    let alice = tenant::bucket("alice", "shared").unwrap();
    let bob = tenant::bucket("bob", "shared").unwrap();
    assert_ne!(alice, bob);

    // And listings translate back to the logical name only for the owner.
    assert_eq!(tenant::strip_bucket("alice", &alice).as_deref(), Some("shared"));
    assert_eq!(tenant::strip_bucket("alice", &bob), None);
}

#[tokio::test]
async fn successful_rpc_leaves_exactly_one_audit_record() {
    let audit = AuditSink::new(16);
    let ctx = context(&audit);

    let scope = ctx.begin("create_bucket", "alice", "acme").unwrap();
    let result: manifold_core::Result<()> = Ok(());
    ctx.finish(scope, &result);

    let records = audit.drain(16);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].adapter, "minio");
    assert_eq!(records[0].operation, "create_bucket");
    assert_eq!(records[0].status, AuditStatus::Ok);
}

#[tokio::test]
async fn failed_rpc_records_the_error_kind() {
    let audit = AuditSink::new(16);
    let ctx = context(&audit);

    let scope = ctx.begin("get_object", "alice", "").unwrap();
    let result: manifold_core::Result<()> =
        Err(Error::NotFound("object 'a.txt' not found".into()));
    ctx.finish(scope, &result);

    let records = audit.drain(16);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, AuditStatus::Error);
    assert_eq!(records[0].error_code, Some("not_found"));
}

#[tokio::test]
async fn unauthenticated_rpc_is_rejected_before_any_side_effect() {
    let audit = AuditSink::new(16);
    let ctx = context(&audit);

    let status = ctx.begin("delete_bucket", "", "acme").unwrap_err();
    assert_eq!(status.code(), tonic::Code::PermissionDenied);
    assert_eq!(audit.buffered(), 0);
    assert_eq!(audit.dropped(), 0);
}
