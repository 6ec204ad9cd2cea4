//! The per-RPC envelope shared by every adapter: validate the caller,
//! time the call, then record exactly one audit record and one metrics
//! observation per terminal outcome.
//!
//! Unauthenticated calls return `PermissionDenied` before any side effect
//! and produce no audit record, so an unauthenticated caller cannot spoof
//! log entries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::audit::{AuditRecord, AuditSink, AuditStatus};
use crate::auth::AuthValidator;
use crate::error::Result;

#[derive(Clone)]
pub struct AdapterContext {
    pub adapter: &'static str,
    auth: Arc<dyn AuthValidator>,
    audit: AuditSink,
}

/// Live accounting for one in-flight RPC, produced by [`AdapterContext::begin`].
pub struct RpcScope {
    operation: &'static str,
    user_id: String,
    organization_id: String,
    started: Instant,
    metadata: BTreeMap<String, String>,
}

impl RpcScope {
    /// Attach a small piece of context (never a payload) to the eventual
    /// audit record.
    pub fn annotate(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}

impl AdapterContext {
    pub fn new(adapter: &'static str, auth: Arc<dyn AuthValidator>, audit: AuditSink) -> Self {
        Self {
            adapter,
            auth,
            audit,
        }
    }

    /// Validate the caller and open an RPC scope. A validation failure is
    /// returned as a ready-to-send `Status` and leaves no trace in the
    /// audit stream.
    pub fn begin(
        &self,
        operation: &'static str,
        user_id: &str,
        organization_id: &str,
    ) -> std::result::Result<RpcScope, tonic::Status> {
        self.auth.validate(user_id).map_err(tonic::Status::from)?;
        Ok(RpcScope {
            operation,
            user_id: user_id.to_string(),
            organization_id: organization_id.to_string(),
            started: Instant::now(),
            metadata: BTreeMap::new(),
        })
    }

    /// Close the scope: emit the single audit record for this terminal
    /// outcome and record request metrics.
    pub fn finish<T>(&self, scope: RpcScope, result: &Result<T>) {
        let elapsed = scope.started.elapsed();
        let (status, error_code) = match result {
            Ok(_) => (AuditStatus::Ok, None),
            Err(err) => (AuditStatus::Error, Some(err.kind())),
        };
        let status_label = match status {
            AuditStatus::Ok => "ok",
            AuditStatus::Error => "error",
        };

        metrics::counter!(
            "rpc_total",
            "adapter" => self.adapter,
            "operation" => scope.operation,
            "status" => status_label,
        )
        .increment(1);
        metrics::histogram!(
            "rpc_duration_seconds",
            "adapter" => self.adapter,
            "operation" => scope.operation,
        )
        .record(elapsed.as_secs_f64());

        if let Err(err) = result {
            tracing::debug!(
                adapter = self.adapter,
                operation = scope.operation,
                user_id = %scope.user_id,
                error = %err,
                "rpc failed"
            );
        }

        self.audit.emit(AuditRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            user_id: scope.user_id,
            organization_id: scope.organization_id,
            adapter: self.adapter,
            operation: scope.operation,
            status,
            error_code,
            duration_ms: elapsed.as_millis() as u64,
            metadata: scope.metadata,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RequireUserId;
    use crate::error::Error;

    fn context(audit: &AuditSink) -> AdapterContext {
        AdapterContext::new("cache", Arc::new(RequireUserId), audit.clone())
    }

    #[tokio::test]
    async fn unauthenticated_calls_leave_no_audit() {
        let audit = AuditSink::new(8);
        let ctx = context(&audit);

        let status = ctx.begin("get", "", "").unwrap_err();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
        assert_eq!(audit.buffered(), 0);
    }

    #[tokio::test]
    async fn each_outcome_emits_exactly_one_record() {
        let audit = AuditSink::new(8);
        let ctx = context(&audit);

        let scope = ctx.begin("get", "alice", "acme").unwrap();
        ctx.finish(scope, &Ok(()));

        let scope = ctx.begin("get", "alice", "acme").unwrap();
        ctx.finish::<()>(scope, &Err(Error::NotFound("missing".into())));

        let records = audit.drain(16);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, AuditStatus::Ok);
        assert_eq!(records[0].error_code, None);
        assert_eq!(records[1].status, AuditStatus::Error);
        assert_eq!(records[1].error_code, Some("not_found"));
    }

    #[tokio::test]
    async fn annotations_land_in_the_record() {
        let audit = AuditSink::new(8);
        let ctx = context(&audit);

        let mut scope = ctx.begin("create_bucket", "alice", "").unwrap();
        scope.annotate("bucket", "photos");
        ctx.finish(scope, &Ok(()));

        let records = audit.drain(1);
        assert_eq!(records[0].metadata.get("bucket").map(String::as_str), Some("photos"));
    }
}
