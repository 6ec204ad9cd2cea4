//! Audit emission.
//!
//! `emit` is non-blocking and best-effort: records land in a bounded ring
//! buffer which drops its oldest entry on overflow, and a background
//! shipper drains batches to the log aggregator's push API. A failure to
//! ship increments a counter and is otherwise invisible to the request
//! path. Records never contain payload bodies.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditRecord {
    /// RFC 3339 timestamp.
    pub timestamp: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub organization_id: String,
    pub adapter: &'static str,
    pub operation: &'static str,
    pub status: AuditStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Keys beyond this count are discarded so a single record can't balloon.
const METADATA_MAX_ENTRIES: usize = 16;

impl AuditRecord {
    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        if self.metadata.len() < METADATA_MAX_ENTRIES {
            self.metadata.insert(key.to_string(), value.into());
        }
        self
    }
}

struct Inner {
    buf: Mutex<VecDeque<AuditRecord>>,
    capacity: usize,
    notify: tokio::sync::Notify,
    dropped: AtomicU64,
    ship_failures: AtomicU64,
}

#[derive(Clone)]
pub struct AuditSink {
    inner: Arc<Inner>,
}

impl AuditSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                buf: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                notify: tokio::sync::Notify::new(),
                dropped: AtomicU64::new(0),
                ship_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue a record. Never blocks; on overflow the oldest record is
    /// dropped and the drop counter incremented.
    pub fn emit(&self, record: AuditRecord) {
        let mut buf = self.inner.buf.lock().unwrap();
        if buf.len() >= self.inner.capacity {
            buf.pop_front();
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("audit_records_dropped_total").increment(1);
        }
        buf.push_back(record);
        drop(buf);
        self.inner.notify.notify_one();
    }

    /// Remove and return up to `max` buffered records.
    pub fn drain(&self, max: usize) -> Vec<AuditRecord> {
        let mut buf = self.inner.buf.lock().unwrap();
        let n = buf.len().min(max);
        buf.drain(..n).collect()
    }

    pub fn buffered(&self) -> usize {
        self.inner.buf.lock().unwrap().len()
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn ship_failures(&self) -> u64 {
        self.inner.ship_failures.load(Ordering::Relaxed)
    }

    /// Run the shipping loop until cancelled, posting batches to the log
    /// aggregator's push endpoint. A final drain runs on cancellation.
    pub async fn run_shipper(self, loki_url: String, service: String, cancel: CancellationToken) {
        let http = reqwest::Client::new();
        let push_url = format!("{}/loki/api/v1/push", loki_url.trim_end_matches('/'));

        loop {
            tokio::select! {
                _ = self.inner.notify.notified() => (),
                _ = tokio::time::sleep(Duration::from_secs(1)) => (),
                _ = cancel.cancelled() => {
                    self.ship_batch(&http, &push_url, &service).await;
                    return;
                }
            }
            self.ship_batch(&http, &push_url, &service).await;
        }
    }

    async fn ship_batch(&self, http: &reqwest::Client, push_url: &str, service: &str) {
        const BATCH: usize = 256;

        let records = self.drain(BATCH);
        if records.is_empty() {
            return;
        }

        let now_ns = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_string();
        let values: Vec<[String; 2]> = records
            .iter()
            .map(|r| {
                let line = serde_json::to_string(r).unwrap_or_default();
                [now_ns.clone(), line]
            })
            .collect();
        let batch_len = values.len();

        let body = serde_json::json!({
            "streams": [{
                "stream": { "service": service, "source": "audit" },
                "values": values,
            }]
        });

        let result = http
            .post(push_url)
            .json(&body)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        if let Err(err) = result {
            self.inner.ship_failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("audit_ship_failures_total").increment(1);
            tracing::debug!(%err, records = batch_len, "failed to ship audit batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(op: &'static str) -> AuditRecord {
        AuditRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            user_id: "alice".to_string(),
            organization_id: String::new(),
            adapter: "object_store",
            operation: op,
            status: AuditStatus::Ok,
            error_code: None,
            duration_ms: 3,
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let sink = AuditSink::new(2);
        sink.emit(record("first"));
        sink.emit(record("second"));
        sink.emit(record("third"));

        assert_eq!(sink.dropped(), 1);
        let drained = sink.drain(16);
        let ops: Vec<_> = drained.iter().map(|r| r.operation).collect();
        assert_eq!(ops, vec!["second", "third"]);
    }

    #[tokio::test]
    async fn drain_is_bounded() {
        let sink = AuditSink::new(8);
        for _ in 0..5 {
            sink.emit(record("op"));
        }
        assert_eq!(sink.drain(3).len(), 3);
        assert_eq!(sink.buffered(), 2);
    }

    #[test]
    fn metadata_is_bounded() {
        let mut r = record("op");
        for i in 0..METADATA_MAX_ENTRIES + 4 {
            r = r.with_metadata(&format!("k{i}"), "v");
        }
        assert_eq!(r.metadata.len(), METADATA_MAX_ENTRIES);
    }

    #[test]
    fn records_serialize_without_payload_fields() {
        let json = serde_json::to_value(record("put_object")).unwrap();
        assert_eq!(json["adapter"], "object_store");
        assert_eq!(json["status"], "ok");
        assert!(json.get("error_code").is_none());
    }
}
