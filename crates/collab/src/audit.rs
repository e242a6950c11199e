//! Audit sinks — in-memory, no-op, and always-failing implementations.
//!
//! The loop must behave identically whether persistence works, silently
//! drops records, or fails outright; these three sinks cover all of that
//! in tests and demos.

use async_trait::async_trait;
use delver_core::error::AuditError;
use delver_core::{AuditRecord, AuditSink};
use std::sync::RwLock;
use uuid::Uuid;

/// Stores records in memory and hands back generated ids.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: RwLock<Vec<(String, AuditRecord)>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All persisted records, in insertion order.
    pub fn records(&self) -> Vec<(String, AuditRecord)> {
        self.records.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn persist(&self, record: AuditRecord) -> Result<Option<String>, AuditError> {
        let id = Uuid::new_v4().to_string();
        self.records.write().unwrap().push((id.clone(), record));
        Ok(Some(id))
    }
}

/// Accepts everything, stores nothing, yields no durable ids.
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn persist(&self, _record: AuditRecord) -> Result<Option<String>, AuditError> {
        Ok(None)
    }
}

/// Fails every persist — for exercising the loop's degraded-persistence
/// path.
pub struct RejectingAuditSink;

#[async_trait]
impl AuditSink for RejectingAuditSink {
    async fn persist(&self, _record: AuditRecord) -> Result<Option<String>, AuditError> {
        Err(AuditError::Storage("rejecting sink".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delver_core::RunId;

    fn record() -> AuditRecord {
        AuditRecord::PlanStep {
            run_id: RunId::from("run-1"),
            iteration: 1,
            tool_name: "web_search".into(),
            rationale: "test".into(),
            args: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn memory_sink_returns_ids_and_keeps_records() {
        let sink = MemoryAuditSink::new();
        let id = sink.persist(record()).await.unwrap();
        assert!(id.is_some());
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn noop_sink_yields_no_id() {
        let sink = NoopAuditSink;
        let id = sink.persist(record()).await.unwrap();
        assert!(id.is_none());
    }

    #[tokio::test]
    async fn rejecting_sink_errors() {
        let sink = RejectingAuditSink;
        assert!(sink.persist(record()).await.is_err());
    }
}
