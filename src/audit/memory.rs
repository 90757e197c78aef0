use std::sync::Mutex;

use async_trait::async_trait;

use super::{AuditFilter, AuditRecord, AuditStore};
use crate::error::GateError;

/// In-process audit store. Not durable; for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything appended so far, in order.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, mut record: AuditRecord) -> Result<AuditRecord, GateError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        record.seq = records.len() as u64 + 1;
        records.push(record.clone());
        Ok(record)
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, GateError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(filter.apply(records.iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditOutcome, AuditStage};

    #[tokio::test]
    async fn sequence_numbers_follow_append_order() {
        let store = MemoryAuditStore::new();
        let first = store
            .append(AuditRecord::new(AuditStage::Validation, AuditOutcome::Rejected, "a", "x"))
            .await
            .unwrap();
        let second = store
            .append(AuditRecord::new(AuditStage::Queued, AuditOutcome::Accepted, "b", "x"))
            .await
            .unwrap();
        assert_eq!((first.seq, second.seq), (1, 2));

        let all = store.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 2]);
    }
}
