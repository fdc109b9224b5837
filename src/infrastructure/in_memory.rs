use crate::domain::ports::{Record, RecordStore, RiskLedger, Versioned};
use crate::domain::risk::RiskAssessment;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory store for any [`Record`].
///
/// Uses `Arc<RwLock<HashMap<String, Versioned<T>>>>` to allow shared concurrent access.
/// Ideal for testing or small datasets where persistence is not required.
#[derive(Clone)]
pub struct InMemoryRecordStore<T> {
    records: Arc<RwLock<HashMap<String, Versioned<T>>>>,
}

impl<T> Default for InMemoryRecordStore<T> {
    fn default() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<T: Record> InMemoryRecordStore<T> {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<T: Record> RecordStore<T> for InMemoryRecordStore<T> {
    async fn get(&self, key: &str) -> Result<Option<Versioned<T>>> {
        let records = self.records.read().await;
        Ok(records.get(key).cloned())
    }

    async fn put(&self, record: T) -> Result<u64> {
        let mut records = self.records.write().await;
        let version = records.get(record.key()).map_or(0, |v| v.version) + 1;
        records.insert(record.key().to_string(), Versioned { version, record });
        Ok(version)
    }

    async fn compare_and_swap(&self, expected_version: u64, record: T) -> Result<bool> {
        let mut records = self.records.write().await;
        let current = records.get(record.key()).map_or(0, |v| v.version);
        if current != expected_version {
            return Ok(false);
        }
        records.insert(
            record.key().to_string(),
            Versioned {
                version: current + 1,
                record,
            },
        );
        Ok(true)
    }

    async fn all(&self) -> Result<Vec<T>> {
        let records = self.records.read().await;
        Ok(records.values().map(|v| v.record.clone()).collect())
    }
}

/// Append-only in-memory risk ledger.
///
/// Entries are only ever pushed; lookups scan the log.
#[derive(Default, Clone)]
pub struct InMemoryRiskLedger {
    entries: Arc<RwLock<Vec<RiskAssessment>>>,
}

impl InMemoryRiskLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RiskLedger for InMemoryRiskLedger {
    async fn append(&self, assessment: RiskAssessment) -> Result<()> {
        self.entries.write().await.push(assessment);
        Ok(())
    }

    async fn latest_for_transaction(&self, transaction_id: &str) -> Result<Option<RiskAssessment>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .rev()
            .find(|a| a.transaction_id == transaction_id)
            .cloned())
    }

    async fn history_for_user(&self, user_id: &str) -> Result<Vec<RiskAssessment>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }
}
