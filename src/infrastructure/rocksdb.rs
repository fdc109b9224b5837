use crate::domain::customer::Customer;
use crate::domain::invoice::Invoice;
use crate::domain::payment::{IdempotencyRecord, Payment, Refund};
use crate::domain::plan::Plan;
use crate::domain::ports::{Record, RecordStore, RiskLedger, Versioned};
use crate::domain::risk::RiskAssessment;
use crate::domain::subscription::Subscription;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Column Family for the append-only risk ledger.
pub const CF_RISK_LEDGER: &str = "risk_ledger";

/// Every column family the store needs, one per record kind plus the ledger.
pub fn column_families() -> [&'static str; 8] {
    [
        Plan::KIND,
        Customer::KIND,
        Subscription::KIND,
        Payment::KIND,
        Refund::KIND,
        Invoice::KIND,
        IdempotencyRecord::KIND,
        CF_RISK_LEDGER,
    ]
}

/// A persistent store implementation using RocksDB.
///
/// Each record kind lives in its own Column Family, keyed by the record key,
/// with the JSON-encoded `Versioned<T>` as value. Ledger entries are keyed by a
/// big-endian sequence number so iteration follows append order.
///
/// RocksDB has no native compare-and-swap, so record writes go through one
/// async mutex; reads never take it. Ledger appends only claim a sequence
/// number and never block on record writes. This struct is thread-safe (`Clone` shares the
/// underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
    ledger_seq: Arc<AtomicU64>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that every required column family exists and resumes the ledger
    /// sequence after the last stored entry.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        let next_seq = {
            let cf = db.cf_handle(CF_RISK_LEDGER).ok_or_else(|| missing_cf(CF_RISK_LEDGER))?;
            match db.iterator_cf(cf, IteratorMode::End).next() {
                Some(item) => {
                    let (key, _) = item?;
                    decode_seq(&key)? + 1
                }
                None => 0,
            }
        };

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
            ledger_seq: Arc::new(AtomicU64::new(next_seq)),
        })
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| missing_cf(name))
    }

    fn read<T: Record>(&self, key: &str) -> Result<Option<Versioned<T>>> {
        let cf = self.cf(T::KIND)?;
        match self.db.get_pinned_cf(cf, key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write<T: Record>(&self, versioned: &Versioned<T>) -> Result<()> {
        let cf = self.cf(T::KIND)?;
        let value = serde_json::to_vec(versioned)?;
        self.db.put_cf(cf, versioned.record.key().as_bytes(), value)?;
        Ok(())
    }

    fn scan_ledger(&self) -> Result<Vec<RiskAssessment>> {
        let cf = self.cf(CF_RISK_LEDGER)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            entries.push(serde_json::from_slice(&value)?);
        }
        Ok(entries)
    }
}

fn missing_cf(name: &str) -> EngineError {
    EngineError::InternalError(Box::new(std::io::Error::other(format!(
        "{name} column family not found"
    ))))
}

fn decode_seq(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key.try_into().map_err(|_| {
        EngineError::InternalError(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Malformed risk ledger key",
        )))
    })?;
    Ok(u64::from_be_bytes(bytes))
}

#[async_trait]
impl<T: Record> RecordStore<T> for RocksDBStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned<T>>> {
        self.read(key)
    }

    async fn put(&self, record: T) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let version = self
            .read::<T>(record.key())?
            .map_or(0, |current| current.version)
            + 1;
        self.write(&Versioned { version, record })?;
        Ok(version)
    }

    async fn compare_and_swap(&self, expected_version: u64, record: T) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let current = self
            .read::<T>(record.key())?
            .map_or(0, |current| current.version);
        if current != expected_version {
            return Ok(false);
        }
        self.write(&Versioned {
            version: current + 1,
            record,
        })?;
        Ok(true)
    }

    async fn all(&self) -> Result<Vec<T>> {
        let cf = self.cf(T::KIND)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            let versioned: Versioned<T> = serde_json::from_slice(&value)?;
            records.push(versioned.record);
        }
        Ok(records)
    }
}

#[async_trait]
impl RiskLedger for RocksDBStore {
    async fn append(&self, assessment: RiskAssessment) -> Result<()> {
        let cf = self.cf(CF_RISK_LEDGER)?;
        let seq = self.ledger_seq.fetch_add(1, Ordering::SeqCst);
        let value = serde_json::to_vec(&assessment)?;
        self.db.put_cf(cf, seq.to_be_bytes(), value)?;
        Ok(())
    }

    async fn latest_for_transaction(&self, transaction_id: &str) -> Result<Option<RiskAssessment>> {
        Ok(self
            .scan_ledger()?
            .into_iter()
            .rev()
            .find(|a| a.transaction_id == transaction_id))
    }

    async fn history_for_user(&self, user_id: &str) -> Result<Vec<RiskAssessment>> {
        Ok(self
            .scan_ledger()?
            .into_iter()
            .filter(|a| a.user_id == user_id)
            .collect())
    }
}
