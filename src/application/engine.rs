use super::locks::KeyedLocks;
use crate::config::EngineConfig;
use crate::domain::customer::Customer;
use crate::domain::invoice::Invoice;
use crate::domain::payment::{IdempotencyRecord, Payment, Refund};
use crate::domain::plan::Plan;
use crate::domain::ports::{
    ChargeGateway, ChargeGatewayBox, Clock, NoiseSource, Record, RecordStoreBox, RiskLedgerBox,
    Versioned,
};
use crate::domain::risk::ZeroNoise;
use crate::domain::subscription::Subscription;
use crate::error::{EngineError, Result};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::gateway::ApproveAllGateway;
use crate::infrastructure::in_memory::{InMemoryRecordStore, InMemoryRiskLedger};
use chrono::{DateTime, Utc};
use tracing::info;

/// Every store the engine reads and writes.
pub struct Stores {
    pub plans: RecordStoreBox<Plan>,
    pub customers: RecordStoreBox<Customer>,
    pub subscriptions: RecordStoreBox<Subscription>,
    pub payments: RecordStoreBox<Payment>,
    pub refunds: RecordStoreBox<Refund>,
    pub invoices: RecordStoreBox<Invoice>,
    pub idempotency: RecordStoreBox<IdempotencyRecord>,
    pub risk_ledger: RiskLedgerBox,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            plans: Box::new(InMemoryRecordStore::new()),
            customers: Box::new(InMemoryRecordStore::new()),
            subscriptions: Box::new(InMemoryRecordStore::new()),
            payments: Box::new(InMemoryRecordStore::new()),
            refunds: Box::new(InMemoryRecordStore::new()),
            invoices: Box::new(InMemoryRecordStore::new()),
            idempotency: Box::new(InMemoryRecordStore::new()),
            risk_ledger: Box::new(InMemoryRiskLedger::new()),
        }
    }

    /// All stores backed by one RocksDB instance, one column family each.
    #[cfg(feature = "storage-rocksdb")]
    pub fn rocksdb(store: crate::infrastructure::rocksdb::RocksDBStore) -> Self {
        Self {
            plans: Box::new(store.clone()),
            customers: Box::new(store.clone()),
            subscriptions: Box::new(store.clone()),
            payments: Box::new(store.clone()),
            refunds: Box::new(store.clone()),
            invoices: Box::new(store.clone()),
            idempotency: Box::new(store.clone()),
            risk_ledger: Box::new(store),
        }
    }
}

/// The entry point for every lifecycle operation.
///
/// `LifecycleEngine` composes risk scoring, the payment and subscription state
/// machines and the invoice generator. It is `Send + Sync`; callers share it
/// behind an `Arc` and call it concurrently.
///
/// Writes to one entity are serialized through [`KeyedLocks`]. Each mutation
/// is applied to a copy of the stored record and committed with a versioned
/// compare-and-swap, so a dropped operation leaves the stored copy untouched
/// and a lost race surfaces as [`EngineError::ConcurrencyConflict`].
pub struct LifecycleEngine {
    pub(super) stores: Stores,
    pub(super) config: EngineConfig,
    pub(super) clock: Box<dyn Clock>,
    pub(super) gateway: ChargeGatewayBox,
    pub(super) noise: Box<dyn NoiseSource>,
    pub(super) locks: KeyedLocks,
}

impl LifecycleEngine {
    /// Creates an engine using the system clock, a gateway that approves every
    /// capture and no risk noise.
    pub fn new(stores: Stores, config: EngineConfig) -> Self {
        Self {
            stores,
            config,
            clock: Box::new(SystemClock),
            gateway: Box::new(ApproveAllGateway),
            noise: Box::new(ZeroNoise),
            locks: KeyedLocks::new(),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_gateway(mut self, gateway: impl ChargeGateway + 'static) -> Self {
        self.gateway = Box::new(gateway);
        self
    }

    pub fn with_noise(mut self, noise: impl NoiseSource + 'static) -> Self {
        self.noise = Box::new(noise);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Inserts the configured catalog plans that are not stored yet.
    ///
    /// Existing plans are left alone, so reopening a persistent store keeps
    /// administrative changes. Returns the number of plans inserted.
    pub async fn seed_catalog(&self) -> Result<usize> {
        let mut inserted = 0;
        for plan in &self.config.catalog {
            if self.stores.plans.get(&plan.id).await?.is_none()
                && self.stores.plans.compare_and_swap(0, plan.clone()).await?
            {
                inserted += 1;
            }
        }
        if inserted > 0 {
            info!(inserted, "seeded plan catalog");
        }
        Ok(inserted)
    }

    pub(super) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Reads `id` or fails with `NotFoundError`.
pub(super) async fn fetch<T: Record>(
    store: &RecordStoreBox<T>,
    entity: &'static str,
    id: &str,
) -> Result<Versioned<T>> {
    store
        .get(id)
        .await?
        .ok_or_else(|| EngineError::not_found(entity, id))
}

/// Writes `record` if it is still at `expected_version`. Returns the new version.
pub(super) async fn commit<T: Record>(
    store: &RecordStoreBox<T>,
    entity: &'static str,
    expected_version: u64,
    record: T,
) -> Result<u64> {
    let id = record.key().to_string();
    if store.compare_and_swap(expected_version, record).await? {
        Ok(expected_version + 1)
    } else {
        Err(EngineError::ConcurrencyConflict { entity, id })
    }
}

pub(super) fn subscription_lock(id: &str) -> String {
    format!("subscription:{id}")
}

pub(super) fn payment_lock(id: &str) -> String {
    format!("payment:{id}")
}

pub(super) fn customer_lock(id: &str) -> String {
    format!("customer:{id}")
}

pub(super) fn plan_lock(id: &str) -> String {
    format!("plan:{id}")
}

pub(super) fn transaction_lock(id: &str) -> String {
    format!("transaction:{id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::clock::ManualClock;
    use chrono::TimeZone;

    fn engine() -> LifecycleEngine {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
        LifecycleEngine::new(Stores::in_memory(), EngineConfig::default()).with_clock(clock)
    }

    #[tokio::test]
    async fn test_seed_catalog_is_idempotent() {
        let engine = engine();
        assert_eq!(engine.seed_catalog().await.unwrap(), 3);
        assert_eq!(engine.seed_catalog().await.unwrap(), 0);
        assert_eq!(engine.stores.plans.all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_commit_detects_stale_version() {
        let engine = engine();
        engine.seed_catalog().await.unwrap();
        let stored = fetch(&engine.stores.plans, "plan", "plan_basic").await.unwrap();

        commit(&engine.stores.plans, "plan", stored.version, stored.record.clone())
            .await
            .unwrap();
        let stale = commit(&engine.stores.plans, "plan", stored.version, stored.record).await;
        assert!(matches!(
            stale,
            Err(EngineError::ConcurrencyConflict { entity: "plan", .. })
        ));

        assert!(matches!(
            fetch(&engine.stores.plans, "plan", "plan_gold").await,
            Err(EngineError::NotFoundError { .. })
        ));
    }

    #[test]
    fn test_engine_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LifecycleEngine>();
    }
}
