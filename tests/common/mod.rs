#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use paylifecycle::application::{LifecycleEngine, Stores};
use paylifecycle::config::EngineConfig;
use paylifecycle::domain::customer::{Customer, NewCustomer};
use paylifecycle::domain::ports::ChargeGateway;
use paylifecycle::infrastructure::clock::ManualClock;
use std::fs::File;
use std::io::Error;
use std::path::Path;

pub fn april_first() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
}

/// An in-memory engine with the default catalog and a clock the test controls.
pub async fn engine_with(config: EngineConfig) -> (LifecycleEngine, ManualClock) {
    let clock = ManualClock::new(april_first());
    let engine = LifecycleEngine::new(Stores::in_memory(), config).with_clock(clock.clone());
    engine.seed_catalog().await.unwrap();
    (engine, clock)
}

pub async fn engine() -> (LifecycleEngine, ManualClock) {
    engine_with(EngineConfig::default()).await
}

pub async fn engine_with_gateway(
    gateway: impl ChargeGateway + 'static,
) -> (LifecycleEngine, ManualClock) {
    let clock = ManualClock::new(april_first());
    let engine = LifecycleEngine::new(Stores::in_memory(), EngineConfig::default())
        .with_clock(clock.clone())
        .with_gateway(gateway);
    engine.seed_catalog().await.unwrap();
    (engine, clock)
}

pub async fn register(engine: &LifecycleEngine, id: &str, verified: bool) -> Customer {
    engine
        .register_customer(NewCustomer {
            id: Some(id.to_string()),
            name: format!("Customer {id}"),
            email: format!("{id}@example.com"),
            verified,
            ..Default::default()
        })
        .await
        .unwrap()
}

/// Writes a command CSV with the given header and rows.
pub fn write_commands(path: &Path, header: &[&str], rows: &[&[&str]]) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().flexible(true).from_writer(file);

    wtr.write_record(header)?;
    for row in rows {
        wtr.write_record(*row)?;
    }

    wtr.flush()?;
    Ok(())
}
