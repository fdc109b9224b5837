use chrono::Utc;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use paylifecycle::application::{LifecycleEngine, Stores};
use paylifecycle::config::EngineConfig;
use paylifecycle::domain::risk::SeededNoise;
use paylifecycle::infrastructure::clock::ManualClock;
use paylifecycle::interfaces::csv::command_reader::CommandReader;
use paylifecycle::interfaces::dispatch;
use paylifecycle::interfaces::output::ResultWriter;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input commands CSV file
    input: PathBuf,

    /// JSON configuration file. Environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Adds seeded noise to risk scores, for simulation runs only.
    #[arg(long)]
    simulate_seed: Option<u64>,
}

const SIMULATION_SPREAD: i32 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    config.apply_overrides(|key| std::env::var(key).ok())?;

    let stores = open_stores(cli.db_path)?;
    let clock = ManualClock::new(Utc::now());
    let mut engine = LifecycleEngine::new(stores, config).with_clock(clock.clone());
    if let Some(seed) = cli.simulate_seed {
        tracing::warn!(seed, "risk scores include simulated noise");
        engine = engine.with_noise(SeededNoise::new(seed, SIMULATION_SPREAD));
    }
    engine.seed_catalog().await?;

    let file = File::open(cli.input).into_diagnostic()?;
    let reader = CommandReader::new(file);
    let stdout = io::stdout();
    let mut writer = ResultWriter::new(stdout.lock());

    for (index, command) in reader.commands().enumerate() {
        let line = index + 1;
        match command {
            Ok(command) => {
                let op = command.op.to_string();
                match dispatch::execute(&engine, &clock, command).await {
                    Ok(result) => writer.write_ok(line, &op, result).into_diagnostic()?,
                    Err(e) => {
                        eprintln!("Error processing command on line {line}: {e}");
                        writer.write_err(line, &op, &e).into_diagnostic()?;
                    }
                }
            }
            Err(e) => {
                eprintln!("Error reading command on line {line}: {e}");
            }
        }
    }

    Ok(())
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    use paylifecycle::infrastructure::rocksdb::RocksDBStore;

    Ok(match db_path {
        Some(path) => Stores::rocksdb(RocksDBStore::open(path)?),
        None => Stores::in_memory(),
    })
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(Stores::in_memory())
}
