//! CSMS Node - OCPP 1.6-J central system
//!
//! Accepts charge points over WebSocket at `ws://<listen>/ocpp/{identity}`.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (no stations known, every boot is rejected)
//! csms-node
//!
//! # Known stations and a durable transaction ledger
//! csms-node --stations stations.json --ledger data/transactions.jsonl
//!
//! # Short timers for bench testing
//! csms-node --stations stations.json --heartbeat-interval 30 --offline-grace 60
//! ```
//!
//! # Stations File
//!
//! ```json
//! {
//!   "stations": [
//!     { "identity": "CP-1", "vendor": "Acme", "model": "X1", "connectors": 2,
//!       "ratePerKwh": 0.35, "authKey": "secret" }
//!   ],
//!   "idTags": [ { "idTag": "TAG-1" } ]
//! }
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use csms_core::{
    CentralSystem, CsmsConfig, InMemoryLedger, JsonlLedger, SessionLedger, Server,
    StaticAuthorizer, StaticDirectory, StationsFile,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// OCPP 1.6-J central system
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket listen address
    #[arg(short, long, default_value = "0.0.0.0:9000")]
    listen: SocketAddr,

    /// Stations file (JSON: stations and id tags)
    #[arg(short, long)]
    stations: Option<PathBuf>,

    /// Transaction ledger file (JSON lines). In-memory when omitted.
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// Heartbeat interval handed to accepted charge points (seconds)
    #[arg(long, default_value = "300")]
    heartbeat_interval: u32,

    /// How long an offline charge point keeps its transactions (seconds)
    #[arg(long, default_value = "300")]
    offline_grace: u64,

    /// How long a call to a charge point waits for its answer (seconds)
    #[arg(long, default_value = "30")]
    response_timeout: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let stations_label = args
        .stations
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(none)".to_string());
    let ledger_label = args
        .ledger
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(in memory)".to_string());

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              CSMS Node - OCPP 1.6-J Central System           ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:   {:<50} ║", args.listen);
    println!("║  Stations: {:<50} ║", truncate(&stations_label, 50));
    println!("║  Ledger:   {:<50} ║", truncate(&ledger_label, 50));
    println!("║  Heartbeat:{:<50} ║", format!(" {}s", args.heartbeat_interval));
    println!("║  Grace:    {:<50} ║", format!("{}s", args.offline_grace));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration
    let config = CsmsConfig::new()
        .with_listen_addr(args.listen)
        .with_heartbeat_interval(args.heartbeat_interval)
        .with_offline_grace(Duration::from_secs(args.offline_grace))
        .with_response_timeout(Duration::from_secs(args.response_timeout));

    let (directory, authorizer) = match &args.stations {
        Some(path) => {
            let (directory, authorizer) = StationsFile::load(path)?.into_parts();
            info!("Loaded {} stations from {}", directory.len(), path.display());
            (directory, authorizer)
        }
        None => (StaticDirectory::default(), StaticAuthorizer::accept_all()),
    };

    let mut builder = CentralSystem::builder()
        .config(config)
        .directory(Arc::new(directory))
        .authorizer(Arc::new(authorizer));

    let ledger: Arc<dyn SessionLedger> = match &args.ledger {
        Some(path) => {
            let recovered = JsonlLedger::recover(path)?;
            builder = builder.restore(recovered);
            Arc::new(JsonlLedger::open(path)?)
        }
        None => Arc::new(InMemoryLedger::new()),
    };

    let central = Arc::new(builder.ledger(ledger).build());
    info!(
        "Starting central system, {} open transactions restored",
        central.coordinator().active_count()
    );

    let server = Server::bind(Arc::clone(&central)).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("Listener failed: {}", e);
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    central.shutdown();
    Ok(())
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
