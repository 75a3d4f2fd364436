//! Mantrap - a protocol-aware honeypot connection manager
//!
//! Accepts anything on any probed port and keeps attackers talking:
//! - SYN-triggered on-demand TCP listeners
//! - Sniff-then-route dispatch with TLS auto-unwrap
//! - Deduplicated capture of initial bytes and driver sessions

use anyhow::Result;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mantrap::config::Config;
use mantrap::drivers::{HttpDriver, SshDriver};
use mantrap::manager::ConnectionManager;
use mantrap::observer;
use mantrap::router::RegistryBuilder;
use mantrap::store::{start_store, Store};
use mantrap::tls::TlsIdentity;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let level = config.logging.level.parse().unwrap_or(Level::INFO);
    FmtSubscriber::builder().with_max_level(level).init();

    info!("Starting mantrap...");

    // Artifact sinks behind the single-consumer store task
    let store = Store::new(&config.capture, &config.s3)?;
    let store_tx = start_store(store);

    // Process-wide self-signed identity for TLS auto-unwrap
    let tls = TlsIdentity::generate()?;

    // Every driver registers before the first listener accepts
    let registry = RegistryBuilder::new()
        .register(HttpDriver)
        .register(SshDriver)
        .start();

    let manager = ConnectionManager::new(config, registry, tls, store_tx)?;

    // Ports that listen whether or not a SYN was ever observed
    manager.preopen().await;

    // The raw socket observer materializes the rest on demand
    observer::start(manager.clone());

    info!("mantrap running");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    Ok(())
}
