//! moquette: run executables in response to MQTT messages
//!
//! ## Architecture
//! ```text
//! [broker] --(publish)--> [moquette] --(spawn)--> /etc/moquette.d/<pattern>
//!    ^                                                   |
//!    +------------(PUB on fd 3)--------------------------+
//! ```
//!
//! ## Configuration
//! - moquette.yaml / --config / MOQUETTE_CONFIG: configuration file
//! - MOQUETTE__<SECTION>__<KEY>: per-key overrides
//! - MOQUETTE_LOG: tracing filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use moquette::bus::init_bus;
use moquette::config::{Cli, Config};
use moquette::dispatcher::Dispatcher;
use moquette::process::ProcessRegistry;
use moquette::router::Router;
use moquette::utils::bootstrap::init_tracing;

/// How long to wait for killed handlers to be reaped on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    init_tracing(config.debug);

    let router = Router::from_config(&config.routes)?;
    let bus = init_bus(&config.messaging).await?;
    let registry = Arc::new(ProcessRegistry::new());

    let dispatcher = Dispatcher::new(router, Arc::clone(&bus), Arc::clone(&registry))
        .with_handler_timeout(config.dispatcher.handler_timeout());

    bus.subscribe(&config.messaging.mqtt.subscription, Arc::new(dispatcher))
        .await?;
    bus.start_consuming().await?;

    info!(
        routes = %config.routes.dir.display(),
        separator = %config.routes.separator,
        "moquette started"
    );

    tokio::signal::ctrl_c().await?;

    let killed = registry.kill_all().await;
    info!(killed, "Shutting down");

    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while !registry.is_empty().await && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Ok(())
}
