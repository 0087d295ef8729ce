use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use relay_core::config::RelayConfig;
use relay_correlator::{
    AsyncCorrelator, DrainSettings, ProgressCorrelator, WaitNotifyEngine,
};
use relay_iterator::{ChannelHandler, Entity, IteratorRegistry, IteratorSpec, WorkClaimStore};
use tracing::{info, warn};

mod app;
mod http;
mod rpc;

#[derive(Debug, Parser)]
#[command(name = "relay-gateway", version, about = "Task relay gateway")]
struct Args {
    /// Config file; defaults to $RELAY_CONFIG, then ~/.relay/relay.toml.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "relay_gateway=info,relay_iterator=info,relay_correlator=info,relay_dispatch=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    // load config: --config > RELAY_CONFIG env > ~/.relay/relay.toml
    let args = Args::parse();
    let config_path = args.config.or_else(|| std::env::var("RELAY_CONFIG").ok());
    let config = RelayConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        RelayConfig::default()
    });

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let db_path = config.database.path.clone();
    let busy_ms = config.database.busy_timeout_ms;
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");

    // Claimed entities: iterators → delivery task
    let (claimed_tx, claimed_rx) = tokio::sync::mpsc::channel::<Entity>(256);
    let claim_store = Arc::new(WorkClaimStore::new(app::open_db(&db_path, busy_ms)?));
    let mut registry = IteratorRegistry::new(claim_store);
    for cfg in &config.iterators {
        let spec = match IteratorSpec::from_config(cfg) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(iterator = %cfg.name, "skipping iterator: {e}");
                continue;
            }
        };
        if let Err(e) =
            registry.register_iterator(spec, Arc::new(ChannelHandler::new(claimed_tx.clone())))
        {
            warn!(iterator = %cfg.name, "skipping iterator: {e}");
        }
    }
    drop(claimed_tx);
    let iterator_names = registry.names().into_iter().map(String::from).collect();

    let state = Arc::new(app::AppState::open(config, iterator_names)?);
    let settings = |poll| DrainSettings::new(&state.config.correlator, poll);
    let notifier: Arc<dyn WaitNotifyEngine> = state.hub.clone();
    let async_correlator = Arc::new(AsyncCorrelator::new(
        Arc::clone(&state.responses),
        Arc::clone(&notifier),
        settings(state.config.correlator.async_poll_interval()),
    ));
    let progress_correlator = Arc::new(ProgressCorrelator::new(
        Arc::clone(&state.responses),
        notifier,
        settings(state.config.correlator.progress_poll_interval()),
    ));

    // Claimed entities fan out to `GET /progress/{entity_type}` pollers.
    app::spawn_entity_delivery(Arc::clone(&state), claimed_rx);

    // Background loops share one shutdown signal.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = registry.start_all(shutdown_rx.clone());
    handles.push(tokio::spawn(
        Arc::clone(&state.waiter).run(shutdown_rx.clone()),
    ));
    handles.push(tokio::spawn(async_correlator.run(shutdown_rx.clone())));
    handles.push(tokio::spawn(progress_correlator.run(shutdown_rx)));
    info!(
        iterators = state.iterators.len(),
        "background loops started"
    );

    let router = app::build_router(Arc::clone(&state));
    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!(%addr, "relay gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {e}");
            }
        })
        .await?;

    info!("shutting down background loops");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("background loop ended abnormally: {e}");
        }
    }
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), "could not create database directory: {e}");
            }
        }
    }
}
