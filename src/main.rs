// src/main.rs
//
// guardian - local email-classification sidecar.
//
// Startup order matters: the store must answer before anything else runs
// (fatal otherwise), the node identity comes from the store so it survives
// restarts, and the workers start before the listener so a freshly installed
// node begins pulling the global band index immediately.
//
// Usage:
//   guardian --config /etc/guardian/guardian.conf
//   RUST_LOG=mail_guardian=debug guardian

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mail_guardian::config::{Config, Tunables};
use mail_guardian::oracle::HttpOracle;
use mail_guardian::store::{keys, IndexStore, RedisStore};
use mail_guardian::{api, workers, App, VERSION};

#[derive(Parser)]
#[command(
    name    = "guardian",
    about   = "Local email-classification sidecar",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, help = "Path to the KEY=VALUE configuration file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("mail_guardian=info".parse()?),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let store = RedisStore::connect(&config.redis_host, config.redis_port)
        .await
        .context("index store unreachable, refusing to start")?;
    store.ping().await.context("index store did not answer")?;

    let node_id = init_node(&store).await?;
    info!(version = VERSION, node_id, "engine started");

    let tunables = Tunables::from_config(&config);
    let app = App::new(store, HttpOracle::new(&config.oracle_url), tunables, node_id);

    workers::spawn_all(&app);
    spawn_reload_handler(Arc::clone(&app), config.clone());

    let bind = format!("{}:{}", config.bind_addr, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(%bind, "MTA bridge ready");

    axum::serve(listener, api::router(app)).await?;
    Ok(())
}

/// Stable node identity, minted once and persisted alongside the sync cursor.
async fn init_node(store: &RedisStore) -> Result<String> {
    if let Some(existing) = store.get(keys::NODE_ID).await? {
        if !existing.is_empty() {
            return Ok(existing);
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    store.set(keys::NODE_ID, &id).await?;
    store.set(keys::SYNC_SEQ, "0").await?;
    info!(node_id = %id, "minted new node identity");
    Ok(id)
}

/// SIGHUP re-reads the config file and swaps the runtime tunables; the bind
/// address, store endpoint and oracle URL stay fixed until restart.
fn spawn_reload_handler(app: Arc<App<RedisStore, HttpOracle>>, config: Config) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%err, "reload handler unavailable");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match Config::load(config.path.as_deref()) {
                Ok(fresh) => {
                    app.tunables.apply(&fresh);
                    info!(
                        spam_weight = fresh.spam_weight,
                        ham_weight = fresh.ham_weight,
                        retention_days = fresh.local_retention_days,
                        "configuration reloaded"
                    );
                }
                Err(err) => warn!(%err, "reload failed, keeping current tunables"),
            }
        }
    });

    #[cfg(not(unix))]
    {
        let _ = (app, config);
    }
}
