use anyhow::Context;
use bazaar_catalog::{Catalog, SlugAllocator};
use bazaar_storage::Storage;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod metrics;
mod persist;
mod routes;

use config::Config;
use routes::AppState;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::parse();
    let filter = EnvFilter::try_new(&cfg.log).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    cfg.validate()?;

    let store: Arc<dyn Storage> = Arc::new(persist::open_store(cfg.data_dir.as_deref())?);
    let slugs = SlugAllocator::new(cfg.max_slug_attempts);
    let catalog = Arc::new(Catalog::marketplace(store.clone(), slugs).await?);

    if let Some(dir) = &cfg.data_dir {
        persist::spawn_snapshotter(store.clone(), dir.clone(), cfg.snapshot_interval());
        info!(dir = %dir.display(), every_secs = cfg.snapshot_interval_secs, "snapshots scheduled");
    }

    let app = routes::router(AppState {
        catalog,
        data_dir: cfg.data_dir.clone(),
    });

    let handle = axum_server::Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone()));

    info!(addr = %cfg.listen, tls = cfg.tls().is_some(), "http listening");
    match cfg.tls() {
        Some((cert, key)) => {
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                .await
                .with_context(|| format!("loading TLS material from {}", cert.display()))?;
            axum_server::bind_rustls(cfg.listen, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            axum_server::bind(cfg.listen)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
    }

    if let Some(dir) = cfg.data_dir {
        match persist::snapshot_now(store, dir).await {
            Ok(m) => info!(path = %m.path, documents = m.documents, "final snapshot written"),
            Err(e) => error!(error = %e, "final snapshot failed"),
        }
    }
    Ok(())
}

async fn shutdown_on_signal(handle: axum_server::Handle) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for shutdown signal");
        return;
    }
    info!("shutting down");
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}
