//! Daemon lifecycle: key, store, pipeline workers, HTTP service, shutdown

use anyhow::{Context, Result};
use chrono::FixedOffset;
use evcam_core::config::EvcamConfig;
use evcam_crypto::{load_or_create_key, FfmpegBackend};
use evcam_storage::{build_from_core_config, BlobStore, S3Credentials};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::auth::ClaimsVerifier;
use crate::http::{self, AppState};
use crate::metrics::{self, HealthState, ServiceMetrics};
use crate::pipeline::Pipeline;
use crate::stream::StreamService;

pub async fn run(config: EvcamConfig) -> Result<()> {
    info!("daemon starting");
    let paths = config.paths.resolve();

    for dir in [&paths.raw_dir, &paths.logs_dir, &paths.work_dir, &paths.dec_out] {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    // Fatal when unavailable: nothing can be sealed or played back without it
    let key = Arc::new(load_or_create_key(&paths.key_path)?);
    info!(path = %paths.key_path.display(), "footage key ready");

    let verifier = Arc::new(ClaimsVerifier::from_config(&config.auth)?);

    let op = build_from_core_config(&config.storage, &paths.data_dir, S3Credentials::from_env().as_ref())
        .context("building storage operator")?;
    match evcam_storage::check_health(&op).await {
        Ok(()) => info!(backend = ?config.storage.backend, "object store: connected"),
        Err(e) => warn!(backend = ?config.storage.backend, "object store: {e} (will retry per request)"),
    }
    let store = BlobStore::new(op.clone());

    let mut registry = Registry::default();
    let service_metrics = ServiceMetrics::register(&mut registry);
    let health = HealthState {
        registry: Arc::new(registry),
        operator: op,
    };
    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let health = health.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr, health).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    let offset = FixedOffset::east_opt(config.search.utc_offset_minutes * 60)
        .context("search.utc_offset_minutes out of range")?;
    let service = Arc::new(StreamService::new(
        store.clone(),
        key.clone(),
        Arc::new(FfmpegBackend::default()),
        paths.dec_out.clone(),
        offset,
        service_metrics.clone(),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let workers = Pipeline::new(
        config.pipeline.clone(),
        paths.clone(),
        key,
        store,
        service_metrics,
    )
    .spawn(&shutdown_tx);
    info!(
        camera = %config.pipeline.camera_id,
        workers = workers.len(),
        "pipeline running"
    );

    let app = http::router(AppState { service, verifier }, health);
    let mut http_shutdown = shutdown_tx.subscribe();
    let mut server = tokio::spawn({
        let listen = config.daemon.listen.clone();
        async move {
            http::serve(&listen, app, async move {
                let _ = http_shutdown.recv().await;
            })
            .await
        }
    });

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    let early_exit = tokio::select! {
        _ = sigterm.recv() => { info!("received SIGTERM"); None }
        _ = sigint.recv() => { info!("received SIGINT"); None }
        res = &mut server => Some(res),
    };
    let _ = shutdown_tx.send(());

    for worker in workers {
        if let Err(e) = worker.await {
            warn!("worker ended abnormally: {e}");
        }
    }
    let served = match early_exit {
        Some(res) => res,
        None => server.await,
    };
    served.context("http task")??;

    info!("daemon exiting cleanly");
    Ok(())
}
