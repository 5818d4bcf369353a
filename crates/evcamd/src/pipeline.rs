//! Background pipeline: raw clip → staged segment → sealed container → store.
//!
//! Three independent workers talk only through the filesystem and the object
//! store. Each stage looks only at its own input (raw clips matching the
//! configured patterns, then the single staged file), so a restart picks up
//! wherever the previous run stopped. A failed iteration is logged and retried
//! on the next tick.

use anyhow::{Context, Result};
use evcam_core::config::{PipelineConfig, ResolvedPaths};
use evcam_core::types::ObjectMetadata;
use evcam_core::EvcamError;
use evcam_crypto::{ContainerWriter, GlobalHeader, Key, CONTAINER_FORMAT_TAG};
use evcam_storage::{BlobStore, StoredObject};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::metrics::ServiceMetrics;
use crate::plates::read_plate_log;

#[derive(Clone)]
pub struct Pipeline {
    cfg: PipelineConfig,
    paths: ResolvedPaths,
    key: Arc<Key>,
    store: BlobStore,
    metrics: ServiceMetrics,
}

impl Pipeline {
    pub fn new(
        cfg: PipelineConfig,
        paths: ResolvedPaths,
        key: Arc<Key>,
        store: BlobStore,
        metrics: ServiceMetrics,
    ) -> Self {
        Self {
            cfg,
            paths,
            key,
            store,
            metrics,
        }
    }

    /// Spawn all workers; they exit when `shutdown` fires.
    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        if self.cfg.capture_command.is_empty() {
            info!("capture: no capture_command configured, recorder not started");
        } else {
            let p = self.clone();
            let rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move { p.capture_loop(rx).await }));
        }

        let p = self.clone();
        let rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move { p.detect_loop(rx).await }));

        let rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move { self.seal_loop(rx).await }));
        handles
    }

    // ── Capture ──────────────────────────────────────────────────────────

    async fn capture_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        let restart = Duration::from_secs(self.cfg.capture_restart_secs.max(1));
        loop {
            let (program, args) = match self.cfg.capture_command.split_first() {
                Some(split) => split,
                None => return,
            };
            let spawned = Command::new(program)
                .args(args)
                .current_dir(&self.paths.raw_dir)
                .kill_on_drop(true)
                .spawn();

            match spawned {
                Ok(mut child) => {
                    info!(program = %program, pid = ?child.id(), "capture: recorder started");
                    tokio::select! {
                        status = child.wait() => match status {
                            Ok(s) => warn!(status = %s, "capture: recorder exited"),
                            Err(e) => warn!("capture: waiting on recorder: {e}"),
                        },
                        _ = shutdown.recv() => {
                            info!("capture: shutdown, stopping recorder");
                            if let Err(e) = child.kill().await {
                                warn!("capture: kill recorder: {e}");
                            }
                            return;
                        }
                    }
                }
                Err(e) => error!(program = %program, "capture: cannot start recorder: {e}"),
            }

            tokio::select! {
                _ = tokio::time::sleep(restart) => {}
                _ = shutdown.recv() => return,
            }
        }
    }

    // ── Detect ───────────────────────────────────────────────────────────

    async fn detect_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(Duration::from_secs(self.cfg.detect_poll_secs.max(1)));
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.recv() => {
                    info!("detect: shutdown");
                    return;
                }
            }
            match self.detect_once().await {
                Ok(Some(clip)) => debug!(clip = %clip.display(), "detect: clip staged"),
                Ok(None) => {}
                Err(e) => warn!("detect: {e:#}"),
            }
        }
    }

    /// Run detection on the newest raw clip. Returns the clip processed, if any.
    pub async fn detect_once(&self) -> Result<Option<PathBuf>> {
        if self.paths.staged_path.exists() {
            debug!("detect: previous segment still staged, waiting for seal");
            return Ok(None);
        }
        let Some(clip) = newest_raw_clip(&self.paths.raw_dir, &self.cfg.raw_patterns)? else {
            return Ok(None);
        };

        match self.cfg.detect_command.split_first() {
            None => {
                // No detector: stage the clip unchanged
                move_file(&clip, &self.paths.staged_path).await?;
                self.metrics.detected();
                return Ok(Some(clip));
            }
            Some((program, args)) => {
                let status = Command::new(program)
                    .args(args)
                    .arg("--video")
                    .arg(&clip)
                    .current_dir(&self.paths.data_dir)
                    .kill_on_drop(true)
                    .status()
                    .await
                    .with_context(|| format!("starting detector {program}"))?;
                if !status.success() {
                    warn!(clip = %clip.display(), %status, "detect: detector failed, dropping clip");
                }
            }
        }

        let produced = self
            .cfg
            .detect_output
            .clone()
            .unwrap_or_else(|| self.paths.staged_path.clone());
        if produced != self.paths.staged_path && produced.exists() {
            move_file(&produced, &self.paths.staged_path).await?;
        }
        tokio::fs::remove_file(&clip)
            .await
            .with_context(|| format!("removing raw clip {}", clip.display()))?;
        self.metrics.detected();
        Ok(Some(clip))
    }

    // ── Seal ─────────────────────────────────────────────────────────────

    async fn seal_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(Duration::from_secs(self.cfg.seal_poll_secs.max(1)));
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.recv() => {
                    info!("seal: shutdown");
                    return;
                }
            }
            match self.seal_once().await {
                Ok(Some(stored)) => info!(
                    id = %stored.id,
                    filename = %stored.filename,
                    plates = stored.metadata.plate_numbers.len(),
                    "seal: container stored"
                ),
                Ok(None) => {}
                Err(e) => {
                    self.metrics.seal_failed();
                    warn!("seal: {e} (staged segment kept for retry)");
                }
            }
        }
    }

    /// Seal the staged segment into a container and store it.
    ///
    /// Local intermediates are removed only after the store accepted the
    /// container; on failure the staged segment stays for the next attempt.
    pub async fn seal_once(&self) -> Result<Option<StoredObject>, EvcamError> {
        let staged = self.paths.staged_path.clone();
        if !staged.exists() {
            return Ok(None);
        }

        let key = self.key.clone();
        let work_dir = self.paths.work_dir.clone();
        let camera_id = self.cfg.camera_id.clone();
        let staged_for_seal = staged.clone();
        let container_path = tokio::task::spawn_blocking(move || -> Result<PathBuf, EvcamError> {
            let segment = std::fs::read(&staged_for_seal)?;
            std::fs::create_dir_all(&work_dir)?;
            let header = GlobalHeader::new(Some(camera_id));
            let mut writer = ContainerWriter::create_in(&work_dir, &header)
                .map_err(|e| EvcamError::Crypto(e.to_string()))?;
            if let Err(e) = writer.append_chunk(&segment, &key) {
                let path = writer.path().to_path_buf();
                drop(writer);
                discard_partial_container(&path);
                return Err(EvcamError::Crypto(e.to_string()));
            }
            writer.finish().map_err(|e| EvcamError::Crypto(e.to_string()))
        })
        .await
        .map_err(|e| EvcamError::Pipeline(format!("seal task: {e}")))??;

        let result = self.store_container(&container_path).await;
        if let Err(e) = tokio::fs::remove_file(&container_path).await {
            debug!(path = %container_path.display(), "seal: removing local container: {e}");
        }
        let stored = result?;

        remove_if_present(&staged).await?;
        remove_if_present(&self.paths.plate_log).await?;
        self.metrics.sealed();
        Ok(Some(stored))
    }

    async fn store_container(&self, container: &Path) -> Result<StoredObject, EvcamError> {
        let plates = read_plate_log(&self.paths.plate_log)?;
        let bytes = tokio::fs::read(container).await?;
        let filename = container
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let metadata = ObjectMetadata {
            camera_id: Some(self.cfg.camera_id.clone()),
            plate_numbers: plates,
            is_encrypted: true,
            container_format: Some(CONTAINER_FORMAT_TAG.to_string()),
        };
        self.store
            .put(&filename, "application/octet-stream", bytes, metadata)
            .await
            .map_err(|e| EvcamError::Storage(e.to_string()))
    }
}

/// The most recently modified raw clip matching any of `patterns`.
pub fn newest_raw_clip(raw_dir: &Path, patterns: &[String]) -> Result<Option<PathBuf>> {
    let base = glob::Pattern::escape(&raw_dir.to_string_lossy());
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for pattern in patterns {
        let full = format!("{base}/{pattern}");
        for path in glob::glob(&full).with_context(|| format!("bad raw pattern {pattern:?}"))? {
            let Ok(path) = path else { continue };
            let Ok(modified) = std::fs::metadata(&path).and_then(|m| m.modified()) else {
                continue;
            };
            if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                newest = Some((modified, path));
            }
        }
    }
    Ok(newest.map(|(_, p)| p))
}

async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(from, to).await.is_err() {
        // Cross-device: copy then delete
        tokio::fs::copy(from, to)
            .await
            .with_context(|| format!("moving {} to {}", from.display(), to.display()))?;
        tokio::fs::remove_file(from).await?;
    }
    Ok(())
}

/// Remove a container whose append failed. Failures are logged only, the
/// staged segment stays in place either way.
fn discard_partial_container(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "seal: discarded partial container"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "seal: removing partial container: {e}"),
    }
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
