//! Turn stored ciphertext back into a playable video file.
//!
//! Containers hold one video segment per chunk. The first chunk whose video
//! properties can be probed fixes fps and frame size for the output; every
//! decodable chunk from there on is appended in order. Video decoding itself
//! sits behind [`VideoBackend`].

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::{debug, info, warn};

use crate::chunk::open_frame;
use crate::container::{ContainerReader, Termination, CONTAINER_EXTENSION};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::Key;
use crate::{CONTAINER_FORMAT_TAG, SINGLE_FRAME_FORMAT_TAG};

/// Frame rate and frame size of a video segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoProps {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

impl VideoProps {
    pub fn is_valid(&self) -> bool {
        self.fps > 0.0 && self.width > 0 && self.height > 0
    }
}

/// Video decoding/encoding used to stitch container chunks together.
pub trait VideoBackend: Send + Sync {
    /// Probe a segment; `None` when it is not decodable video.
    fn probe(&self, segment: &[u8]) -> Option<VideoProps>;

    /// Open an output at `output` with fixed properties.
    fn open_sink(&self, output: &Path, props: VideoProps) -> CryptoResult<Box<dyn PlaybackSink>>;
}

/// Output video being assembled from consecutive segments.
pub trait PlaybackSink {
    /// Decode `segment` and append its frames.
    fn append(&mut self, segment: &[u8]) -> CryptoResult<()>;

    /// Finalize the output file.
    fn finish(self: Box<Self>) -> CryptoResult<()>;
}

/// A decrypted playback file. The file is deleted when this value is dropped
/// unless it is persisted first.
#[derive(Debug)]
pub struct PlaybackFile {
    path: TempPath,
    /// Number of chunks that made it into the output
    pub segments: usize,
}

impl PlaybackFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file at `target` instead of deleting it on drop.
    pub fn persist(self, target: &Path) -> CryptoResult<()> {
        self.path.persist(target).map_err(|e| CryptoError::Io(e.error))
    }

    /// Hand over the scoped path, e.g. to tie its lifetime to a response body.
    pub fn into_temp_path(self) -> TempPath {
        self.path
    }
}

/// Result of reassembling a container.
#[derive(Debug)]
pub enum Reassembly {
    Playable(PlaybackFile),
    /// No chunk produced valid video; nothing was written
    NoPlayableContent,
}

/// How a stored blob is laid out, as recorded in its metadata tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobFormat {
    Container,
    SingleFrame,
    /// Untagged legacy object: try single-frame, then container
    Unknown,
}

impl BlobFormat {
    pub fn from_tag(tag: Option<&str>) -> Self {
        match tag {
            Some(t) if t.eq_ignore_ascii_case(CONTAINER_FORMAT_TAG) => BlobFormat::Container,
            Some(t) if t.eq_ignore_ascii_case(SINGLE_FRAME_FORMAT_TAG) => BlobFormat::SingleFrame,
            _ => BlobFormat::Unknown,
        }
    }
}

/// Decrypt a container file into a playback file inside `out_dir`.
pub fn decrypt_container(
    path: &Path,
    key: &Key,
    backend: &dyn VideoBackend,
    out_dir: &Path,
) -> CryptoResult<Reassembly> {
    let file = File::open(path)?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("footage");
    reassemble(BufReader::new(file), key, backend, out_dir, stem)
}

/// Decrypt a header-less `[nonce][tag][ciphertext]` blob into a playback file.
///
/// Returns `None` when the blob does not authenticate under `key`.
pub fn decrypt_single_blob(
    blob: &[u8],
    key: &Key,
    out_dir: &Path,
) -> CryptoResult<Option<PlaybackFile>> {
    let Some(plaintext) = open_frame(blob, key) else {
        return Ok(None);
    };
    let mut tmp = playback_temp(out_dir, "blob")?;
    tmp.write_all(&plaintext)?;
    tmp.as_file().sync_all()?;
    Ok(Some(PlaybackFile {
        path: tmp.into_temp_path(),
        segments: 1,
    }))
}

/// Decrypt a stored blob using its format tag to pick the layout.
///
/// `Ok(None)` means the blob is undecryptable under every applicable layout.
pub fn decrypt_blob(
    blob: &[u8],
    key: &Key,
    format: BlobFormat,
    backend: &dyn VideoBackend,
    out_dir: &Path,
) -> CryptoResult<Option<PlaybackFile>> {
    if matches!(format, BlobFormat::SingleFrame | BlobFormat::Unknown) {
        if let Some(file) = decrypt_single_blob(blob, key, out_dir)? {
            return Ok(Some(file));
        }
        if format == BlobFormat::SingleFrame {
            return Ok(None);
        }
        debug!("blob is not a single frame, trying container layout");
    }

    match reassemble(blob, key, backend, out_dir, "container")? {
        Reassembly::Playable(file) => Ok(Some(file)),
        Reassembly::NoPlayableContent => Ok(None),
    }
}

/// Per-run totals from [`process_all`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub decrypted: Vec<PathBuf>,
    pub empty: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Decrypt every container in `enc_folder` into `<stem>.mp4` under `out_dir`.
pub fn process_all(
    enc_folder: &Path,
    out_dir: &Path,
    key: &Key,
    backend: &dyn VideoBackend,
) -> CryptoResult<BatchReport> {
    std::fs::create_dir_all(out_dir)?;
    let suffix = format!(".{}", CONTAINER_EXTENSION.to_ascii_lowercase());
    let mut containers: Vec<PathBuf> = std::fs::read_dir(enc_folder)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.to_ascii_lowercase().ends_with(&suffix))
        })
        .collect();
    containers.sort();

    let mut report = BatchReport::default();
    for container in containers {
        let target = out_dir.join(container.with_extension("mp4").file_name().unwrap_or_default());
        match decrypt_container(&container, key, backend, out_dir) {
            Ok(Reassembly::Playable(file)) => {
                file.persist(&target)?;
                info!(container = %container.display(), output = %target.display(), "decrypted");
                report.decrypted.push(target);
            }
            Ok(Reassembly::NoPlayableContent) => {
                info!(container = %container.display(), "no valid video");
                report.empty.push(container);
            }
            Err(e) => {
                warn!(container = %container.display(), error = %e, "decryption failed");
                report.failed.push(container);
            }
        }
    }
    Ok(report)
}

fn reassemble<R: Read>(
    reader: R,
    key: &Key,
    backend: &dyn VideoBackend,
    out_dir: &Path,
    stem: &str,
) -> CryptoResult<Reassembly> {
    let mut chunks = ContainerReader::new(reader, key);
    let mut output: Option<(TempPath, Box<dyn PlaybackSink>)> = None;
    let mut written = 0usize;
    let mut skipped = 0usize;

    for (index, segment) in chunks.by_ref().enumerate() {
        if output.is_none() {
            let props = match backend.probe(&segment) {
                Some(p) if p.is_valid() => p,
                _ => {
                    debug!(index, "chunk has no usable video properties, skipping");
                    skipped += 1;
                    continue;
                }
            };
            let path = playback_temp(out_dir, stem)?.into_temp_path();
            let sink = backend.open_sink(&path, props)?;
            debug!(index, fps = props.fps, width = props.width, height = props.height, "output opened");
            output = Some((path, sink));
        }

        if let Some((_, sink)) = output.as_mut() {
            match sink.append(&segment) {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!(index, error = %e, "chunk could not be decoded as video, skipping");
                    skipped += 1;
                }
            }
        }
    }

    if let Some(Termination::Corrupt(reason)) = chunks.termination() {
        debug!(%reason, written, "container ended early");
    }

    match output {
        Some((path, sink)) => {
            sink.finish()?;
            debug!(written, skipped, "playback assembled");
            Ok(Reassembly::Playable(PlaybackFile {
                path,
                segments: written,
            }))
        }
        None => Ok(Reassembly::NoPlayableContent),
    }
}

fn playback_temp(out_dir: &Path, stem: &str) -> CryptoResult<tempfile::NamedTempFile> {
    std::fs::create_dir_all(out_dir)?;
    Ok(tempfile::Builder::new()
        .prefix(&format!("{stem}-"))
        .suffix(".mp4")
        .tempfile_in(out_dir)?)
}
