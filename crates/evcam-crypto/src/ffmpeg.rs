//! [`VideoBackend`] backed by the `ffprobe` and `ffmpeg` binaries.
//!
//! Segments are probed by writing them to a scratch file. The sink keeps every
//! accepted segment on disk and encodes them in one pass on `finish`, resampled
//! to the fps and frame size of the first valid chunk.

use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;
use tracing::debug;

use crate::error::{CryptoError, CryptoResult};
use crate::playback::{PlaybackSink, VideoBackend, VideoProps};

#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl FfmpegBackend {
    /// Use explicit binary locations instead of looking them up on `PATH`.
    pub fn with_binaries(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    fn probe_file(&self, path: &Path) -> Option<VideoProps> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height,avg_frame_rate,r_frame_rate",
                "-of",
                "json",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| debug!(error = %e, "ffprobe could not be started"))
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_probe(&output.stdout)
    }
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
}

fn parse_probe(stdout: &[u8]) -> Option<VideoProps> {
    let probe: ProbeOutput = serde_json::from_slice(stdout).ok()?;
    let stream = probe.streams.into_iter().next()?;
    let fps = [stream.avg_frame_rate, stream.r_frame_rate]
        .into_iter()
        .flatten()
        .filter_map(|r| parse_rate(&r))
        .find(|fps| *fps > 0.0)?;
    let props = VideoProps {
        fps,
        width: stream.width?,
        height: stream.height?,
    };
    props.is_valid().then_some(props)
}

/// Parse an ffprobe rate such as `30000/1001` or `25`.
fn parse_rate(rate: &str) -> Option<f64> {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            (den != 0.0).then(|| num / den)
        }
        None => rate.trim().parse().ok(),
    }
}

impl VideoBackend for FfmpegBackend {
    fn probe(&self, segment: &[u8]) -> Option<VideoProps> {
        if segment.is_empty() {
            return None;
        }
        let mut scratch = tempfile::Builder::new()
            .prefix("evcam-probe-")
            .suffix(".mp4")
            .tempfile()
            .ok()?;
        scratch.write_all(segment).ok()?;
        scratch.flush().ok()?;
        self.probe_file(scratch.path())
    }

    fn open_sink(&self, output: &Path, props: VideoProps) -> CryptoResult<Box<dyn PlaybackSink>> {
        let workdir = tempfile::Builder::new().prefix("evcam-concat-").tempdir()?;
        Ok(Box::new(FfmpegSink {
            backend: self.clone(),
            output: output.to_path_buf(),
            props,
            workdir,
            segments: Vec::new(),
        }))
    }
}

struct FfmpegSink {
    backend: FfmpegBackend,
    output: PathBuf,
    props: VideoProps,
    workdir: TempDir,
    segments: Vec<PathBuf>,
}

impl PlaybackSink for FfmpegSink {
    fn append(&mut self, segment: &[u8]) -> CryptoResult<()> {
        let path = self
            .workdir
            .path()
            .join(format!("seg{:06}.mp4", self.segments.len()));
        std::fs::write(&path, segment)?;
        if self.backend.probe_file(&path).is_none() {
            std::fs::remove_file(&path)?;
            return Err(CryptoError::Video("segment has no decodable video stream".into()));
        }
        self.segments.push(path);
        Ok(())
    }

    fn finish(self: Box<Self>) -> CryptoResult<()> {
        let list = self.workdir.path().join("segments.txt");
        let mut body = String::new();
        for seg in &self.segments {
            body.push_str(&format!("file '{}'\n", seg.display()));
        }
        std::fs::write(&list, body)?;

        let filter = format!(
            "fps={},scale={}:{}",
            self.props.fps, self.props.width, self.props.height
        );
        let status = Command::new(&self.backend.ffmpeg)
            .args(["-y", "-v", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(&list)
            .args(["-vf", &filter, "-an", "-c:v", "mpeg4", "-q:v", "2", "-f", "mp4"])
            .arg(&self.output)
            .stdin(Stdio::null())
            .status()
            .map_err(|e| CryptoError::Video(format!("spawning ffmpeg: {e}")))?;
        if !status.success() {
            return Err(CryptoError::Video(format!("ffmpeg exited with {status}")));
        }
        debug!(segments = self.segments.len(), output = %self.output.display(), "ffmpeg concat done");
        Ok(())
    }
}
