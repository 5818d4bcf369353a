use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EvcamError, EvcamResult};

/// Top-level daemon configuration (loaded from evcam.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvcamConfig {
    pub daemon: DaemonConfig,
    pub paths: PathsConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub auth: AuthConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP listen address for the streaming API (default: 0.0.0.0:5000)
    pub listen: String,
    /// Prometheus metrics endpoint (default: 127.0.0.1:9100)
    pub metrics_addr: Option<String>,
}

/// Filesystem layout. Every path defaults to a location under `data_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    /// 32-byte symmetric key file
    pub key_path: Option<PathBuf>,
    /// Folder scanned by the batch decryptor
    pub enc_folder: Option<PathBuf>,
    /// Folder receiving decrypted playback files
    pub dec_out: Option<PathBuf>,
    /// Folder the recorder drops raw motion clips into
    pub raw_dir: Option<PathBuf>,
}

/// Concrete paths after defaults have been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub enc_folder: PathBuf,
    pub dec_out: PathBuf,
    pub raw_dir: PathBuf,
    pub logs_dir: PathBuf,
    /// Processed segment waiting to be sealed into a container
    pub staged_path: PathBuf,
    pub plate_log: PathBuf,
    /// Scratch folder for containers being assembled before upload
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Fs,
    S3,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root folder for the `fs` backend (default: `<data_dir>/store`)
    pub root: Option<PathBuf>,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Enforce HTTPS for S3 connections (warn/error on HTTP endpoints)
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Camera id stamped on every stored object
    pub camera_id: String,
    /// Recorder command line; empty disables the capture worker
    pub capture_command: Vec<String>,
    /// Delay before restarting an exited recorder
    pub capture_restart_secs: u64,
    /// Plate-detection command line; `--video <path>` is appended
    pub detect_command: Vec<String>,
    /// Where the detector writes its processed segment (default: staged path)
    pub detect_output: Option<PathBuf>,
    /// Raw clip patterns, matched inside `raw_dir`
    pub raw_patterns: Vec<String>,
    pub detect_poll_secs: u64,
    pub seal_poll_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret used to verify claims cookies
    #[serde(skip_serializing, deserialize_with = "deserialize_secret")]
    pub secret_key: Option<SecretString>,
    /// Cookie carrying the signed claims bundle
    pub cookie_name: String,
    /// Clock skew tolerance for token expiry, in seconds
    pub leeway_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Offset of the viewers' local zone from UTC, in minutes (default: +05:30)
    pub utc_offset_minutes: i32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".into(),
            metrics_addr: Some("127.0.0.1:9100".into()),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/evcam"),
            key_path: None,
            enc_folder: None,
            dec_out: None,
            raw_dir: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            root: None,
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "evcam".into(),
            enforce_tls: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            camera_id: "CAM_01".into(),
            capture_command: Vec::new(),
            capture_restart_secs: 5,
            detect_command: Vec::new(),
            detect_output: None,
            raw_patterns: vec!["motion_*.mp4".into(), "motion_*.avi".into()],
            detect_poll_secs: 5,
            seal_poll_secs: 3,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            cookie_name: "ev_token".into(),
            leeway_secs: 0,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 330,
        }
    }
}

impl PathsConfig {
    pub fn resolve(&self) -> ResolvedPaths {
        let data = self.data_dir.clone();
        let raw_dir = self.raw_dir.clone().unwrap_or_else(|| data.join("raw_buffer"));
        let logs_dir = raw_dir.join("logs");
        ResolvedPaths {
            key_path: self
                .key_path
                .clone()
                .unwrap_or_else(|| data.join("configs").join("secret.key")),
            enc_folder: self.enc_folder.clone().unwrap_or_else(|| data.join("encrypted")),
            dec_out: self.dec_out.clone().unwrap_or_else(|| data.join("decrypted")),
            plate_log: logs_dir.join("plate_log.csv"),
            staged_path: data.join("cv2.mp4"),
            work_dir: data.join("containers"),
            logs_dir,
            raw_dir,
            data_dir: data,
        }
    }
}

impl StorageConfig {
    pub fn fs_root(&self, data_dir: &Path) -> PathBuf {
        self.root.clone().unwrap_or_else(|| data_dir.join("store"))
    }
}

impl EvcamConfig {
    /// Parse a TOML document; missing sections fall back to defaults.
    pub fn from_toml_str(content: &str) -> EvcamResult<Self> {
        toml::from_str(content).map_err(|e| EvcamError::Config(e.to_string()))
    }

    /// Apply `EV_*` environment overrides on top of file values.
    pub fn apply_env(&mut self) -> EvcamResult<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> EvcamResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("EV_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("EV_KEY_PATH") {
            self.paths.key_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("EV_ENC_FOLDER") {
            self.paths.enc_folder = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("EV_DEC_OUT") {
            self.paths.dec_out = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("EV_CAMERA_ID") {
            self.pipeline.camera_id = v;
        }
        if let Some(v) = lookup("EV_CV_POLL") {
            self.pipeline.detect_poll_secs = parse_env("EV_CV_POLL", &v)?;
        }
        if let Some(v) = lookup("EV_ENC_POLL") {
            self.pipeline.seal_poll_secs = parse_env("EV_ENC_POLL", &v)?;
        }
        if let Some(v) = lookup("PORT") {
            let port: u16 = parse_env("PORT", &v)?;
            let host = self
                .daemon
                .listen
                .rsplit_once(':')
                .map(|(h, _)| h.to_string())
                .unwrap_or_else(|| "0.0.0.0".into());
            self.daemon.listen = format!("{host}:{port}");
        }
        if let Some(v) = lookup("EV_SECRET_KEY") {
            if !v.is_empty() {
                self.auth.secret_key = Some(SecretString::from(v));
            }
        }
        Ok(())
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(SecretString::from))
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> EvcamResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EvcamError::Config(format!("{name}: invalid value {value:?}")))
}
