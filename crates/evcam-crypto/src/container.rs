//! Append-only footage containers
//!
//! A container is a global header followed by independently encrypted chunks.
//! Every append writes one complete chunk with a single `write_all` and syncs
//! it, so a crash can only ever leave a torn *trailing* chunk behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::chunk::{
    decode_chunk, encode_with_header, ChunkHeader, ChunkOutcome, CorruptReason, MAX_HEADER_LEN,
};
use crate::error::CryptoResult;
use crate::keys::Key;
use crate::{CONTAINER_FORMAT_TAG, NONCE_SIZE, TAG_SIZE};

pub const FORMAT_VERSION: u32 = 1;

/// File extension used for containers on local disk.
pub const CONTAINER_EXTENSION: &str = "WattLagGyi";

/// Container-level metadata written once at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalHeader {
    pub format: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<String>,
}

impl GlobalHeader {
    pub fn new(camera_id: Option<String>) -> Self {
        Self {
            format: CONTAINER_FORMAT_TAG.into(),
            version: FORMAT_VERSION,
            created_at: Some(Utc::now()),
            camera_id,
        }
    }

    fn to_prefixed_bytes(&self) -> CryptoResult<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let mut out = Vec::with_capacity(4 + json.len());
        out.extend_from_slice(&(json.len() as u32).to_be_bytes());
        out.extend_from_slice(&json);
        Ok(out)
    }
}

/// Handle for appending chunks to a container file.
#[derive(Debug)]
pub struct ContainerWriter {
    path: PathBuf,
    file: File,
    chunks: u64,
}

impl ContainerWriter {
    /// Create a new container at `path`. Fails if the file already exists.
    pub fn create(path: &Path, header: &GlobalHeader) -> CryptoResult<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(&header.to_prefixed_bytes()?)?;
        file.sync_data()?;
        debug!(path = %path.display(), "container created");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            chunks: 0,
        })
    }

    /// Create a uniquely named container inside `dir`.
    pub fn create_in(dir: &Path, header: &GlobalHeader) -> CryptoResult<Self> {
        std::fs::create_dir_all(dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let camera = header.camera_id.as_deref().unwrap_or("footage");
        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{camera}_{stamp}.{CONTAINER_EXTENSION}")
            } else {
                format!("{camera}_{stamp}_{attempt}.{CONTAINER_EXTENSION}")
            };
            match Self::create(&dir.join(name), header) {
                Err(crate::CryptoError::Io(e))
                    if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 100 =>
                {
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Reopen an existing container for appending.
    ///
    /// Chunk framing is walked without decrypting; a torn trailing chunk left
    /// by an interrupted append is cut off so new chunks land on a boundary.
    pub fn open_append(path: &Path) -> CryptoResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let (valid_len, chunks) = scan_frames(&mut file)?;
        let actual_len = file.metadata()?.len();
        if valid_len < actual_len {
            warn!(
                path = %path.display(),
                torn_bytes = actual_len - valid_len,
                "truncating torn trailing chunk"
            );
            file.set_len(valid_len)?;
        }
        file.seek(SeekFrom::Start(valid_len))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            chunks,
        })
    }

    /// Encrypt one footage segment and append it as the next chunk.
    ///
    /// Returns the zero-based index of the appended chunk.
    pub fn append_chunk(&mut self, segment: &[u8], key: &Key) -> CryptoResult<u64> {
        let index = self.chunks;
        let header = ChunkHeader {
            file_size: segment.len() as u64,
            chunk_index: Some(index),
            sealed_at: Some(Utc::now()),
        };
        let frame = encode_with_header(&header, segment, key)?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        self.chunks += 1;
        debug!(path = %self.path.display(), index, bytes = segment.len(), "chunk appended");
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunks
    }

    /// Flush everything to disk and release the handle.
    pub fn finish(self) -> CryptoResult<PathBuf> {
        self.file.sync_all()?;
        Ok(self.path)
    }
}

/// Walk the container framing, returning the byte length of the well-formed
/// prefix and how many complete chunks it holds.
fn scan_frames(file: &mut File) -> CryptoResult<(u64, u64)> {
    let total = file.metadata()?.len();
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(file);

    let global_len = read_len(&mut reader)?.filter(|len| 4 + *len as u64 <= total);
    let Some(global_len) = global_len else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "container has no complete global header",
        )
        .into());
    };
    let mut offset = 4 + global_len as u64;
    reader.seek(SeekFrom::Start(offset))?;

    let mut chunks = 0u64;
    loop {
        let Some(header_len) = read_len(&mut reader)? else {
            break;
        };
        if header_len > MAX_HEADER_LEN || offset + 4 + header_len as u64 > total {
            break;
        }
        let mut header_bytes = vec![0u8; header_len as usize];
        reader.read_exact(&mut header_bytes)?;
        let Ok(header) = serde_json::from_slice::<ChunkHeader>(&header_bytes) else {
            break;
        };
        let end = (offset + 4 + header_len as u64 + (NONCE_SIZE + TAG_SIZE) as u64)
            .checked_add(header.file_size)
            .filter(|end| *end <= total);
        let Some(end) = end else {
            break;
        };
        reader.seek(SeekFrom::Start(end))?;
        offset = end;
        chunks += 1;
    }
    Ok((offset, chunks))
}

fn read_len<R: Read>(reader: &mut R) -> std::io::Result<Option<u32>> {
    let mut buf = [0u8; 4];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(Some(u32::from_be_bytes(buf))),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// How a container read stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Ended exactly on a chunk boundary
    Clean,
    /// Stopped at an unreadable chunk; everything before it was yielded
    Corrupt(CorruptReason),
}

/// Iterator over the decrypted chunks of a container, in append order.
pub struct ContainerReader<'k, R> {
    reader: R,
    key: &'k Key,
    header: Option<GlobalHeader>,
    termination: Option<Termination>,
}

impl<'k, R: Read> ContainerReader<'k, R> {
    /// Consume the global header and position the reader at the first chunk.
    pub fn new(mut reader: R, key: &'k Key) -> Self {
        let mut len_buf = [0u8; 4];
        let header_len = match reader.read_exact(&mut len_buf) {
            Ok(()) => u32::from_be_bytes(len_buf),
            Err(_) => {
                return Self::terminated(reader, key, Termination::Corrupt(CorruptReason::TruncatedLength))
            }
        };
        if header_len > MAX_HEADER_LEN {
            return Self::terminated(reader, key, Termination::Corrupt(CorruptReason::HeaderTooLarge));
        }
        let mut header_bytes = Vec::new();
        match reader.by_ref().take(header_len as u64).read_to_end(&mut header_bytes) {
            Ok(n) if n == header_len as usize => {}
            _ => {
                return Self::terminated(reader, key, Termination::Corrupt(CorruptReason::TruncatedHeader))
            }
        }
        let header = match serde_json::from_slice::<GlobalHeader>(&header_bytes) {
            Ok(h) => Some(h),
            Err(e) => {
                debug!("unrecognised global header ({e}), reading chunks anyway");
                None
            }
        };
        Self {
            reader,
            key,
            header,
            termination: None,
        }
    }

    fn terminated(reader: R, key: &'k Key, termination: Termination) -> Self {
        Self {
            reader,
            key,
            header: None,
            termination: Some(termination),
        }
    }

    pub fn header(&self) -> Option<&GlobalHeader> {
        self.header.as_ref()
    }

    /// Set once the iterator has been exhausted.
    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }
}

impl<'k> ContainerReader<'k, BufReader<File>> {
    pub fn open(path: &Path, key: &'k Key) -> CryptoResult<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file), key))
    }
}

impl<R: Read> Iterator for ContainerReader<'_, R> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.termination.is_some() {
            return None;
        }
        match decode_chunk(&mut self.reader, self.key) {
            ChunkOutcome::Chunk(plaintext) => Some(plaintext),
            ChunkOutcome::EndOfStream => {
                self.termination = Some(Termination::Clean);
                None
            }
            ChunkOutcome::Corrupt(reason) => {
                warn!(%reason, "stopping container read at unreadable chunk");
                self.termination = Some(Termination::Corrupt(reason));
                None
            }
        }
    }
}
