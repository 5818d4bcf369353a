//! Per-chunk AES-256-EAX framing
//!
//! Chunk format (binary):
//! ```text
//! [4 bytes BE: header length][header JSON]
//! [16 bytes: random nonce][16 bytes: EAX tag][ciphertext]
//! header.file_size = plaintext length = ciphertext length
//! ```
//!
//! Decoding never fails with an error: every malformed input maps to a
//! `ChunkOutcome` so callers can keep whatever was decoded before it.

use aes::Aes256;
use chrono::{DateTime, Utc};
use eax::aead::{generic_array::GenericArray, AeadInPlace, KeyInit};
use eax::Eax;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::io::Read;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::Key;
use crate::{NONCE_SIZE, TAG_SIZE};

type Cipher = Eax<Aes256>;

/// Largest header accepted when decoding; anything larger is treated as corrupt.
pub const MAX_HEADER_LEN: u32 = 64 * 1024;

/// Per-chunk metadata stored in front of the nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    /// Plaintext (and ciphertext) length in bytes
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_at: Option<DateTime<Utc>>,
}

/// Result of reading one chunk from a stream.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    Chunk(Vec<u8>),
    /// The stream ended exactly on a chunk boundary
    EndOfStream,
    Corrupt(CorruptReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptReason {
    TruncatedLength,
    HeaderTooLarge,
    TruncatedHeader,
    InvalidHeader,
    TruncatedNonce,
    TruncatedTag,
    TruncatedCiphertext,
    /// Tag mismatch: wrong key or tampered bytes
    Authentication,
    Io,
}

impl std::fmt::Display for CorruptReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CorruptReason::TruncatedLength => "truncated length prefix",
            CorruptReason::HeaderTooLarge => "header length exceeds limit",
            CorruptReason::TruncatedHeader => "truncated header",
            CorruptReason::InvalidHeader => "header is not valid JSON",
            CorruptReason::TruncatedNonce => "truncated nonce",
            CorruptReason::TruncatedTag => "truncated tag",
            CorruptReason::TruncatedCiphertext => "truncated ciphertext",
            CorruptReason::Authentication => "authentication failed",
            CorruptReason::Io => "read error",
        };
        f.write_str(s)
    }
}

/// Encrypt `plaintext` into a self-describing chunk.
pub fn encode_chunk(plaintext: &[u8], key: &Key) -> CryptoResult<Vec<u8>> {
    let header = ChunkHeader {
        file_size: plaintext.len() as u64,
        chunk_index: None,
        sealed_at: Some(Utc::now()),
    };
    encode_with_header(&header, plaintext, key)
}

pub(crate) fn encode_with_header(
    header: &ChunkHeader,
    plaintext: &[u8],
    key: &Key,
) -> CryptoResult<Vec<u8>> {
    let header_json = serde_json::to_vec(header)?;
    let (nonce, tag, ciphertext) = seal(plaintext, key)?;

    let mut out =
        Vec::with_capacity(4 + header_json.len() + NONCE_SIZE + TAG_SIZE + ciphertext.len());
    out.extend_from_slice(&(header_json.len() as u32).to_be_bytes());
    out.extend_from_slice(&header_json);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Read and decrypt the next chunk from `reader`.
pub fn decode_chunk<R: Read>(reader: &mut R, key: &Key) -> ChunkOutcome {
    let len_bytes = match read_up_to(reader, 4) {
        Ok(b) if b.is_empty() => return ChunkOutcome::EndOfStream,
        Ok(b) if b.len() < 4 => return ChunkOutcome::Corrupt(CorruptReason::TruncatedLength),
        Ok(b) => b,
        Err(_) => return ChunkOutcome::Corrupt(CorruptReason::Io),
    };
    let header_len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
    if header_len > MAX_HEADER_LEN {
        return ChunkOutcome::Corrupt(CorruptReason::HeaderTooLarge);
    }

    let header_bytes = match read_exact_or(reader, header_len as u64, CorruptReason::TruncatedHeader)
    {
        Ok(b) => b,
        Err(reason) => return ChunkOutcome::Corrupt(reason),
    };
    let header: ChunkHeader = match serde_json::from_slice(&header_bytes) {
        Ok(h) => h,
        Err(_) => return ChunkOutcome::Corrupt(CorruptReason::InvalidHeader),
    };

    let nonce = match read_exact_or(reader, NONCE_SIZE as u64, CorruptReason::TruncatedNonce) {
        Ok(b) => b,
        Err(reason) => return ChunkOutcome::Corrupt(reason),
    };
    let tag = match read_exact_or(reader, TAG_SIZE as u64, CorruptReason::TruncatedTag) {
        Ok(b) => b,
        Err(reason) => return ChunkOutcome::Corrupt(reason),
    };
    let ciphertext =
        match read_exact_or(reader, header.file_size, CorruptReason::TruncatedCiphertext) {
            Ok(b) => b,
            Err(reason) => return ChunkOutcome::Corrupt(reason),
        };

    match open(&nonce, &tag, ciphertext, key) {
        Some(plaintext) => ChunkOutcome::Chunk(plaintext),
        None => ChunkOutcome::Corrupt(CorruptReason::Authentication),
    }
}

/// Encrypt into the header-less single-frame layout `[nonce][tag][ciphertext]`.
pub fn seal_frame(plaintext: &[u8], key: &Key) -> CryptoResult<Vec<u8>> {
    let (nonce, tag, ciphertext) = seal(plaintext, key)?;
    let mut out = Vec::with_capacity(NONCE_SIZE + TAG_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a single-frame blob. Returns `None` for short, empty, or
/// unauthenticated input.
pub fn open_frame(blob: &[u8], key: &Key) -> Option<Vec<u8>> {
    if blob.len() <= NONCE_SIZE + TAG_SIZE {
        return None;
    }
    let (nonce, rest) = blob.split_at(NONCE_SIZE);
    let (tag, ciphertext) = rest.split_at(TAG_SIZE);
    open(nonce, tag, ciphertext.to_vec(), key)
}

fn seal(plaintext: &[u8], key: &Key) -> CryptoResult<([u8; NONCE_SIZE], [u8; TAG_SIZE], Vec<u8>)> {
    let cipher = Cipher::new(GenericArray::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buffer)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(&tag);
    Ok((nonce, tag_bytes, buffer))
}

fn open(nonce: &[u8], tag: &[u8], mut buffer: Vec<u8>, key: &Key) -> Option<Vec<u8>> {
    let cipher = Cipher::new(GenericArray::from_slice(key.as_bytes()));
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            b"",
            &mut buffer,
            GenericArray::from_slice(tag),
        )
        .ok()?;
    Some(buffer)
}

/// Read at most `n` bytes; fewer means the stream ended.
fn read_up_to<R: Read>(reader: &mut R, n: u64) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.by_ref().take(n).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Read exactly `n` bytes without trusting `n` for preallocation.
fn read_exact_or<R: Read>(reader: &mut R, n: u64, short: CorruptReason) -> Result<Vec<u8>, CorruptReason> {
    match read_up_to(reader, n) {
        Ok(buf) if buf.len() as u64 == n => Ok(buf),
        Ok(_) => Err(short),
        Err(_) => Err(CorruptReason::Io),
    }
}
