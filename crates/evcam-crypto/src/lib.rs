//! evcam-crypto: footage encryption for the evcam recorder
//!
//! Cipher: AES-256 in EAX mode, 128-bit random nonce, 128-bit detached tag.
//!
//! Container file (`.WattLagGyi`):
//! ```text
//! [4 bytes BE: global header length][global header JSON]
//! repeated:
//!   [4 bytes BE: chunk header length][chunk header JSON]
//!   [16 bytes: nonce][16 bytes: tag][ciphertext, header.file_size bytes]
//! ```
//!
//! Single-frame blob: `[16 bytes: nonce][16 bytes: tag][ciphertext]`, no header.
//!
//! Containers are append-only. A torn trailing chunk is reported as corrupt
//! and every chunk before it stays readable.

pub mod chunk;
pub mod container;
pub mod error;
pub mod ffmpeg;
pub mod keys;
pub mod playback;

pub use chunk::{decode_chunk, encode_chunk, open_frame, seal_frame, ChunkOutcome, CorruptReason};
pub use container::{ContainerReader, ContainerWriter, GlobalHeader, Termination};
pub use error::{CryptoError, CryptoResult};
pub use ffmpeg::FfmpegBackend;
pub use keys::{generate_key, load_or_create_key, Key};
pub use playback::{
    decrypt_blob, decrypt_container, decrypt_single_blob, process_all, BatchReport, BlobFormat,
    PlaybackFile, PlaybackSink, Reassembly, VideoBackend, VideoProps,
};

/// Size of the symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an EAX nonce (128-bit)
pub const NONCE_SIZE: usize = 16;

/// Size of an EAX authentication tag
pub const TAG_SIZE: usize = 16;

/// Metadata tag for multi-chunk containers
pub const CONTAINER_FORMAT_TAG: &str = "WattLagGyi";

/// Metadata tag for bare `[nonce][tag][ciphertext]` blobs
pub const SINGLE_FRAME_FORMAT_TAG: &str = "single-frame";
