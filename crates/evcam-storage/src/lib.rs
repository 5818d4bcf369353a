//! evcam-storage: OpenDAL-backed object store for sealed footage

pub mod blob;
pub mod health;
pub mod operator;

pub use blob::{BlobStore, ObjectQuery, StoreError, StoreResult, StoredObject};
pub use health::{check_health, is_healthy};
pub use operator::{build_from_core_config, build_operator, S3Credentials};
