//! evcamd: motion-clip pipeline and authenticated footage streaming
//!
//! The binary in `main.rs` wires these modules together; they are exposed as
//! a library so the HTTP surface can be driven in-process by integration tests.

pub mod auth;
pub mod daemon;
pub mod error;
pub mod http;
pub mod metrics;
pub mod pipeline;
pub mod plates;
pub mod stream;

pub use error::ServiceError;
