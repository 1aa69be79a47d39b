//! Common utilities and types shared across rdmsync modules.
//!
//! Error taxonomy, dataset identifiers and credentials, hash algorithms and
//! the engine configuration.

pub mod config;
pub mod error;
pub mod hash;
pub mod stream;
pub mod types;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use hash::{ByteStream, DualDigest, DualHasher, HashType, Hasher, NOT_NEEDED, PENDING};
pub use types::{Credentials, DatasetId, NEW_DATASET_SUFFIX};
