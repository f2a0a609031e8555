pub mod cache;
pub mod chunker;
pub mod compress;
pub mod crypto;
pub mod error;
pub mod index;
pub mod metadata;
pub mod pipeline;
pub mod snapshot;
pub mod storage;
pub mod types;

pub use error::{Error, Result};
pub use snapshot::{Snapshot, SnapshotBuilder};
pub use storage::{Backend, Repository, RepositoryConfig, Transaction, VERSION};
pub use types::*;
