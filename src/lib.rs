pub mod config;
pub mod error;
pub mod db;
pub mod store;
pub mod index;
pub mod search;
pub mod fingerprint;
pub mod ingest;
pub mod embeddings;
pub mod cache;
pub mod sync;

pub use config::Config;
pub use error::{RagsyncError, Result};
pub use sync::{CancelFlag, IndexReport, IndexRequest, Pipeline};
