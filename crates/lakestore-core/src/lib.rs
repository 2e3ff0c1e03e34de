pub mod auth;
pub mod config;
pub mod dircache;
pub mod engine;
pub mod error;
pub mod hotcache;
pub mod memstore;
pub mod multipart;
pub mod path;
pub mod platform;
pub mod pool;
pub mod resumable;

pub use config::EngineConfig;
pub use engine::{
    Bucket, DeleteOptions, ListEntry, ListOptions, Object, ObjectReader, Store, WriteOptions,
};
pub use error::StoreError;
pub use hotcache::CacheStatsSnapshot;
pub use multipart::{CompletedPart, MultipartUpload, PartInfo};
pub use resumable::{PatchOutcome, ResumableCreate, ResumableError, ResumableInfo};
