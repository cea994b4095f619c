//! Persistent analysis cache for the audio sample organizer
//!
//! Feature extraction is the expensive part of organizing a sample library.
//! This crate remembers per-file analysis results across runs:
//! - Cache keys derived from file metadata or a content sample
//! - A single versioned document persisted atomically, binary or JSON
//! - Expiration at load and least-recently-used eviction by size
//! - Optional background persistence with a bounded shutdown
//!
//! # Overview
//!
//! A [`CacheManager`] is shared between worker threads. Lookups never fail:
//! a file that changed, vanished, or cannot be keyed is simply a miss, and a
//! storage backend that stops working only costs persistence.
//!
//! ```no_run
//! use organizer_cache::{CacheManager, CacheSettings, EnvOverrides};
//!
//! let settings = CacheSettings::from_file("config.json")?
//!     .with_overrides(EnvOverrides::from_env());
//! let cache = CacheManager::new(settings);
//!
//! if cache.get("samples/kick.wav").is_none() {
//!     cache.put("samples/kick.wav", &serde_json::json!({"duration": 0.42}));
//! }
//! cache.shutdown();
//! # Ok::<(), organizer_cache::Error>(())
//! ```

mod config;
mod document;
mod error;
mod extractor;
mod key;
mod manager;
mod storage;
mod value;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use config::{CacheSettings, EnvOverrides};
pub use document::{CacheDocument, CacheEntry, DOCUMENT_VERSION, DocumentMetadata, PersistedEntry};
pub use extractor::{CachedExtractor, FeatureExtractor};
pub use key::{CacheKey, ContentKey, DEFAULT_SAMPLE_SIZE, KeyStrategy, KeyStrategyKind, MetadataKey};
pub use manager::{CacheManager, CacheStats};
pub use storage::{FileStorage, StorageBackend, StorageFormat};
pub use value::to_portable;
