//! Cache-aware wrapper around a feature extractor

use crate::CacheManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Computes analysis results for a single audio file
pub trait FeatureExtractor {
    /// Analysis result; must survive the cache's portable value form
    type Output: Serialize + DeserializeOwned;
    /// Extraction failure
    type Error: fmt::Display;

    /// Analyze the file at `path`
    ///
    /// # Errors
    ///
    /// Returns the extractor's error when the file cannot be analyzed.
    fn extract(&self, path: &Path) -> Result<Self::Output, Self::Error>;
}

/// Serves extraction results from a [`CacheManager`] and fills it on misses
#[derive(Debug)]
pub struct CachedExtractor<E> {
    extractor: E,
    cache: Arc<CacheManager>,
    enabled: bool,
}

impl<E: FeatureExtractor> CachedExtractor<E> {
    /// Wrap `extractor`; caching follows the manager's enabled flag
    pub fn new(extractor: E, cache: Arc<CacheManager>) -> Self {
        let enabled = cache.is_enabled();
        Self {
            extractor,
            cache,
            enabled,
        }
    }

    /// Turn caching off when the analysis capability is unavailable, so
    /// fallback results are never persisted
    #[must_use]
    pub fn with_capability(mut self, available: bool) -> Self {
        self.enabled = self.enabled && available;
        self
    }

    /// Whether lookups and stores go through the cache
    #[must_use]
    pub const fn caching(&self) -> bool {
        self.enabled
    }

    /// The shared cache
    #[must_use]
    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// The wrapped extractor
    pub const fn inner(&self) -> &E {
        &self.extractor
    }

    /// Cached result for `path`, computing and storing it on a miss
    ///
    /// Extraction failures are logged and yield `None`; nothing is cached
    /// for them.
    pub fn analyze(&self, path: impl AsRef<Path>) -> Option<E::Output> {
        let path = path.as_ref();
        if self.enabled
            && let Some(cached) = self.cache.get_as::<E::Output>(path)
        {
            debug!(path = %path.display(), "Using cached analysis");
            return Some(cached);
        }

        match self.extractor.extract(path) {
            Ok(output) => {
                if self.enabled {
                    self.cache.put(path, &output);
                }
                Some(output)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Feature extraction failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheSettings;
    use serde::Deserialize;
    use std::cell::Cell;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Features {
        duration: f64,
        mfcc: Vec<Vec<f64>>,
    }

    #[derive(Default)]
    struct CountingExtractor {
        calls: Cell<usize>,
        fail: bool,
        silent: bool,
    }

    impl FeatureExtractor for CountingExtractor {
        type Output = Features;
        type Error = String;

        fn extract(&self, path: &Path) -> Result<Features, String> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return Err(format!("cannot decode {}", path.display()));
            }
            Ok(Features {
                duration: if self.silent { f64::NAN } else { 1.5 },
                mfcc: vec![vec![0.25, -3.5], vec![12.0, 0.0]],
            })
        }
    }

    fn manager(dir: &TempDir) -> Arc<CacheManager> {
        Arc::new(CacheManager::new(CacheSettings {
            cache_file: dir.path().join("cache.json"),
            background_saving: false,
            ..CacheSettings::default()
        }))
    }

    #[test]
    fn second_analysis_comes_from_cache() {
        let dir = TempDir::new().unwrap();
        let sample = dir.path().join("kick.wav");
        fs::write(&sample, b"kick").unwrap();
        let cached = CachedExtractor::new(CountingExtractor::default(), manager(&dir));

        let first = cached.analyze(&sample).unwrap();
        let second = cached.analyze(&sample).unwrap();

        assert_eq!(first, second);
        assert_eq!(cached.inner().calls.get(), 1);
        assert_eq!(cached.cache().stats().hits, 1);
    }

    #[test]
    fn missing_capability_bypasses_cache() {
        let dir = TempDir::new().unwrap();
        let sample = dir.path().join("snare.wav");
        fs::write(&sample, b"snare").unwrap();
        let cached = CachedExtractor::new(CountingExtractor::default(), manager(&dir))
            .with_capability(false);

        assert!(!cached.caching());
        cached.analyze(&sample).unwrap();
        cached.analyze(&sample).unwrap();

        assert_eq!(cached.inner().calls.get(), 2);
        assert!(cached.cache().is_empty());
    }

    #[test]
    fn failures_are_not_cached() {
        let dir = TempDir::new().unwrap();
        let sample = dir.path().join("broken.wav");
        fs::write(&sample, b"garbage").unwrap();
        let extractor = CountingExtractor {
            fail: true,
            ..CountingExtractor::default()
        };
        let cached = CachedExtractor::new(extractor, manager(&dir));

        assert_eq!(cached.analyze(&sample), None);
        assert!(cached.cache().is_empty());
    }

    #[test]
    fn non_finite_results_are_returned_but_not_cached() {
        let dir = TempDir::new().unwrap();
        let sample = dir.path().join("silence.wav");
        fs::write(&sample, [0u8; 16]).unwrap();
        let extractor = CountingExtractor {
            silent: true,
            ..CountingExtractor::default()
        };
        let cached = CachedExtractor::new(extractor, manager(&dir));

        let features = cached.analyze(&sample).unwrap();
        assert!(features.duration.is_nan());
        assert!(cached.cache().is_empty());
        assert_eq!(cached.cache().stats().misses, 1);
    }
}
