//! Weight store: blob directory plus LRU cache, with explicit placeholder fallback

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::blob::{BLOB_EXTENSION, read_blob};
use super::cache::WeightCache;
use super::ModelWeights;
use crate::config::{ModelConfig, ModelVariant};
use crate::error::{MlError, MlResult};

/// Uniform range of placeholder weights
const PLACEHOLDER_SCALE: f32 = 0.02;

/// Length of the short provenance id
const SHORT_HASH_LEN: usize = 16;

/// Cache and file key, rendered `variant-version`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeightKey {
    pub variant: ModelVariant,
    pub version: String,
}

impl WeightKey {
    pub fn new(variant: ModelVariant, version: impl Into<String>) -> Self {
        Self {
            variant,
            version: version.into(),
        }
    }

    /// Blob file name inside the weights directory
    pub fn file_name(&self) -> String {
        format!("{self}.{BLOB_EXTENSION}")
    }

    /// RNG seed derived from the key text
    fn seed(&self) -> u64 {
        let digest = Sha256::digest(self.to_string().as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(bytes)
    }
}

impl fmt::Display for WeightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.variant, self.version)
    }
}

/// Why trained weights could not be used
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegradedReason {
    /// No blob at the expected path
    Missing { path: PathBuf },
    /// Blob present but unreadable or inconsistent
    Corrupt { reason: String },
}

impl fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradedReason::Missing { path } => write!(f, "weight blob missing at {}", path.display()),
            DegradedReason::Corrupt { reason } => write!(f, "weight blob rejected: {reason}"),
        }
    }
}

/// Provenance of the weights behind a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightQuality {
    Trained,
    Placeholder(DegradedReason),
}

impl WeightQuality {
    pub fn is_degraded(&self) -> bool {
        matches!(self, WeightQuality::Placeholder(_))
    }
}

/// Weights handed to the engine
#[derive(Debug, Clone)]
pub struct LoadedWeights {
    pub key: WeightKey,
    pub weights: Arc<ModelWeights>,
    /// SHA-256 hex of the blob (or of placeholder tensors)
    pub hash: String,
    /// Set when these are placeholder weights
    pub degraded: Option<DegradedReason>,
}

impl LoadedWeights {
    pub fn short_hash(&self) -> &str {
        &self.hash[..SHORT_HASH_LEN.min(self.hash.len())]
    }

    pub fn quality(&self) -> WeightQuality {
        match &self.degraded {
            None => WeightQuality::Trained,
            Some(reason) => WeightQuality::Placeholder(reason.clone()),
        }
    }
}

/// Deterministic placeholder weights seeded by `key`
pub fn placeholder(key: &WeightKey, config: &ModelConfig) -> ModelWeights {
    let mut rng = ChaCha8Rng::seed_from_u64(key.seed());
    ModelWeights::random(key.variant, &key.version, config, &mut rng, PLACEHOLDER_SCALE)
}

/// Loads `.tflw` blobs from a directory through a bounded cache
pub struct WeightStore {
    dir: PathBuf,
    cache: Mutex<WeightCache>,
}

impl WeightStore {
    pub fn new(dir: impl Into<PathBuf>, cache_capacity: usize) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(WeightCache::new(cache_capacity)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn blob_path(&self, key: &WeightKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Cache hit, or read + validate + insert
    pub fn load(&self, key: &WeightKey, config: &ModelConfig) -> MlResult<LoadedWeights> {
        if let Some((weights, hash)) = self.cache.lock().get(key) {
            if weights.metadata.config == *config {
                log::debug!("Weights {key} served from cache");
                return Ok(LoadedWeights {
                    key: key.clone(),
                    weights,
                    hash,
                    degraded: None,
                });
            }
        }

        let path = self.blob_path(key);
        let (weights, hash) = read_blob(&path, config).map_err(|e| match e {
            MlError::WeightLoad { reason, .. } => MlError::WeightLoad {
                key: key.to_string(),
                reason,
            },
            other => other,
        })?;

        if weights.metadata.variant != key.variant || weights.metadata.version != key.version {
            return Err(MlError::WeightLoad {
                key: key.to_string(),
                reason: format!(
                    "blob declares {}-{}",
                    weights.metadata.variant, weights.metadata.version
                ),
            });
        }

        let weights = Arc::new(weights);
        log::info!(
            "Loaded weights {key} ({} parameters, sha256 {})",
            weights.parameter_count(),
            &hash[..SHORT_HASH_LEN]
        );
        self.cache
            .lock()
            .insert(key.clone(), Arc::clone(&weights), hash.clone());

        Ok(LoadedWeights {
            key: key.clone(),
            weights,
            hash,
            degraded: None,
        })
    }

    /// Like [`load`](Self::load), but substitutes placeholder weights on failure.
    ///
    /// Placeholders are flagged through `degraded` and never cached.
    pub fn load_or_placeholder(&self, key: &WeightKey, config: &ModelConfig) -> LoadedWeights {
        match self.load(key, config) {
            Ok(loaded) => loaded,
            Err(err) => {
                let path = self.blob_path(key);
                let reason = if path.exists() {
                    DegradedReason::Corrupt {
                        reason: err.to_string(),
                    }
                } else {
                    DegradedReason::Missing { path }
                };
                log::warn!(
                    "USING PLACEHOLDER WEIGHTS for {key}: {reason}. Separation output will not be meaningful."
                );

                let weights = placeholder(key, config);
                let hash = weights.tensor_hash();
                LoadedWeights {
                    key: key.clone(),
                    weights: Arc::new(weights),
                    hash,
                    degraded: Some(reason),
                }
            }
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_cached(&self, key: &WeightKey) -> bool {
        self.cache.lock().contains(key)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::write_blob;

    fn tiny() -> ModelConfig {
        ModelConfig {
            num_freq_bins: 5,
            hidden_dim: 4,
            num_heads: 2,
            num_layers: 1,
            ffn_multiplier: 1,
            ffn_kernel_size: 2,
            norm_groups: 2,
            max_seq_len: 16,
            ..ModelConfig::base()
        }
    }

    #[test]
    fn test_key_display() {
        let key = WeightKey::new(ModelVariant::FiveStem, "v2");
        assert_eq!(key.to_string(), "5stem-v2");
        assert_eq!(key.file_name(), "5stem-v2.tflw");
    }

    #[test]
    fn test_placeholder_is_deterministic_per_key() {
        let config = tiny();
        let a = placeholder(&WeightKey::new(ModelVariant::TwoStem, "v1"), &config);
        let b = placeholder(&WeightKey::new(ModelVariant::TwoStem, "v1"), &config);
        let c = placeholder(&WeightKey::new(ModelVariant::TwoStem, "v2"), &config);
        assert_eq!(a, b);
        assert_ne!(a.input_proj, c.input_proj);
    }

    #[test]
    fn test_missing_blob_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path(), 3);
        let key = WeightKey::new(ModelVariant::TwoStem, "v1");

        assert!(matches!(store.load(&key, &tiny()), Err(MlError::WeightLoad { .. })));

        let loaded = store.load_or_placeholder(&key, &tiny());
        assert!(matches!(loaded.degraded, Some(DegradedReason::Missing { .. })));
        assert!(loaded.quality().is_degraded());
        assert_eq!(loaded.short_hash().len(), 16);
        assert_eq!(store.cached_len(), 0);
    }

    #[test]
    fn test_corrupt_blob_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path(), 3);
        let key = WeightKey::new(ModelVariant::TwoStem, "v1");
        std::fs::write(store.blob_path(&key), b"TFLW garbage").unwrap();

        let loaded = store.load_or_placeholder(&key, &tiny());
        assert!(matches!(loaded.degraded, Some(DegradedReason::Corrupt { .. })));
    }

    #[test]
    fn test_load_caches_trained_weights() {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path(), 3);
        let key = WeightKey::new(ModelVariant::TwoStem, "v1");
        let weights = placeholder(&key, &tiny());
        let written_hash = write_blob(store.blob_path(&key), &weights).unwrap();

        let first = store.load(&key, &tiny()).unwrap();
        assert!(first.degraded.is_none());
        assert_eq!(first.hash, written_hash);
        assert_eq!(*first.weights, weights);
        assert!(store.is_cached(&key));

        // served from cache even after the file disappears
        std::fs::remove_file(store.blob_path(&key)).unwrap();
        let second = store.load(&key, &tiny()).unwrap();
        assert!(Arc::ptr_eq(&first.weights, &second.weights));

        store.clear_cache();
        assert!(store.load(&key, &tiny()).is_err());
    }

    #[test]
    fn test_key_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path(), 3);
        let key = WeightKey::new(ModelVariant::TwoStem, "v1");
        let other = placeholder(&WeightKey::new(ModelVariant::TwoStem, "v9"), &tiny());
        write_blob(store.blob_path(&key), &other).unwrap();

        assert!(store.load(&key, &tiny()).is_err());
    }
}
