//! `.tflw` weight blob format
//!
//! Layout (little-endian):
//! - 4 bytes magic `TFLW`
//! - u32 format version
//! - u32 header length, then that many bytes of JSON header
//! - each tensor's f32 data in header order

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{ModelWeights, Tensor};
use crate::config::{ModelConfig, ModelVariant};
use crate::error::{MlError, MlResult};

pub const BLOB_MAGIC: [u8; 4] = *b"TFLW";
pub const FORMAT_VERSION: u32 = 1;
pub const BLOB_EXTENSION: &str = "tflw";

#[derive(Debug, Serialize, Deserialize)]
struct BlobHeader {
    variant: ModelVariant,
    version: String,
    config: ModelConfig,
    tensors: Vec<TensorEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TensorEntry {
    name: String,
    shape: Vec<usize>,
}

/// SHA-256 of raw bytes, hex encoded
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Serialize weights into blob bytes
pub fn encode(weights: &ModelWeights) -> MlResult<Vec<u8>> {
    let tensors = weights.tensors();
    let header = BlobHeader {
        variant: weights.metadata.variant,
        version: weights.metadata.version.clone(),
        config: weights.metadata.config.clone(),
        tensors: tensors
            .iter()
            .map(|(name, t)| TensorEntry {
                name: name.clone(),
                shape: t.shape().to_vec(),
            })
            .collect(),
    };
    let header_json = serde_json::to_vec(&header)?;

    let data_len: usize = tensors.iter().map(|(_, t)| t.len() * 4).sum();
    let mut bytes = Vec::with_capacity(12 + header_json.len() + data_len);
    bytes.extend_from_slice(&BLOB_MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(header_json.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&header_json);
    for (_, tensor) in &tensors {
        for v in tensor.iter() {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
    }
    Ok(bytes)
}

/// Parse and validate blob bytes against the expected config.
///
/// `source` names the blob in error messages.
pub fn decode(bytes: &[u8], config: &ModelConfig, source: &str) -> MlResult<ModelWeights> {
    let fail = |reason: String| MlError::WeightLoad {
        key: source.to_string(),
        reason,
    };
    let mut reader = ByteReader::new(bytes);

    let magic = reader.take(4).ok_or_else(|| fail("truncated magic".into()))?;
    if magic != BLOB_MAGIC {
        return Err(fail("bad magic".into()));
    }
    let version = reader.u32().ok_or_else(|| fail("truncated version".into()))?;
    if version != FORMAT_VERSION {
        return Err(fail(format!("unsupported format version {version}")));
    }
    let header_len = reader.u32().ok_or_else(|| fail("truncated header length".into()))? as usize;
    let header_bytes = reader
        .take(header_len)
        .ok_or_else(|| fail("truncated header".into()))?;
    let header: BlobHeader =
        serde_json::from_slice(header_bytes).map_err(|e| fail(format!("header: {e}")))?;

    if header.config != *config {
        return Err(fail("blob was built for a different model config".into()));
    }

    let mut weights = ModelWeights::zeros(header.variant, &header.version, config);
    let mut slots: HashMap<String, &mut Tensor> = weights.tensors_mut().into_iter().collect();

    for entry in &header.tensors {
        let tensor = slots
            .remove(&entry.name)
            .ok_or_else(|| fail(format!("unexpected or duplicate tensor {}", entry.name)))?;
        if tensor.shape() != entry.shape.as_slice() {
            return Err(fail(format!(
                "{}: shape {:?}, expected {:?}",
                entry.name,
                entry.shape,
                tensor.shape()
            )));
        }
        let data = reader
            .take(tensor.len() * 4)
            .ok_or_else(|| fail(format!("{}: truncated data", entry.name)))?;
        for (dst, chunk) in tensor.iter_mut().zip(data.chunks_exact(4)) {
            *dst = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }

    if !slots.is_empty() {
        let mut missing: Vec<_> = slots.into_keys().collect();
        missing.sort();
        return Err(fail(format!("missing tensors: {}", missing.join(", "))));
    }
    drop(slots);
    if reader.remaining() != 0 {
        return Err(fail(format!("{} trailing bytes", reader.remaining())));
    }

    weights.validate(config)?;
    Ok(weights)
}

/// Write a blob, returning its content hash
pub fn write_blob(path: impl AsRef<Path>, weights: &ModelWeights) -> MlResult<String> {
    let path = path.as_ref();
    let bytes = encode(weights)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, &bytes)?;
    log::debug!("Wrote {} bytes of weights to {}", bytes.len(), path.display());
    Ok(content_hash(&bytes))
}

/// Read and validate a blob, returning the weights and the blob's content hash
pub fn read_blob(path: impl AsRef<Path>, config: &ModelConfig) -> MlResult<(ModelWeights, String)> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| MlError::WeightLoad {
        key: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let weights = decode(&bytes, config, &path.display().to_string())?;
    Ok((weights, content_hash(&bytes)))
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}
