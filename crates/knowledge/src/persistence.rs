//! On-disk layout of a saved [`VectorIndex`].
//!
//! A saved index is a directory holding:
//! - `manifest.json`: format version, metric, dimension and entry count,
//! - `vectors.bin`: unit-normalized vectors as little-endian `f32`, entry after entry,
//! - `payloads.json`: chunk text and provenance, parallel to the vectors,
//! - `sources.json`: structured fields of every source document.
//!
//! The manifest is removed before and written after everything else, so a
//! directory whose save was interrupted is rejected on load.

use crate::vector_store::{ChunkPayload, VectorIndex};
use chrono::{DateTime, Utc};
use nutrikal_common::{DocumentId, KnowledgeError, Result, StructuredFields};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const VECTORS_FILE: &str = "vectors.bin";
pub const PAYLOADS_FILE: &str = "payloads.json";
pub const SOURCES_FILE: &str = "sources.json";

const FORMAT_VERSION: u32 = 1;
const METRIC: &str = "cosine";
const BYTES_PER_COMPONENT: usize = std::mem::size_of::<f32>();

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    pub format_version: u32,
    pub metric: String,
    pub dimension: usize,
    pub entry_count: usize,
    pub normalized: bool,
    pub created_at: DateTime<Utc>,
}

impl VectorIndex {
    pub fn manifest(&self) -> IndexManifest {
        IndexManifest {
            format_version: FORMAT_VERSION,
            metric: METRIC.to_string(),
            dimension: self.dimension,
            entry_count: self.len(),
            normalized: true,
            created_at: Utc::now(),
        }
    }

    pub async fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).await.map_err(|e| {
            persistence_error(dir, format!("Failed to create index directory: {}", e))
        })?;

        let manifest_path = dir.join(MANIFEST_FILE);
        match fs::remove_file(&manifest_path).await {
            Ok(()) => debug!("Removed previous manifest at {}", manifest_path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(persistence_error(
                    &manifest_path,
                    format!("Failed to remove previous manifest: {}", e),
                ))
            }
        }

        let mut bytes = Vec::with_capacity(self.len() * self.dimension * BYTES_PER_COMPONENT);
        for vector in &self.vectors {
            for component in vector {
                bytes.extend_from_slice(&component.to_le_bytes());
            }
        }
        write_file(&dir.join(VECTORS_FILE), &bytes).await?;
        write_json(&dir.join(PAYLOADS_FILE), &self.payloads).await?;
        write_json(&dir.join(SOURCES_FILE), &self.sources).await?;
        write_json(&manifest_path, &self.manifest()).await?;

        info!("Saved index with {} entries to {}", self.len(), dir.display());
        Ok(())
    }

    /// Loads a saved index. With `expected_dimension`, a non-empty index of a
    /// different dimension is rejected.
    pub async fn load(dir: &Path, expected_dimension: Option<usize>) -> Result<Self> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest: IndexManifest = match fs::read(&manifest_path).await {
            Ok(bytes) => parse_json(&manifest_path, &bytes)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(format_error(dir, "manifest not found"));
            }
            Err(e) => {
                return Err(persistence_error(
                    &manifest_path,
                    format!("Failed to read manifest: {}", e),
                ));
            }
        };

        if manifest.format_version != FORMAT_VERSION {
            return Err(format_error(
                &manifest_path,
                format!("unsupported format version {}", manifest.format_version),
            ));
        }
        if manifest.metric != METRIC {
            return Err(format_error(
                &manifest_path,
                format!("unsupported metric '{}'", manifest.metric),
            ));
        }
        if !manifest.normalized {
            return Err(format_error(&manifest_path, "vectors are not unit-normalized"));
        }
        if manifest.entry_count > 0 && manifest.dimension == 0 {
            return Err(format_error(&manifest_path, "non-empty index with dimension 0"));
        }
        if let Some(expected) = expected_dimension {
            if manifest.entry_count > 0 && manifest.dimension != expected {
                return Err(format_error(
                    &manifest_path,
                    format!(
                        "index dimension {} does not match embedder dimension {}",
                        manifest.dimension, expected
                    ),
                ));
            }
        }

        let vectors_path = dir.join(VECTORS_FILE);
        let bytes = read_file(&vectors_path).await?;
        let expected_len = manifest
            .entry_count
            .checked_mul(manifest.dimension)
            .and_then(|components| components.checked_mul(BYTES_PER_COMPONENT))
            .ok_or_else(|| {
                format_error(
                    &manifest_path,
                    format!(
                        "{} entries of dimension {} exceed addressable size",
                        manifest.entry_count, manifest.dimension
                    ),
                )
            })?;
        if bytes.len() != expected_len {
            return Err(format_error(
                &vectors_path,
                format!("expected {} bytes, found {}", expected_len, bytes.len()),
            ));
        }
        let components: Vec<f32> = bytes
            .chunks_exact(BYTES_PER_COMPONENT)
            .map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            .collect();
        if let Some(position) = components.iter().position(|v| !v.is_finite()) {
            return Err(format_error(
                &vectors_path,
                format!("non-finite component at offset {}", position * BYTES_PER_COMPONENT),
            ));
        }
        let vectors: Vec<Vec<f32>> = if manifest.dimension == 0 {
            Vec::new()
        } else {
            components
                .chunks_exact(manifest.dimension)
                .map(<[f32]>::to_vec)
                .collect()
        };

        let payloads_path = dir.join(PAYLOADS_FILE);
        let payloads: Vec<ChunkPayload> =
            parse_json(&payloads_path, &read_file(&payloads_path).await?)?;
        if payloads.len() != manifest.entry_count {
            return Err(format_error(
                &payloads_path,
                format!("expected {} payloads, found {}", manifest.entry_count, payloads.len()),
            ));
        }

        let sources_path = dir.join(SOURCES_FILE);
        let sources: BTreeMap<DocumentId, StructuredFields> =
            parse_json(&sources_path, &read_file(&sources_path).await?)?;

        let index = VectorIndex::from_parts(manifest.dimension, vectors, payloads, sources)
            .map_err(|e| format_error(dir, e.to_string()))?;

        info!("Loaded index with {} entries from {}", index.len(), dir.display());
        Ok(index)
    }
}

fn format_error(path: &Path, reason: impl Into<String>) -> KnowledgeError {
    KnowledgeError::IndexFormat {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

fn persistence_error(path: &Path, reason: String) -> KnowledgeError {
    KnowledgeError::Persistence {
        path: path.display().to_string(),
        reason,
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).await.map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            format_error(path, "file missing from index directory")
        } else {
            persistence_error(path, format!("Failed to read: {}", e))
        }
    })
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes)
        .await
        .map_err(|e| persistence_error(path, format!("Failed to write: {}", e)))
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| persistence_error(path, format!("Failed to serialize: {}", e)))?;
    write_file(path, &bytes).await
}

fn parse_json<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| format_error(path, format!("invalid JSON: {}", e)))
}
