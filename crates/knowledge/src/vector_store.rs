use nutrikal_common::{Chunk, ChunkId, DocumentId, KnowledgeError, Result, StructuredFields};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::info;

/// Text and provenance stored alongside each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub chunk_id: ChunkId,
    pub source_document_id: DocumentId,
    pub sequence_index: u32,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
}

impl From<Chunk> for ChunkPayload {
    fn from(chunk: Chunk) -> Self {
        Self {
            chunk_id: chunk.chunk_id,
            source_document_id: chunk.source_document_id,
            sequence_index: chunk.sequence_index,
            text: chunk.text,
            start_offset: chunk.start_offset,
            end_offset: chunk.end_offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk_id: ChunkId,
    pub score: f32,
}

/// Exact cosine-similarity index over unit-normalized vectors.
///
/// Entries are kept sorted by chunk id. Vectors are normalized once at
/// build time so a query is a single dot product per entry.
#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    pub(crate) dimension: usize,
    pub(crate) vectors: Vec<Vec<f32>>,
    pub(crate) payloads: Vec<ChunkPayload>,
    pub(crate) sources: BTreeMap<DocumentId, StructuredFields>,
    positions: HashMap<ChunkId, usize>,
}

impl VectorIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a fresh index. All vectors must share one length.
    pub fn build(entries: Vec<(Chunk, Vec<f32>)>) -> Result<Self> {
        Self::build_with_sources(entries, BTreeMap::new())
    }

    /// Like [`VectorIndex::build`], also recording each source document's
    /// structured fields for result hydration.
    pub fn build_with_sources(
        entries: Vec<(Chunk, Vec<f32>)>,
        sources: BTreeMap<DocumentId, StructuredFields>,
    ) -> Result<Self> {
        let dimension = entries.first().map(|(_, vector)| vector.len()).unwrap_or(0);

        let mut normalized = Vec::with_capacity(entries.len());
        for (chunk, vector) in entries {
            if vector.len() != dimension {
                return Err(KnowledgeError::DimensionMismatch {
                    chunk_id: Some(chunk.chunk_id),
                    expected: dimension,
                    actual: vector.len(),
                });
            }
            if vector.iter().any(|v| !v.is_finite()) {
                return Err(KnowledgeError::InvalidVector {
                    chunk_id: Some(chunk.chunk_id),
                    reason: "vector contains non-finite components".to_string(),
                });
            }
            normalized.push((ChunkPayload::from(chunk), normalize(vector)));
        }
        normalized.sort_by_key(|(payload, _)| payload.chunk_id);

        let (payloads, vectors): (Vec<_>, Vec<_>) = normalized.into_iter().unzip();
        Self::from_parts(dimension, vectors, payloads, sources)
    }

    /// Assembles an index from already-normalized parts.
    pub(crate) fn from_parts(
        dimension: usize,
        vectors: Vec<Vec<f32>>,
        payloads: Vec<ChunkPayload>,
        sources: BTreeMap<DocumentId, StructuredFields>,
    ) -> Result<Self> {
        let mut positions = HashMap::with_capacity(payloads.len());
        for (position, payload) in payloads.iter().enumerate() {
            if positions.insert(payload.chunk_id, position).is_some() {
                return Err(KnowledgeError::DuplicateChunk(payload.chunk_id));
            }
        }

        Ok(Self {
            dimension,
            vectors,
            payloads,
            sources,
            positions,
        })
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Vector length shared by all entries; 0 for an empty index.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn payload(&self, chunk_id: &ChunkId) -> Option<&ChunkPayload> {
        self.positions.get(chunk_id).map(|&position| &self.payloads[position])
    }

    pub fn source_fields(&self, document_id: DocumentId) -> Option<&StructuredFields> {
        self.sources.get(&document_id)
    }

    pub fn payloads(&self) -> &[ChunkPayload] {
        &self.payloads
    }

    /// Top `k` entries by cosine similarity, best first. Equal scores rank
    /// by ascending chunk id.
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        if vector.len() != self.dimension {
            return Err(KnowledgeError::DimensionMismatch {
                chunk_id: None,
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(KnowledgeError::InvalidVector {
                chunk_id: None,
                reason: "query vector contains non-finite components".to_string(),
            });
        }

        let query = normalize(vector.to_vec());

        // bounded heap whose top is the worst-ranked candidate kept so far
        let mut heap: BinaryHeap<ScoredItem> = BinaryHeap::with_capacity(k + 1);
        for (position, stored) in self.vectors.iter().enumerate() {
            // + 0.0 folds -0.0 into 0.0 so zero scores tie
            heap.push(ScoredItem {
                score: dot(&query, stored).clamp(-1.0, 1.0) + 0.0,
                chunk_id: self.payloads[position].chunk_id,
            });
            if heap.len() > k {
                heap.pop();
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|item| ScoredChunk {
                chunk_id: item.chunk_id,
                score: item.score,
            })
            .collect())
    }
}

/// Ordered so that better candidates compare as smaller.
#[derive(Debug, PartialEq)]
struct ScoredItem {
    score: f32,
    chunk_id: ChunkId,
}

impl Eq for ScoredItem {}

impl Ord for ScoredItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.chunk_id.cmp(&other.chunk_id))
    }
}

impl PartialOrd for ScoredItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Scales `vector` to unit length. The norm is accumulated in `f64` so
/// components far from 1.0 in magnitude neither overflow nor underflow.
pub(crate) fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector
        .iter()
        .map(|&v| f64::from(v) * f64::from(v))
        .sum::<f64>()
        .sqrt();
    if norm > 0.0 && norm.is_finite() {
        for value in &mut vector {
            *value = (f64::from(*value) / norm) as f32;
        }
    }
    vector
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Shared slot holding the currently published index snapshot.
///
/// Readers clone the inner `Arc` and query without holding the lock, so a
/// publish never disturbs queries already running against the old snapshot.
#[derive(Clone, Default)]
pub struct IndexHandle {
    current: Arc<RwLock<Option<Arc<VectorIndex>>>>,
    build_lock: Arc<Mutex<()>>,
}

impl IndexHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index(index: VectorIndex) -> Self {
        Self {
            current: Arc::new(RwLock::new(Some(Arc::new(index)))),
            build_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn snapshot(&self) -> Result<Arc<VectorIndex>> {
        self.current
            .read()
            .await
            .clone()
            .ok_or(KnowledgeError::IndexNotBuilt)
    }

    pub async fn is_built(&self) -> bool {
        self.current.read().await.is_some()
    }

    /// Replaces the current snapshot.
    pub async fn publish(&self, index: VectorIndex) {
        let entries = index.len();
        *self.current.write().await = Some(Arc::new(index));
        info!("Published index snapshot with {} entries", entries);
    }

    /// Publishes an empty, queryable index.
    pub async fn clear(&self) {
        self.publish(VectorIndex::empty()).await;
    }

    /// Drops the snapshot; queries fail with `IndexNotBuilt` afterwards.
    pub async fn unload(&self) {
        *self.current.write().await = None;
        info!("Index unloaded");
    }

    /// Held by a rebuild for its whole duration so rebuilds never interleave.
    pub(crate) async fn lock_for_build(&self) -> MutexGuard<'_, ()> {
        self.build_lock.lock().await
    }
}
