use crate::chunker::Chunker;
use crate::config::{EmbeddingConfig, KnowledgeConfig};
use crate::embedder::Embedder;
use crate::vector_store::{IndexHandle, VectorIndex};
use futures::stream::{self, StreamExt};
use nutrikal_common::{Chunk, Document, DocumentId, KnowledgeError, Result, StructuredFields};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Turns loaded documents into a [`VectorIndex`].
///
/// Chunking runs on the rayon pool. Embedding goes out in batches of
/// `batch_size`, with at most `concurrency` batches in flight; results are
/// consumed in batch order.
pub struct IndexBuilder {
    embedder: Arc<dyn Embedder>,
    chunker: Chunker,
    config: EmbeddingConfig,
}

impl IndexBuilder {
    pub fn new(embedder: Arc<dyn Embedder>, chunker: Chunker, config: EmbeddingConfig) -> Self {
        Self {
            embedder,
            chunker,
            config,
        }
    }

    pub fn from_config(embedder: Arc<dyn Embedder>, config: &KnowledgeConfig) -> Result<Self> {
        let chunker = Chunker::from_config(&config.chunking)?;
        Ok(Self::new(embedder, chunker, config.embedding.clone()))
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    /// Builds a complete index or fails; nothing partial is ever returned.
    ///
    /// `cancel` is observed between batches. A cancelled build drops every
    /// in-flight request and returns [`KnowledgeError::Cancelled`].
    pub async fn build(
        &self,
        documents: &[Document],
        cancel: &CancellationToken,
    ) -> Result<VectorIndex> {
        let started = Instant::now();
        let chunks = self.chunker.chunk_all(documents);
        let total = chunks.len();
        info!("Split {} documents into {} chunks", documents.len(), total);

        let batch_size = self.config.batch_size.max(1);
        let mut batches = Vec::with_capacity(total.div_ceil(batch_size));
        let mut remaining = chunks.into_iter().peekable();
        while remaining.peek().is_some() {
            batches.push(remaining.by_ref().take(batch_size).collect::<Vec<Chunk>>());
        }

        let embedded = stream::iter(batches)
            .map(|batch| self.embed_with_retry(batch))
            .buffered(self.config.concurrency.max(1));
        let mut embedded = std::pin::pin!(embedded);

        let mut entries = Vec::with_capacity(total);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Index build cancelled after {} of {} chunks", entries.len(), total);
                    return Err(KnowledgeError::Cancelled);
                }
                next = embedded.next() => match next {
                    Some(batch) => {
                        entries.extend(batch?);
                        debug!("Embedded {}/{} chunks", entries.len(), total);
                    }
                    None => break,
                }
            }
        }

        let sources: BTreeMap<DocumentId, StructuredFields> = documents
            .iter()
            .map(|document| (document.id, document.structured_fields.clone()))
            .collect();
        let index = VectorIndex::build_with_sources(entries, sources)?;

        info!(
            "Built index with {} entries (dimension {}) in {:?}",
            index.len(),
            index.dimension(),
            started.elapsed()
        );
        Ok(index)
    }

    /// Builds and publishes to `handle`. Rebuilds on one handle run one at a
    /// time; on failure the previously published snapshot stays in place.
    pub async fn rebuild(
        &self,
        handle: &IndexHandle,
        documents: &[Document],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let _guard = handle.lock_for_build().await;
        let index = self.build(documents, cancel).await?;
        let entries = index.len();
        handle.publish(index).await;
        Ok(entries)
    }

    async fn embed_with_retry(&self, batch: Vec<Chunk>) -> Result<Vec<(Chunk, Vec<f32>)>> {
        let Some(first) = batch.first().map(|chunk| chunk.chunk_id) else {
            return Ok(Vec::new());
        };
        let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
        let dimension = self.embedder.dimensions();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self.embedder.embed_batch(&texts).await.and_then(|vectors| {
                if vectors.len() == texts.len() {
                    Ok(vectors)
                } else {
                    Err(KnowledgeError::Embedder(format!(
                        "expected {} vectors, got {}",
                        texts.len(),
                        vectors.len()
                    )))
                }
            });

            match outcome {
                Ok(vectors) => {
                    if let Some((chunk, vector)) = batch
                        .iter()
                        .zip(&vectors)
                        .find(|(_, vector)| vector.len() != dimension)
                    {
                        return Err(KnowledgeError::DimensionMismatch {
                            chunk_id: Some(chunk.chunk_id),
                            expected: dimension,
                            actual: vector.len(),
                        });
                    }
                    return Ok(batch.into_iter().zip(vectors).collect());
                }
                Err(e) if e.is_retryable() && attempt <= self.config.max_retries => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        "Embedding batch starting at {} failed (attempt {}): {}; retrying in {:?}",
                        first, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(KnowledgeError::EmbeddingFailure {
                        chunk_id: first,
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::{HashEmbedder, MockEmbedder};
    use nutrikal_common::{ChunkId, FieldValue, TextField};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn document(id: DocumentId, body: &str) -> Document {
        let mut structured_fields = StructuredFields::new();
        structured_fields.insert(
            "aliment".to_string(),
            FieldValue::Category(format!("food-{}", id)),
        );
        Document {
            id,
            structured_fields,
            text_fields: vec![TextField {
                name: "notes".to_string(),
                value: body.to_string(),
            }],
        }
    }

    fn documents() -> Vec<Document> {
        vec![
            document(0, &"saumon riche en oméga-3 ".repeat(12)),
            document(1, "noix"),
            document(2, &"myrtilles antioxydants ".repeat(20)),
        ]
    }

    fn embedding_config() -> EmbeddingConfig {
        EmbeddingConfig {
            batch_size: 2,
            concurrency: 2,
            max_retries: 2,
            base_delay_ms: 10,
            max_delay_ms: 40,
            ..EmbeddingConfig::default()
        }
    }

    fn builder(embedder: Arc<dyn Embedder>) -> IndexBuilder {
        IndexBuilder::new(embedder, Chunker::new(200, 20).unwrap(), embedding_config())
    }

    #[tokio::test]
    async fn test_build_indexes_every_chunk() {
        let builder = builder(Arc::new(HashEmbedder::new(64)));
        let docs = documents();
        let index = builder.build(&docs, &CancellationToken::new()).await.unwrap();

        let expected: usize = docs
            .iter()
            .map(|d| builder.chunker().expected_chunks(d.render_text().chars().count()))
            .sum();
        assert_eq!(index.len(), expected);
        assert_eq!(index.dimension(), 64);
        assert_eq!(
            index.source_fields(2).and_then(|fields| fields.get("aliment")),
            Some(&FieldValue::Category("food-2".to_string()))
        );
    }

    #[tokio::test]
    async fn test_build_without_documents_is_empty() {
        let builder = builder(Arc::new(HashEmbedder::new(64)));
        let index = builder.build(&[], &CancellationToken::new()).await.unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut mock = MockEmbedder::new();
        mock.expect_dimensions().return_const(3usize);
        mock.expect_embed_batch().returning(move |texts| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(KnowledgeError::Embedder("rate limited".to_string()))
            } else {
                Ok(texts.iter().map(|_| vec![1.0, 0.5, 0.0]).collect())
            }
        });

        let docs = vec![document(0, "saumon")];
        let index = builder(Arc::new(mock))
            .build(&docs, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_the_build() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut mock = MockEmbedder::new();
        mock.expect_dimensions().return_const(3usize);
        mock.expect_embed_batch().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            // one vector short every time
            Ok(Vec::new())
        });

        let docs = vec![document(4, "avocat")];
        let err = builder(Arc::new(mock))
            .build(&docs, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            KnowledgeError::EmbeddingFailure { chunk_id, attempts, .. } => {
                assert_eq!(chunk_id, ChunkId::new(4, 0));
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_not_retried() {
        let mut mock = MockEmbedder::new();
        mock.expect_dimensions().return_const(3usize);
        mock.expect_embed_batch()
            .times(1)
            .returning(|texts| Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect()));

        let docs = vec![document(1, "noix")];
        let err = builder(Arc::new(mock))
            .build(&docs, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KnowledgeError::DimensionMismatch { chunk_id: Some(_), expected: 3, actual: 2 }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_build_returns_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let builder = builder(Arc::new(HashEmbedder::new(16)));
        let err = builder.build(&documents(), &cancel).await.unwrap_err();
        assert!(matches!(err, KnowledgeError::Cancelled));
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_previous_snapshot() {
        let handle = IndexHandle::new();
        let good = builder(Arc::new(HashEmbedder::new(16)));
        let entries = good
            .rebuild(&handle, &documents(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handle.snapshot().await.unwrap().len(), entries);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(good.rebuild(&handle, &[document(9, "x")], &cancel).await.is_err());
        assert_eq!(handle.snapshot().await.unwrap().len(), entries);
    }
}
