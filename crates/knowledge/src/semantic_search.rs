use crate::config::RetrievalConfig;
use crate::embedder::Embedder;
use crate::vector_store::IndexHandle;
use nutrikal_common::{KnowledgeError, QueryRequest, Result, RetrievalResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Answers similarity queries against the currently published index.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    handle: IndexHandle,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, handle: IndexHandle, config: RetrievalConfig) -> Self {
        Self {
            embedder,
            handle,
            config,
        }
    }

    pub fn handle(&self) -> &IndexHandle {
        &self.handle
    }

    pub fn default_k(&self) -> usize {
        self.config.default_k
    }

    /// Top `k` chunks for `query_text`, best first, using the configured
    /// query timeout.
    pub async fn retrieve(&self, query_text: &str, k: usize) -> Result<Vec<RetrievalResult>> {
        let timeout = Duration::from_millis(self.config.query_timeout_ms);
        self.retrieve_with_timeout(query_text, k, timeout).await
    }

    pub async fn query(&self, request: &QueryRequest) -> Result<Vec<RetrievalResult>> {
        self.retrieve(&request.query_text, request.k).await
    }

    /// Fails with [`KnowledgeError::IndexNotBuilt`] before any index was
    /// published, and with [`KnowledgeError::Timeout`] if embedding the query
    /// outlasts `timeout`. Neither touches the index.
    pub async fn retrieve_with_timeout(
        &self,
        query_text: &str,
        k: usize,
        timeout: Duration,
    ) -> Result<Vec<RetrievalResult>> {
        let started = Instant::now();
        let index = self.handle.snapshot().await?;
        if k == 0 || index.is_empty() {
            return Ok(Vec::new());
        }

        let vector = tokio::time::timeout(timeout, self.embedder.embed(query_text))
            .await
            .map_err(|_| KnowledgeError::Timeout {
                after_ms: timeout.as_millis() as u64,
            })??;

        let results: Vec<RetrievalResult> = index
            .query(&vector, k)?
            .into_iter()
            // ids come from this snapshot, so every payload is present
            .filter_map(|scored| {
                let payload = index.payload(&scored.chunk_id)?;
                Some(RetrievalResult {
                    chunk_id: scored.chunk_id,
                    chunk_text: payload.text.clone(),
                    score: scored.score,
                    source_document_id: payload.source_document_id,
                    structured_fields: index
                        .source_fields(payload.source_document_id)
                        .cloned()
                        .unwrap_or_default(),
                })
            })
            .collect();

        debug!(
            "Query '{}' returned {} results in {:?}",
            query_text,
            results.len(),
            started.elapsed()
        );
        Ok(results)
    }

    /// Drops the published index. Later queries fail with `IndexNotBuilt`.
    pub async fn shutdown(&self) {
        self.handle.unload().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashEmbedder;
    use crate::vector_store::VectorIndex;
    use async_trait::async_trait;
    use nutrikal_common::{Chunk, ChunkId, DocumentId, FieldValue, StructuredFields};
    use std::collections::BTreeMap;

    const DIMENSIONS: usize = 128;

    fn chunk(document: DocumentId, text: &str) -> Chunk {
        Chunk {
            chunk_id: ChunkId::new(document, 0),
            source_document_id: document,
            sequence_index: 0,
            text: text.to_string(),
            start_offset: 0,
            end_offset: text.chars().count(),
        }
    }

    fn indexed_handle() -> IndexHandle {
        let embedder = HashEmbedder::new(DIMENSIONS);
        let texts = [
            "saumon riche en DHA pour la mémoire",
            "noix source d'oméga-3 végétaux",
            "myrtilles antioxydants contre le stress oxydatif",
        ];
        let entries = texts
            .iter()
            .enumerate()
            .map(|(id, text)| (chunk(id as DocumentId, text), embedder.embed_text(text)))
            .collect();

        let mut sources = BTreeMap::new();
        let mut fields = StructuredFields::new();
        fields.insert("aliment".to_string(), FieldValue::Category("Noix".to_string()));
        fields.insert("omega3_100g".to_string(), FieldValue::Number(9.1));
        sources.insert(1, fields);

        IndexHandle::with_index(VectorIndex::build_with_sources(entries, sources).unwrap())
    }

    fn retriever(handle: IndexHandle) -> Retriever {
        Retriever::new(
            Arc::new(HashEmbedder::new(DIMENSIONS)),
            handle,
            RetrievalConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_not_built_is_distinct_from_empty() {
        let retriever = retriever(IndexHandle::new());
        assert!(matches!(
            retriever.retrieve("noix", 3).await,
            Err(KnowledgeError::IndexNotBuilt)
        ));

        retriever.handle().clear().await;
        assert!(retriever.retrieve("noix", 3).await.unwrap().is_empty());

        retriever.shutdown().await;
        assert!(matches!(
            retriever.retrieve("noix", 3).await,
            Err(KnowledgeError::IndexNotBuilt)
        ));
    }

    #[tokio::test]
    async fn test_results_are_hydrated() {
        let retriever = retriever(indexed_handle());
        let results = retriever
            .query(&QueryRequest {
                query_text: "noix source d'oméga-3 végétaux".to_string(),
                k: 2,
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        let top = &results[0];
        assert_eq!(top.source_document_id, 1);
        assert_eq!(top.chunk_text, "noix source d'oméga-3 végétaux");
        assert!((top.score - 1.0).abs() < 1e-5);
        assert_eq!(top.structured_fields.get("omega3_100g"), Some(&FieldValue::Number(9.1)));
        assert!(results[0].score >= results[1].score);

        // documents without recorded fields hydrate to an empty map
        assert!(results[1].structured_fields.is_empty());
    }

    #[tokio::test]
    async fn test_k_larger_than_index() {
        let retriever = retriever(indexed_handle());
        assert_eq!(retriever.retrieve("mémoire", 50).await.unwrap().len(), 3);
        assert!(retriever.retrieve("mémoire", 0).await.unwrap().is_empty());
    }

    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![0.0; DIMENSIONS])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; DIMENSIONS]).collect())
        }

        fn dimensions(&self) -> usize {
            DIMENSIONS
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_embedder_times_out() {
        let handle = indexed_handle();
        let retriever =
            Retriever::new(Arc::new(SlowEmbedder), handle.clone(), RetrievalConfig::default());

        let err = retriever
            .retrieve_with_timeout("saumon", 3, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::Timeout { after_ms: 50 }));

        // the index is untouched
        assert_eq!(handle.snapshot().await.unwrap().len(), 3);
    }
}
