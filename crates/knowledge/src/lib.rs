//! Knowledge base: loading, chunking, embedding, indexing and retrieval
//! over a tabular nutrition knowledge base.

pub mod chunker;
pub mod config;
pub mod document_loader;
pub mod embedder;
pub mod persistence;
pub mod pipeline;
pub mod semantic_search;
pub mod vector_store;

pub use chunker::Chunker;
pub use config::KnowledgeConfig;
pub use document_loader::{sample_knowledge_base, DocumentLoader};
pub use embedder::{create_embedder, Embedder, HashEmbedder, OpenAiEmbedder};
pub use persistence::IndexManifest;
pub use pipeline::IndexBuilder;
pub use semantic_search::Retriever;
pub use vector_store::{ChunkPayload, IndexHandle, ScoredChunk, VectorIndex};
