use nutrikal_common::{KnowledgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "NUTRIKAL";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub loader: LoaderConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub source_path: PathBuf,
    pub schema: SchemaConfig,
}

/// Column layout expected from the knowledge-base table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub required_fields: Vec<FieldSpec>,
    pub optional_fields: Vec<FieldSpec>,
    pub text_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Numeric,
    Categorical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub window_size: usize,
    pub overlap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub dimensions: usize,
    pub model: String,
    pub api_url: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub batch_size: usize,
    pub concurrency: usize,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    Hash,
    #[serde(rename = "openai")]
    OpenAI,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_k: usize,
    pub query_timeout_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            source_path: PathBuf::from("nutrition_kb.csv"),
            schema: SchemaConfig::default(),
        }
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            required_fields: vec![
                FieldSpec::categorical("aliment"),
                FieldSpec::categorical("categorie"),
                FieldSpec::numeric("calories_100g"),
            ],
            optional_fields: vec![
                FieldSpec::numeric("proteines_100g"),
                FieldSpec::numeric("omega3_100g"),
                FieldSpec::numeric("magnesium_100g"),
            ],
            text_fields: vec![
                "benefices_cerveau".to_string(),
                "conseils_consommation".to_string(),
            ],
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_size: 200,
            overlap: 20,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hash, // works offline
            dimensions: 384,
            model: "text-embedding-3-small".to_string(),
            api_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            timeout_seconds: 30,
            batch_size: 16,
            concurrency: 4,
            max_retries: 3,
            base_delay_ms: 250,
            max_delay_ms: 8000,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("nutrikal_vectorstore"),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: 3,
            query_timeout_ms: 10_000,
        }
    }
}

impl FieldSpec {
    pub fn numeric(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Numeric,
        }
    }

    pub fn categorical(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Categorical,
        }
    }
}

impl SchemaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.required_fields.is_empty() {
            return Err(KnowledgeError::schema(
                None,
                None,
                "at least one required field must be declared",
            ));
        }
        if self.text_fields.is_empty() {
            return Err(KnowledgeError::schema(
                None,
                None,
                "at least one text field must be declared",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        let names = self
            .required_fields
            .iter()
            .chain(self.optional_fields.iter())
            .map(|field| field.name.as_str())
            .chain(self.text_fields.iter().map(String::as_str));
        for name in names {
            if !seen.insert(name) {
                return Err(KnowledgeError::schema(
                    None,
                    Some(name),
                    "field declared more than once",
                ));
            }
        }

        Ok(())
    }
}

impl EmbeddingConfig {
    /// Backoff before retry number `attempt` (1-based), doubling up to the cap.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

impl KnowledgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layers an optional TOML file and `NUTRIKAL__*` environment variables
    /// over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: KnowledgeConfig = builder
            .build()
            .map_err(|e| {
                KnowledgeError::Configuration(format!("Failed to read configuration: {}", e))
            })?
            .try_deserialize()
            .map_err(|e| KnowledgeError::Configuration(format!("Invalid configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn with_source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.loader.source_path = path.into();
        self
    }

    pub fn with_index_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.index.path = path.into();
        self
    }

    pub fn with_window(mut self, window_size: usize, overlap: usize) -> Self {
        self.chunking.window_size = window_size;
        self.chunking.overlap = overlap;
        self
    }

    pub fn with_openai_api_key(mut self, api_key: String) -> Self {
        self.embedding.provider = EmbeddingProvider::OpenAI;
        self.embedding.api_key = Some(api_key);
        self
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.embedding.dimensions = dimensions;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.loader.schema.validate()?;

        if self.chunking.window_size == 0 {
            return Err(KnowledgeError::Configuration(
                "chunking.window_size must be positive".to_string(),
            ));
        }
        if self.chunking.overlap >= self.chunking.window_size {
            return Err(KnowledgeError::Configuration(
                "chunking.overlap must be smaller than chunking.window_size".to_string(),
            ));
        }

        if self.embedding.dimensions == 0 {
            return Err(KnowledgeError::Configuration(
                "embedding.dimensions must be positive".to_string(),
            ));
        }
        if self.embedding.batch_size == 0 || self.embedding.concurrency == 0 {
            return Err(KnowledgeError::Configuration(
                "embedding.batch_size and embedding.concurrency must be positive".to_string(),
            ));
        }
        if self.embedding.provider == EmbeddingProvider::OpenAI
            && self.embedding.api_key.is_none()
        {
            return Err(KnowledgeError::Configuration("OpenAI API key is required".to_string()));
        }

        if self.retrieval.query_timeout_ms == 0 {
            return Err(KnowledgeError::Configuration(
                "retrieval.query_timeout_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
