use crate::config::{FieldKind, FieldSpec, SchemaConfig};
use nutrikal_common::{
    Document, DocumentId, FieldValue, KnowledgeError, Result, StructuredFields, TextField,
};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

const SAMPLE_KNOWLEDGE_BASE: &str = include_str!("../data/nutrition_kb.csv");

/// The five-food nutrition table the default schema describes.
pub fn sample_knowledge_base() -> &'static str {
    SAMPLE_KNOWLEDGE_BASE
}

enum Column<'a> {
    Structured { spec: &'a FieldSpec, required: bool },
    Text,
    Extension,
}

/// Reads tabular knowledge-base records into [`Document`]s.
pub struct DocumentLoader {
    schema: SchemaConfig,
}

impl DocumentLoader {
    pub fn new(schema: SchemaConfig) -> Result<Self> {
        schema.validate()?;
        Ok(Self { schema })
    }

    pub fn load(&self, path: &Path) -> Result<Vec<Document>> {
        let file = File::open(path).map_err(|e| KnowledgeError::SourceUnavailable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        self.load_from_reader(file, &path.display().to_string())
    }

    /// Parses CSV with a header row. Documents get ids by record position.
    pub fn load_from_reader<R: Read>(&self, reader: R, origin: &str) -> Result<Vec<Document>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| csv_error(e, origin, None))?
            .iter()
            .map(str::to_string)
            .collect();
        self.check_headers(&headers)?;

        let columns: Vec<Column> = headers.iter().map(|name| self.classify(name)).collect();

        let mut documents = Vec::new();
        for (position, record) in reader.records().enumerate() {
            let id = position as DocumentId;
            let record = record.map_err(|e| csv_error(e, origin, Some(id)))?;
            documents.push(self.build_document(id, &headers, &columns, &record)?);
        }

        info!("Loaded {} documents from {}", documents.len(), origin);
        Ok(documents)
    }

    fn check_headers(&self, headers: &[String]) -> Result<()> {
        for spec in &self.schema.required_fields {
            if !headers.iter().any(|h| h == &spec.name) {
                return Err(KnowledgeError::schema(
                    None,
                    Some(spec.name.as_str()),
                    "required field is absent from every record",
                ));
            }
        }

        if !self.schema.text_fields.iter().any(|name| headers.contains(name)) {
            return Err(KnowledgeError::schema(
                None,
                None,
                format!(
                    "no text field present (expected one of: {})",
                    self.schema.text_fields.join(", ")
                ),
            ));
        }

        Ok(())
    }

    fn classify(&self, name: &str) -> Column<'_> {
        if let Some(spec) = self.schema.required_fields.iter().find(|s| s.name == name) {
            return Column::Structured { spec, required: true };
        }
        if let Some(spec) = self.schema.optional_fields.iter().find(|s| s.name == name) {
            return Column::Structured { spec, required: false };
        }
        if self.schema.text_fields.iter().any(|t| t == name) {
            return Column::Text;
        }
        Column::Extension
    }

    fn build_document(
        &self,
        id: DocumentId,
        headers: &[String],
        columns: &[Column],
        record: &csv::StringRecord,
    ) -> Result<Document> {
        let mut structured_fields = StructuredFields::new();
        let mut texts: HashMap<&str, String> = HashMap::new();

        for (index, (name, column)) in headers.iter().zip(columns).enumerate() {
            let raw = record.get(index).unwrap_or("");
            match column {
                Column::Structured { spec, required } => {
                    let value = parse_value(id, spec, raw)?;
                    if *required && value.is_empty() {
                        return Err(KnowledgeError::schema(
                            Some(id),
                            Some(name.as_str()),
                            "required value is empty",
                        ));
                    }
                    structured_fields.insert(name.clone(), value);
                }
                Column::Text => {
                    texts.insert(name.as_str(), raw.to_string());
                }
                Column::Extension if !name.is_empty() => {
                    let value = if raw.is_empty() {
                        FieldValue::Empty
                    } else {
                        FieldValue::Category(raw.to_string())
                    };
                    structured_fields.insert(name.clone(), value);
                }
                Column::Extension => {}
            }
        }

        // optional columns missing from the table still appear, as empty values
        for spec in &self.schema.optional_fields {
            structured_fields
                .entry(spec.name.clone())
                .or_insert(FieldValue::Empty);
        }

        let text_fields = self
            .schema
            .text_fields
            .iter()
            .map(|name| TextField {
                name: name.clone(),
                value: texts.remove(name.as_str()).unwrap_or_default(),
            })
            .collect();

        debug!("Parsed record {} with {} structured fields", id, structured_fields.len());
        Ok(Document {
            id,
            structured_fields,
            text_fields,
        })
    }
}

fn parse_value(id: DocumentId, spec: &FieldSpec, raw: &str) -> Result<FieldValue> {
    if raw.is_empty() {
        return Ok(FieldValue::Empty);
    }
    match spec.kind {
        FieldKind::Categorical => Ok(FieldValue::Category(raw.to_string())),
        FieldKind::Numeric => match raw.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(FieldValue::Number(value)),
            _ => Err(KnowledgeError::schema(
                Some(id),
                Some(spec.name.as_str()),
                format!("'{}' is not a finite number", raw),
            )),
        },
    }
}

fn csv_error(error: csv::Error, origin: &str, record: Option<DocumentId>) -> KnowledgeError {
    if error.is_io_error() {
        KnowledgeError::SourceUnavailable {
            path: origin.to_string(),
            reason: error.to_string(),
        }
    } else {
        KnowledgeError::schema(record, None, format!("malformed record in {}: {}", origin, error))
    }
}
