use crate::config::ChunkingConfig;
use nutrikal_common::{Chunk, ChunkId, Document, KnowledgeError, Result};
use rayon::prelude::*;
use tracing::debug;

/// Splits rendered document text into overlapping fixed-size windows.
///
/// Window `i` covers chars `[i * (W - O), min(i * (W - O) + W, L))`. The
/// window stops advancing as soon as one reaches the end of the text, so the
/// last chunk always ends at `L` and a text shorter than `W` yields one chunk.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    window_size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(window_size: usize, overlap: usize) -> Result<Self> {
        if window_size == 0 {
            return Err(KnowledgeError::InvalidChunkConfig {
                window_size,
                overlap,
                reason: "window_size must be greater than zero".to_string(),
            });
        }
        if overlap >= window_size {
            return Err(KnowledgeError::InvalidChunkConfig {
                window_size,
                overlap,
                reason: "overlap must be smaller than window_size".to_string(),
            });
        }
        Ok(Self { window_size, overlap })
    }

    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        Self::new(config.window_size, config.overlap)
    }

    fn step(&self) -> usize {
        self.window_size - self.overlap
    }

    /// Number of chunks a text of `len` chars produces.
    pub fn expected_chunks(&self, len: usize) -> usize {
        match len {
            0 => 0,
            len if len <= self.window_size => 1,
            len => 1 + (len - self.window_size).div_ceil(self.step()),
        }
    }

    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        let text = document.render_text();

        // byte position of every char boundary, including the end of the text
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(index, _)| index)
            .chain(std::iter::once(text.len()))
            .collect();
        let len = boundaries.len() - 1;

        let mut chunks = Vec::with_capacity(self.expected_chunks(len));
        let mut start = 0;
        while start < len {
            let end = (start + self.window_size).min(len);
            let sequence_index = chunks.len() as u32;
            chunks.push(Chunk {
                chunk_id: ChunkId::new(document.id, sequence_index),
                source_document_id: document.id,
                sequence_index,
                text: text[boundaries[start]..boundaries[end]].to_string(),
                start_offset: start,
                end_offset: end,
            });
            if end == len {
                break;
            }
            start += self.step();
        }

        debug!("Document {} ({} chars) split into {} chunks", document.id, len, chunks.len());
        chunks
    }

    /// Chunks documents independently in parallel, preserving input order.
    pub fn chunk_all(&self, documents: &[Document]) -> Vec<Chunk> {
        documents
            .par_iter()
            .map(|document| self.chunk(document))
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Free-function form of [`Chunker::chunk`].
pub fn chunk(document: &Document, window_size: usize, overlap: usize) -> Result<Vec<Chunk>> {
    Ok(Chunker::new(window_size, overlap)?.chunk(document))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutrikal_common::{StructuredFields, TextField};
    use proptest::prelude::*;

    fn text_document(id: u64, body: &str) -> Document {
        Document {
            id,
            structured_fields: StructuredFields::new(),
            text_fields: vec![TextField {
                name: "t".to_string(),
                value: body.to_string(),
            }],
        }
    }

    fn rendered_len(document: &Document) -> usize {
        document.render_text().chars().count()
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            Chunker::new(0, 0),
            Err(KnowledgeError::InvalidChunkConfig { .. })
        ));
        assert!(matches!(
            Chunker::new(10, 10),
            Err(KnowledgeError::InvalidChunkConfig { .. })
        ));
        assert!(chunk(&text_document(0, "abc"), 5, 7).is_err());
        assert!(Chunker::new(10, 9).is_ok());
    }

    #[test]
    fn test_window_offsets() {
        // "t: " prefix plus 447 chars = 450 chars
        let document = text_document(7, &"x".repeat(447));
        let chunks = Chunker::new(200, 20).unwrap().chunk(&document);

        let spans: Vec<(usize, usize)> =
            chunks.iter().map(|c| (c.start_offset, c.end_offset)).collect();
        assert_eq!(spans, vec![(0, 200), (180, 380), (360, 450)]);
        assert_eq!(chunks[2].text.chars().count(), 90);
        assert_eq!(chunks[1].chunk_id, ChunkId::new(7, 1));
        assert!(chunks.iter().all(|c| c.source_document_id == 7));
    }

    #[test]
    fn test_short_document_yields_one_chunk() {
        let document = text_document(1, "Saumon grillé");
        let chunks = Chunker::new(200, 20).unwrap().chunk(&document);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, document.render_text());
        assert_eq!(chunks[0].end_offset, rendered_len(&document));
    }

    #[test]
    fn test_empty_document_yields_no_chunks() {
        let document = Document {
            id: 0,
            structured_fields: StructuredFields::new(),
            text_fields: Vec::new(),
        };
        assert!(Chunker::new(200, 20).unwrap().chunk(&document).is_empty());
    }

    #[test]
    fn test_multibyte_text_is_split_on_chars() {
        let document = text_document(0, "éééééééééé");
        let chunks = Chunker::new(5, 1).unwrap().chunk(&document);
        let rebuilt: String = chunks[0].text.clone();
        assert_eq!(rebuilt, "t: éé");
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 5));
        assert_eq!(chunks.last().unwrap().end_offset, 13);
    }

    #[test]
    fn test_chunk_all_keeps_document_order() {
        let documents = vec![
            text_document(0, &"a".repeat(300)),
            text_document(1, "short"),
            text_document(2, &"b".repeat(500)),
        ];
        let chunker = Chunker::new(200, 20).unwrap();
        let chunks = chunker.chunk_all(&documents);

        let ids: Vec<ChunkId> = chunks.iter().map(|c| c.chunk_id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);

        let expected: usize = documents
            .iter()
            .map(|d| chunker.expected_chunks(rendered_len(d)))
            .sum();
        assert_eq!(chunks.len(), expected);
    }

    proptest! {
        #[test]
        fn prop_chunks_cover_text_with_exact_overlap(
            body in "[a-zé ]{0,600}",
            window_size in 1usize..120,
            overlap_seed in 0usize..120,
        ) {
            let overlap = overlap_seed % window_size;
            let document = text_document(3, &body);
            let chunker = Chunker::new(window_size, overlap).unwrap();
            let chunks = chunker.chunk(&document);
            let len = rendered_len(&document);
            let chars: Vec<char> = document.render_text().chars().collect();

            prop_assert_eq!(chunks.len(), chunker.expected_chunks(len));
            prop_assert_eq!(chunks[0].start_offset, 0);
            prop_assert_eq!(chunks.last().unwrap().end_offset, len);

            for (i, c) in chunks.iter().enumerate() {
                prop_assert_eq!(c.sequence_index as usize, i);
                prop_assert_eq!(c.start_offset, i * (window_size - overlap));
                prop_assert!(c.end_offset - c.start_offset <= window_size);
                let expected: String = chars[c.start_offset..c.end_offset].iter().collect();
                prop_assert_eq!(&c.text, &expected);
            }
            for pair in chunks.windows(2) {
                // no gaps, and consecutive windows share exactly `overlap` chars
                prop_assert!(pair[1].start_offset <= pair[0].end_offset);
                prop_assert_eq!(pair[0].end_offset - pair[1].start_offset, overlap);
            }
        }

        #[test]
        fn prop_chunking_is_deterministic(body in ".{0,400}", window_size in 1usize..64) {
            let document = text_document(9, &body);
            let chunker = Chunker::new(window_size, window_size / 3).unwrap();
            prop_assert_eq!(chunker.chunk(&document), chunker.chunk(&document));
        }
    }
}
