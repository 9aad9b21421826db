//! Block → [`SemanticChunk`] conversion.

use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use harvester_shared::{
    BlockKind, ChunkMetadata, ChunkType, Confidence, ContentBlock, CrawlConfig, SemanticChunk,
    SourceType, TableSummary,
};

use crate::split::TextSplitter;
use crate::table::{TableEntity, TableProcessor};

const CONTEXT_SEPARATOR: &str = " > ";

/// Content address of a chunk: lowercase hex SHA-256 of `"{source_url}:{text}"`.
pub fn chunk_hash(source_url: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_url.as_bytes());
    hasher.update(b":");
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Default)]
pub struct SemanticChunker {
    splitter: TextSplitter,
    tables: TableProcessor,
}

impl From<&CrawlConfig> for SemanticChunker {
    fn from(config: &CrawlConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_overlap)
    }
}

impl SemanticChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            splitter: TextSplitter::new(chunk_size, chunk_overlap),
            tables: TableProcessor::new(),
        }
    }

    /// Chunks for every block, in block order.
    #[instrument(skip_all, fields(blocks = blocks.len()))]
    pub fn chunk_blocks(&self, blocks: &[ContentBlock]) -> Vec<SemanticChunk> {
        let chunks: Vec<SemanticChunk> = blocks.iter().flat_map(|b| self.chunk_block(b)).collect();
        debug!(chunks = chunks.len(), "blocks chunked");
        chunks
    }

    pub fn chunk_block(&self, block: &ContentBlock) -> Vec<SemanticChunk> {
        match &block.kind {
            BlockKind::Text { atomic } => self.text_chunks(block, *atomic),
            BlockKind::List { .. } => self.list_chunk(block).into_iter().collect(),
            BlockKind::Table { summary } => self.table_chunks(block, summary),
            BlockKind::Iframe => self.iframe_chunk(block).into_iter().collect(),
        }
    }

    fn text_chunks(&self, block: &ContentBlock, atomic: bool) -> Vec<SemanticChunk> {
        let content = block.content.trim();
        if content.is_empty() {
            return Vec::new();
        }
        let pieces = if atomic {
            vec![content.to_string()]
        } else {
            self.splitter.split(content)
        };

        let header = block.context.joined(CONTEXT_SEPARATOR);
        pieces
            .into_iter()
            .map(|piece| {
                let metadata = ChunkMetadata::new(
                    ChunkType::Text,
                    &block.source_url,
                    "text",
                    block.confidence,
                    block.context.clone(),
                );
                make_chunk(with_header(&header, &piece), metadata)
            })
            .collect()
    }

    fn list_chunk(&self, block: &ContentBlock) -> Option<SemanticChunk> {
        if block.content.trim().is_empty() {
            return None;
        }
        let metadata = ChunkMetadata::new(
            ChunkType::Text,
            &block.source_url,
            "list",
            block.confidence,
            block.context.clone(),
        );
        Some(make_chunk(block.content.clone(), metadata))
    }

    fn table_chunks(&self, block: &ContentBlock, summary: &TableSummary) -> Vec<SemanticChunk> {
        let table_context = block.context.joined(CONTEXT_SEPARATOR);
        match self
            .tables
            .process(&block.content, &block.source_url, &table_context)
        {
            Some(entities) => entities
                .into_iter()
                .map(|entity| entity_chunk(block, entity))
                .collect(),
            None => {
                debug!(url = %block.source_url, "unparseable table, using summary text");
                let text = summary.render();
                if text.trim().is_empty() {
                    return Vec::new();
                }
                let metadata = ChunkMetadata::new(
                    ChunkType::Text,
                    &block.source_url,
                    "table",
                    Confidence::Low,
                    block.context.clone(),
                );
                vec![make_chunk(with_header(&table_context, &text), metadata)]
            }
        }
    }

    fn iframe_chunk(&self, block: &ContentBlock) -> Option<SemanticChunk> {
        let src = block.content.trim();
        if src.is_empty() {
            return None;
        }
        let mut metadata = ChunkMetadata::new(
            ChunkType::Text,
            &block.source_url,
            "iframe",
            block.confidence,
            block.context.clone(),
        );
        metadata.source_type = SourceType::Iframe;
        metadata.iframe_src = Some(src.to_string());
        Some(make_chunk(
            format!("Conteúdo incorporado disponível em: {src}"),
            metadata,
        ))
    }
}

fn entity_chunk(block: &ContentBlock, entity: TableEntity) -> SemanticChunk {
    let mut metadata = ChunkMetadata::new(
        ChunkType::TableEntity,
        &block.source_url,
        entity.kind.as_str(),
        block.confidence,
        block.context.clone(),
    );
    let text = entity.render();
    metadata.key_field = Some(entity.key_field);
    metadata.key_value = Some(entity.key_value);
    metadata.attributes = entity.attributes;
    metadata.table_context = Some(entity.table_context).filter(|c| !c.is_empty());
    make_chunk(text, metadata)
}

fn with_header(header: &str, text: &str) -> String {
    if header.is_empty() {
        text.to_string()
    } else {
        format!("{header}\n{text}")
    }
}

fn make_chunk(text: String, metadata: ChunkMetadata) -> SemanticChunk {
    SemanticChunk {
        hash: chunk_hash(&metadata.source_url, &text),
        text,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_shared::{ContextSnapshot, OrderedMap};

    const URL: &str = "https://www.gov.br/inep/enem";

    fn block(kind: BlockKind, content: &str, context: ContextSnapshot) -> ContentBlock {
        ContentBlock {
            kind,
            content: content.to_string(),
            context,
            source_url: URL.to_string(),
            confidence: Confidence::High,
        }
    }

    fn ctx(pairs: &[(&str, &str)]) -> ContextSnapshot {
        pairs.iter().copied().collect()
    }

    #[test]
    fn hash_is_pure_and_sensitive() {
        let a = chunk_hash(URL, "Inscrições abertas");
        assert_eq!(a, chunk_hash(URL, "Inscrições abertas"));
        assert_ne!(a, chunk_hash(URL, "Inscrições abertaS"));
        assert_ne!(a, chunk_hash("https://www.gov.br/inep/sisu", "Inscrições abertas"));
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn hash_covers_url_colon_text() {
        let mut hasher = Sha256::new();
        hasher.update("https://a.gov.br/x:Edital".as_bytes());
        let expected = format!("{:x}", hasher.finalize());
        assert_eq!(chunk_hash("https://a.gov.br/x", "Edital"), expected);
    }

    #[test]
    fn text_chunks_carry_context_prefix() {
        let chunker = SemanticChunker::default();
        let b = block(
            BlockKind::Text { atomic: false },
            "Prazo de inscrição prorrogado.",
            ctx(&[("h2", "Inscrição"), ("h3", "Prazos")]),
        );
        let chunks = chunker.chunk_block(&b);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Inscrição > Prazos\nPrazo de inscrição prorrogado.");
        assert_eq!(chunks[0].hash, chunk_hash(URL, &chunks[0].text));
        assert_eq!(chunks[0].metadata.chunk_type, ChunkType::Text);
        assert_eq!(chunks[0].metadata.entity_type, "text");
        assert_eq!(chunks[0].metadata.context.get("h3"), Some("Prazos"));
    }

    #[test]
    fn atomic_text_is_never_split() {
        let chunker = SemanticChunker::new(50, 10);
        let long = "I - documento de identidade com foto; ".repeat(10);
        let b = block(
            BlockKind::Text { atomic: true },
            &long,
            ctx(&[("pseudo", "Documentos necessários para inscrição:")]),
        );
        assert_eq!(chunker.chunk_block(&b).len(), 1);

        let b = block(BlockKind::Text { atomic: false }, &long, OrderedMap::new());
        let split = chunker.chunk_block(&b);
        assert!(split.len() > 1);
        assert!(split.iter().all(|c| c.text.chars().count() <= 50));
    }

    #[test]
    fn list_is_one_verbatim_chunk() {
        let chunker = SemanticChunker::default();
        let b = block(
            BlockKind::List { ordered: false },
            "• RG\n• CPF",
            ctx(&[("h2", "Documentos")]),
        );
        let chunks = chunker.chunk_block(&b);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "• RG\n• CPF");
        assert_eq!(chunks[0].metadata.entity_type, "list");
    }

    #[test]
    fn table_rows_become_entity_chunks() {
        let chunker = SemanticChunker::default();
        let b = block(
            BlockKind::Table {
                summary: TableSummary::default(),
            },
            "<table><tr><th>Evento</th><th>Data</th></tr>\
             <tr><td>Inscrições</td><td>10/01 a 20/01</td></tr>\
             <tr><td>Provas</td><td>05/11</td></tr></table>",
            ctx(&[("h2", "Cronograma")]),
        );
        let chunks = chunker.chunk_block(&b);

        assert_eq!(chunks.len(), 2);
        let first = &chunks[0];
        assert_eq!(
            first.text,
            "Evento do cronograma do ENEM: Inscrições. Data ou período: 10/01 a 20/01."
        );
        assert_eq!(first.metadata.chunk_type, ChunkType::TableEntity);
        assert_eq!(first.metadata.entity_type, "exam_schedule");
        assert_eq!(first.metadata.key_field.as_deref(), Some("Evento"));
        assert_eq!(first.metadata.key_value.as_deref(), Some("Inscrições"));
        assert_eq!(first.metadata.attributes.get("Data"), Some("10/01 a 20/01"));
        assert_eq!(first.metadata.table_context.as_deref(), Some("Cronograma"));
    }

    #[test]
    fn unparseable_table_falls_back_to_summary() {
        let chunker = SemanticChunker::default();
        let summary = TableSummary {
            headers: vec!["Campus".into(), "Vagas".into()],
            rows: vec![vec!["Picos".into(), "40".into()]],
            columns: 2,
        };
        let b = block(BlockKind::Table { summary }, "<div>quebrado</div>", OrderedMap::new());
        let chunks = chunker.chunk_block(&b);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Campus | Vagas\nPicos | 40");
        assert_eq!(chunks[0].metadata.confidence, Confidence::Low);
        assert_eq!(chunks[0].metadata.chunk_type, ChunkType::Text);
    }

    #[test]
    fn iframe_chunk() {
        let chunker = SemanticChunker::default();
        let mut b = block(BlockKind::Iframe, "https://www.youtube.com/embed/x", OrderedMap::new());
        b.confidence = Confidence::Medium;
        let chunks = chunker.chunk_block(&b);

        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].text,
            "Conteúdo incorporado disponível em: https://www.youtube.com/embed/x"
        );
        assert_eq!(chunks[0].metadata.source_type, SourceType::Iframe);
        assert_eq!(
            chunks[0].metadata.iframe_src.as_deref(),
            Some("https://www.youtube.com/embed/x")
        );
        assert_eq!(chunks[0].metadata.confidence, Confidence::Medium);
    }

    #[test]
    fn metadata_serializes_without_empty_fields() {
        let chunker = SemanticChunker::default();
        let b = block(BlockKind::Text { atomic: false }, "Texto.", OrderedMap::new());
        let chunk = &chunker.chunk_block(&b)[0];
        let json = serde_json::to_value(&chunk.metadata).unwrap();

        assert_eq!(json["type"], "text");
        assert_eq!(json["source_type"], "html");
        assert!(json.get("key_field").is_none());
        assert!(json.get("iframe_src").is_none());
    }
}
