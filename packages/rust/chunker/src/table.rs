//! Table-to-entity conversion.
//!
//! Each data row of an HTML table becomes one [`TableEntity`]: the first column is the key,
//! the remaining columns become attributes, and the table's headers decide which sentence
//! template renders it.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use tracing::trace;

use harvester_shared::OrderedMap;

/// Attribute carrying the label of the most recent single-cell group row.
pub const GROUP_ATTRIBUTE: &str = "Grupo";

/// Attribute carrying the topic inferred from the page URL.
pub const CONTEXT_ATTRIBUTE: &str = "Contexto";

/// URL substrings and the topic label they imply, checked in order.
const URL_TOPICS: &[(&[&str], &str)] = &[
    (&["redacao"], "competencia_redacao"),
    (&["cronograma", "datas"], "cronograma_enem"),
    (&["estrutura"], "estrutura_prova"),
    (&["nota"], "nota_minima"),
];

/// Keys shorter than this (in chars, after trimming) are not entities.
const MIN_KEY_CHARS: usize = 3;

static TABLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table").expect("valid table selector"));
static THEAD_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("thead").expect("valid thead selector"));
static CELL_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("th, td").expect("valid cell selector"));
static TR_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("tr").expect("valid tr selector"));
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

// ---------------------------------------------------------------------------
// Entity kinds
// ---------------------------------------------------------------------------

/// Semantic category inferred from a table's headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    ExamSchedule,
    EssayCompetency,
    ExamStructure,
    MinimumScore,
    Generic,
}

/// Header token sets, checked in order. A set matches when every token is a substring of
/// some lowercased header.
const KIND_PATTERNS: &[(EntityKind, &[&[&str]])] = &[
    (EntityKind::ExamSchedule, &[&["evento", "data"], &["etapa", "período"]]),
    (
        EntityKind::EssayCompetency,
        &[&["competência", "descrição"], &["nível", "descritor"]],
    ),
    (EntityKind::ExamStructure, &[&["área", "questões"], &["disciplina", "peso"]]),
    (EntityKind::MinimumScore, &[&["curso", "nota"], &["instituição", "pontuação"]]),
];

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExamSchedule => "exam_schedule",
            Self::EssayCompetency => "essay_competency",
            Self::ExamStructure => "exam_structure",
            Self::MinimumScore => "minimum_score",
            Self::Generic => "generic",
        }
    }

    pub fn infer(headers: &[String]) -> Self {
        let lowered: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();
        KIND_PATTERNS
            .iter()
            .find(|(_, sets)| {
                sets.iter().any(|tokens| {
                    tokens
                        .iter()
                        .all(|t| lowered.iter().any(|h| h.contains(t)))
                })
            })
            .map_or(Self::Generic, |(kind, _)| *kind)
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// One table row as a typed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableEntity {
    pub kind: EntityKind,
    pub key_field: String,
    pub key_value: String,
    pub attributes: OrderedMap,
    pub source_url: String,
    pub table_context: String,
}

impl TableEntity {
    /// First non-empty attribute whose header contains one of `tokens`, tried in order.
    fn attribute(&self, tokens: &[&str]) -> Option<&str> {
        tokens.iter().find_map(|token| {
            self.attributes
                .iter()
                .find(|(k, v)| !v.is_empty() && k.to_lowercase().contains(token))
                .map(|(_, v)| v)
        })
    }

    /// Natural-language sentence used as the chunk text.
    pub fn render(&self) -> String {
        let key = &self.key_value;
        match self.kind {
            EntityKind::ExamSchedule => {
                let period = self.attribute(&["data", "período"]).unwrap_or_default();
                format!("Evento do cronograma do ENEM: {key}. Data ou período: {period}.")
            }
            EntityKind::EssayCompetency => {
                let description = self.attribute(&["descrição", "descritor"]).unwrap_or_default();
                format!("Competência da redação do ENEM: {key}. {description}")
                    .trim_end()
                    .to_string()
            }
            EntityKind::ExamStructure => {
                let mut parts = vec![format!("Área do ENEM: {key}")];
                if let Some(q) = self.attribute(&["questões"]) {
                    parts.push(format!("Número de questões: {q}"));
                }
                if let Some(p) = self.attribute(&["peso"]) {
                    parts.push(format!("Peso: {p}"));
                }
                format!("{}.", parts.join(". "))
            }
            EntityKind::MinimumScore => {
                let mut parts = vec![format!("Nota mínima para o curso {key} no ENEM")];
                if let Some(i) = self.attribute(&["instituição"]) {
                    parts.push(format!("Instituição: {i}"));
                }
                if let Some(n) = self.attribute(&["nota", "pontuação"]) {
                    parts.push(format!("Nota exigida: {n}"));
                }
                format!("{}.", parts.join(". "))
            }
            EntityKind::Generic => {
                let pairs: Vec<String> = std::iter::once((self.key_field.as_str(), key.as_str()))
                    .chain(self.attributes.iter())
                    .filter(|(_, v)| !v.is_empty())
                    .map(|(k, v)| format!("{k}: {v}"))
                    .collect();
                format!("{}.", pairs.join(". "))
            }
        }
    }
}

/// Topic label for tables found under `source_url`, if its path names one.
pub fn url_topic(source_url: &str) -> Option<&'static str> {
    let url = source_url.to_lowercase();
    URL_TOPICS
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| url.contains(n)))
        .map(|(_, topic)| *topic)
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Header row and data rows of one table, cell text whitespace-collapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableGrid {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TableProcessor;

impl TableProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Parse the first `<table>` in `html`. `None` when there is no table or no row.
    pub fn parse(&self, html: &str) -> Option<TableGrid> {
        let fragment = Html::parse_fragment(html);
        let table = fragment.select(&TABLE_SEL).next()?;

        let all_rows: Vec<(bool, Vec<String>)> = table
            .select(&TR_SEL)
            .map(|tr| (in_thead(tr), row_cells(tr)))
            .collect();
        let first = all_rows.first()?;

        let thead_headers: Vec<String> = table
            .select(&THEAD_SEL)
            .next()
            .map(|thead| thead.select(&CELL_SEL).map(cell_text).collect())
            .unwrap_or_default();

        let (headers, data): (Vec<String>, Vec<Vec<String>>) = if !thead_headers.is_empty() {
            let body = all_rows
                .iter()
                .filter(|(head, _)| !head)
                .map(|(_, cells)| cells.clone())
                .collect();
            (thead_headers, body)
        } else if looks_like_header(&first.1) {
            let body = all_rows.iter().skip(1).map(|(_, c)| c.clone()).collect();
            (first.1.clone(), body)
        } else {
            let generated = (1..=first.1.len()).map(|i| format!("Coluna {i}")).collect();
            let body = all_rows.iter().map(|(_, c)| c.clone()).collect();
            (generated, body)
        };

        let rows = data
            .into_iter()
            .filter(|row| row.iter().any(|c| !c.is_empty()))
            .collect();
        Some(TableGrid { headers, rows })
    }

    /// Convert a parsed grid into entities. Misaligned rows are dropped.
    pub fn entities(
        &self,
        grid: &TableGrid,
        source_url: &str,
        table_context: &str,
    ) -> Vec<TableEntity> {
        let kind = EntityKind::infer(&grid.headers);
        let Some(key_field) = grid.headers.first() else {
            return Vec::new();
        };
        let topic = url_topic(source_url);

        let mut group: Option<&str> = None;
        let mut entities = Vec::new();

        for row in &grid.rows {
            let mut filled = row.iter().filter(|c| !c.is_empty());
            if grid.headers.len() > 1 && filled.clone().count() == 1 {
                group = filled.next().map(String::as_str);
                continue;
            }
            if row.len() != grid.headers.len() {
                trace!(cells = row.len(), headers = grid.headers.len(), "misaligned row dropped");
                continue;
            }
            let key_value = row[0].trim();
            if key_value.chars().count() < MIN_KEY_CHARS {
                continue;
            }

            let mut attributes: OrderedMap = grid.headers[1..]
                .iter()
                .zip(&row[1..])
                .map(|(h, c)| (h.as_str(), c.as_str()))
                .collect();
            if let Some(topic) = topic {
                attributes.insert(CONTEXT_ATTRIBUTE, topic);
            }
            if let Some(label) = group {
                attributes.insert(GROUP_ATTRIBUTE, label);
            }

            entities.push(TableEntity {
                kind,
                key_field: key_field.clone(),
                key_value: key_value.to_string(),
                attributes,
                source_url: source_url.to_string(),
                table_context: table_context.to_string(),
            });
        }

        entities
    }

    /// Parse and convert in one step. `None` when the markup holds no table grid.
    pub fn process(
        &self,
        html: &str,
        source_url: &str,
        table_context: &str,
    ) -> Option<Vec<TableEntity>> {
        self.parse(html)
            .map(|grid| self.entities(&grid, source_url, table_context))
    }
}

fn in_thead(tr: ElementRef<'_>) -> bool {
    tr.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| a.value().name() == "thead")
}

/// Direct `th`/`td` children only, so nested tables do not leak cells.
fn row_cells(tr: ElementRef<'_>) -> Vec<String> {
    tr.children()
        .filter_map(ElementRef::wrap)
        .filter(|c| matches!(c.value().name(), "th" | "td"))
        .map(cell_text)
        .collect()
}

fn cell_text(cell: ElementRef<'_>) -> String {
    let joined = cell.text().collect::<Vec<_>>().join(" ");
    WHITESPACE_RE.replace_all(&joined, " ").trim().to_string()
}

/// A first row is a header when fewer than half of its cells are numeric.
fn looks_like_header(cells: &[String]) -> bool {
    if cells.is_empty() {
        return false;
    }
    let numeric = cells
        .iter()
        .filter(|c| {
            let digits: String = c.chars().filter(|ch| !matches!(ch, '.' | ',' | ' ')).collect();
            !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit())
        })
        .count();
    numeric * 2 < cells.len()
}
