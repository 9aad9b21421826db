//! Single-pass block extraction.
//!
//! The cleaned content region is walked once in document order. Headings and callouts drive
//! the [`SectionContextBuilder`], prose accumulates in a buffer that is flushed as a text block
//! whenever structure changes, and lists, tables and iframes become blocks of their own.
//! Every element that produced output is recorded so its descendants are never read twice.

use std::collections::HashSet;
use std::sync::LazyLock;

use ego_tree::NodeId;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use tracing::{debug, instrument};
use url::Url;

use harvester_shared::{
    BlockKind, Confidence, ContentBlock, ContextSnapshot, Result, TableSummary,
};

use crate::clean::clean_fragment;
use crate::layout::{LayoutMatch, LayoutTable};
use crate::section::{FrameKind, SectionContextBuilder};

const UNTITLED: &str = "Untitled";

const TEXT_TAGS: &[&str] = &["p", "a", "strong"];
const HEADING_TAGS: &[&str] = &["h1", "h2", "h3", "h4", "h5", "h6"];
const DIV_BLOCKERS: &[&str] = &["p", "ul", "ol", "table", "h1", "h2", "h3", "h4", "h5", "h6"];

/// Roman-numeral enumeration lines (`I - ...`, `XIV – ...`) continue an open pseudo-header.
static ENUM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(I|II|III|IV|V|VI|VII|VIII|IX|X|XI|XII|XIII|XIV|XV|XVI|XVII|XVIII)\s*[–-]")
        .expect("valid enumeration regex")
});

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

static TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("valid title selector"));
static ARTICLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("article").expect("valid article selector"));
static CONTENT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div#content").expect("valid content selector"));
static BODY_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("valid body selector"));
static LINK_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid link selector"));
static TH_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("th").expect("valid th selector"));
static TR_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("tr").expect("valid tr selector"));
static TD_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("td").expect("valid td selector"));

/// Result of extracting one page.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractedPage {
    pub url: String,
    pub title: String,
    /// Name of the detected layout, `skip` when only links were collected.
    pub layout: String,
    pub blocks: Vec<ContentBlock>,
    /// Absolute outbound links, deduplicated in document order.
    pub links: Vec<String>,
}

/// Turns fetched HTML into context-annotated [`ContentBlock`]s.
#[derive(Debug, Clone)]
pub struct BlockExtractor {
    layouts: LayoutTable,
}

impl BlockExtractor {
    pub fn new(layouts: LayoutTable) -> Self {
        Self { layouts }
    }

    /// Extractor using the built-in layout rule table.
    pub fn builtin() -> Result<Self> {
        Ok(Self::new(LayoutTable::builtin()?))
    }

    pub fn layouts(&self) -> &LayoutTable {
        &self.layouts
    }

    #[instrument(skip_all, fields(url = %page_url))]
    pub fn extract(&self, html: &str, page_url: &Url) -> ExtractedPage {
        let document = Html::parse_document(html);
        let title = page_title(&document);
        let links = extract_links(&document, page_url);
        let url = page_url.as_str();

        let layout = match self.layouts.detect(url) {
            LayoutMatch::Skip => {
                debug!(links = links.len(), "skip layout, collecting links only");
                return ExtractedPage {
                    url: url.to_string(),
                    title,
                    layout: LayoutMatch::Skip.name().to_string(),
                    blocks: Vec::new(),
                    links,
                };
            }
            LayoutMatch::Layout(layout) => layout,
        };

        let region = main_region(&document).map(|el| el.html()).unwrap_or_default();
        let cleaned = clean_fragment(
            &region,
            self.layouts
                .always_remove()
                .iter()
                .chain(layout.selectors()),
        );

        let mut walk = PageWalk::new(page_url, &title);
        for label in self.layouts.context_seeds(url) {
            walk.sections.update_context("h0", label, FrameKind::Persistent);
        }
        walk.run(cleaned.root_element(), self.layouts.skips_tables(url));

        let blocks = walk.blocks;
        debug!(layout = layout.name(), blocks = blocks.len(), "page extracted");
        ExtractedPage {
            url: url.to_string(),
            title,
            layout: layout.name().to_string(),
            blocks,
            links,
        }
    }
}

/// Every `<a href>` on the page resolved against `base`, without scripts, mail, phone or
/// fragment links.
pub fn extract_links(document: &Html, base: &Url) -> Vec<String> {
    let mut seen = HashSet::new();
    document
        .select(&LINK_SEL)
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty())
        .filter_map(|href| base.join(href).ok())
        .filter(|u| !matches!(u.scheme(), "javascript" | "mailto" | "tel"))
        .filter(|u| u.fragment().is_none())
        .map(String::from)
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Per-page state
// ---------------------------------------------------------------------------

struct PageWalk<'a> {
    page_url: &'a Url,
    title: &'a str,
    sections: SectionContextBuilder,
    consumed: HashSet<NodeId>,
    buffer: Vec<String>,
    blocks: Vec<ContentBlock>,
}

impl<'a> PageWalk<'a> {
    fn new(page_url: &'a Url, title: &'a str) -> Self {
        Self {
            page_url,
            title,
            sections: SectionContextBuilder::new(),
            consumed: HashSet::new(),
            buffer: Vec::new(),
            blocks: Vec::new(),
        }
    }

    fn run(&mut self, root: ElementRef<'_>, skip_tables: bool) {
        for node in root.descendants().skip(1) {
            let Some(el) = ElementRef::wrap(node) else {
                continue;
            };
            if self.is_consumed(el) || inside_table(el) {
                continue;
            }

            let name = el.value().name();
            if HEADING_TAGS.contains(&name) || has_class(el, "callout") {
                self.heading(el);
            } else if name == "div" && is_leaf_div(el) {
                let text = element_text(el);
                if !text.is_empty() {
                    self.buffer.push(text);
                    self.consumed.insert(el.id());
                }
            } else if TEXT_TAGS.contains(&name) && !parent_is_text_tag(el) {
                self.prose(el);
            } else if name == "ul" || name == "ol" {
                self.list(el, name == "ol");
            } else if name == "table" {
                if !skip_tables {
                    self.table(el);
                }
            } else if name == "iframe" {
                self.iframe(el);
            }
        }
        self.flush();
    }

    fn is_consumed(&self, el: ElementRef<'_>) -> bool {
        el.ancestors().any(|a| self.consumed.contains(&a.id()))
    }

    fn heading(&mut self, el: ElementRef<'_>) {
        let text = element_text(el);
        self.flush();
        self.sections.pop_temporary_context();
        if text.is_empty() {
            return;
        }
        let tag = el.value().name();
        let tag = if HEADING_TAGS.contains(&tag) { tag } else { "pseudo" };
        self.sections.update_context(tag, text, FrameKind::Persistent);
        self.consumed.insert(el.id());
    }

    fn prose(&mut self, el: ElementRef<'_>) {
        let text = element_text(el);
        if text.is_empty() {
            return;
        }
        self.consumed.insert(el.id());

        if self.sections.has_temporary_context() && !is_enumeration(&text) {
            self.flush();
            self.sections.pop_temporary_context();
        }

        if is_pseudo_header(&text) {
            // Text read so far belongs to the context before this header.
            self.flush();
            self.sections.update_context("pseudo", text, FrameKind::Temporary);
        } else {
            self.buffer.push(text);
        }
    }

    fn list(&mut self, el: ElementRef<'_>, ordered: bool) {
        let items: Vec<String> = el
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|li| li.value().name() == "li")
            .map(element_text)
            .filter(|t| !t.is_empty())
            .collect();
        if items.is_empty() {
            return;
        }

        let context = self.context();
        self.flush_and_close();
        self.push_block(
            BlockKind::List { ordered },
            items.iter().map(|i| format!("• {i}")).collect::<Vec<_>>().join("\n"),
            context,
            Confidence::High,
        );
        self.consumed.insert(el.id());
    }

    fn table(&mut self, el: ElementRef<'_>) {
        let context = self.context();
        self.flush_and_close();
        self.push_block(
            BlockKind::Table {
                summary: table_summary(el),
            },
            el.html(),
            context,
            Confidence::High,
        );
        self.consumed.insert(el.id());
    }

    fn iframe(&mut self, el: ElementRef<'_>) {
        let Some(src) = el.value().attr("src").map(str::trim).filter(|s| !s.is_empty()) else {
            return;
        };
        let Ok(resolved) = self.page_url.join(src) else {
            debug!(src, "unresolvable iframe src");
            return;
        };
        let context = self.context();
        self.flush();
        self.push_block(BlockKind::Iframe, resolved.to_string(), context, Confidence::Medium);
        self.consumed.insert(el.id());
    }

    /// Flush, closing an open pseudo-header if a block was emitted.
    fn flush_and_close(&mut self) {
        if self.flush() {
            self.sections.pop_temporary_context();
        }
    }

    /// Emit the buffer as a text block under the current context. Returns whether a block
    /// was emitted.
    fn flush(&mut self) -> bool {
        let text = self.buffer.join("\n");
        self.buffer.clear();
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        let atomic = self.sections.has_temporary_context();
        let context = self.context();
        self.push_block(BlockKind::Text { atomic }, text.to_string(), context, Confidence::High);
        true
    }

    fn context(&self) -> ContextSnapshot {
        let context = self.sections.current_context();
        if context.is_empty() {
            [("title", self.title)].into_iter().collect()
        } else {
            context
        }
    }

    fn push_block(
        &mut self,
        kind: BlockKind,
        content: String,
        context: ContextSnapshot,
        confidence: Confidence,
    ) {
        self.blocks.push(ContentBlock {
            kind,
            content,
            context,
            source_url: self.page_url.to_string(),
            confidence,
        });
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn page_title(document: &Html) -> String {
    document
        .select(&TITLE_SEL)
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| UNTITLED.to_string())
}

fn main_region(document: &Html) -> Option<ElementRef<'_>> {
    document
        .select(&ARTICLE_SEL)
        .next()
        .or_else(|| document.select(&CONTENT_SEL).next())
        .or_else(|| document.select(&BODY_SEL).next())
}

/// Text nodes joined by spaces with whitespace runs collapsed.
fn element_text(el: ElementRef<'_>) -> String {
    let joined = el.text().collect::<Vec<_>>().join(" ");
    WHITESPACE_RE.replace_all(&joined, " ").trim().to_string()
}

fn has_class(el: ElementRef<'_>, class: &str) -> bool {
    el.value().classes().any(|c| c == class)
}

fn inside_table(el: ElementRef<'_>) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| a.value().name() == "table")
}

fn parent_is_text_tag(el: ElementRef<'_>) -> bool {
    el.parent()
        .and_then(ElementRef::wrap)
        .is_some_and(|p| TEXT_TAGS.contains(&p.value().name()))
}

fn is_leaf_div(el: ElementRef<'_>) -> bool {
    !el.descendants()
        .skip(1)
        .filter_map(ElementRef::wrap)
        .any(|d| DIV_BLOCKERS.contains(&d.value().name()))
}

fn is_enumeration(text: &str) -> bool {
    ENUM_RE.is_match(text)
}

/// A colon-terminated lead-in line such as `Documentos necessários para inscrição:`.
fn is_pseudo_header(text: &str) -> bool {
    let text = text.trim();
    if !text.ends_with(':') || text.chars().count() < 25 {
        return false;
    }
    let lower = text.to_lowercase();
    !["http", "www", "@", "email"]
        .iter()
        .any(|marker| lower.contains(marker))
}

fn table_summary(table: ElementRef<'_>) -> TableSummary {
    let headers: Vec<String> = table.select(&TH_SEL).map(element_text).collect();
    let rows: Vec<Vec<String>> = table
        .select(&TR_SEL)
        .map(|tr| tr.select(&TD_SEL).map(element_text).collect::<Vec<_>>())
        .filter(|row| !row.is_empty())
        .collect();
    let columns = if headers.is_empty() {
        rows.first().map_or(0, Vec::len)
    } else {
        headers.len()
    };
    TableSummary {
        headers,
        rows,
        columns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> BlockExtractor {
        BlockExtractor::builtin().expect("built-in layouts")
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn texts(page: &ExtractedPage) -> Vec<&str> {
        page.blocks.iter().map(|b| b.content.as_str()).collect()
    }

    #[test]
    fn pseudo_header_scenario() {
        let html = r#"<html><head><title>Matrícula</title></head><body><article>
            <h2>Inscrição</h2>
            <p>Documentos necessários para inscrição:</p>
            <p>I - RG</p>
            <p>II - CPF</p>
            <p>Mais informações na secretaria.</p>
        </article></body></html>"#;
        let page = extractor().extract(html, &url("https://example.gov.br/matricula"));

        assert_eq!(page.blocks.len(), 2);
        let first = &page.blocks[0];
        assert_eq!(first.content, "I - RG\nII - CPF");
        assert!(first.is_atomic());
        assert_eq!(first.context.get("h2"), Some("Inscrição"));
        assert_eq!(
            first.context.get("pseudo"),
            Some("Documentos necessários para inscrição:")
        );

        let second = &page.blocks[1];
        assert_eq!(second.content, "Mais informações na secretaria.");
        assert!(!second.is_atomic());
        assert_eq!(second.context.get("h2"), Some("Inscrição"));
        assert_eq!(second.context.get("pseudo"), None);
    }

    #[test]
    fn prose_before_pseudo_header_keeps_its_own_context() {
        let html = r#"<html><head><title>Matrícula</title></head><body><article>
            <h2>Inscrição</h2>
            <p>Leia o edital com atenção.</p>
            <p>Documentos necessários para inscrição:</p>
            <p>I - RG</p>
            <p>Outro assunto.</p>
        </article></body></html>"#;
        let page = extractor().extract(html, &url("https://example.gov.br/matricula"));

        assert_eq!(page.blocks.len(), 3);
        let intro = &page.blocks[0];
        assert_eq!(intro.content, "Leia o edital com atenção.");
        assert!(!intro.is_atomic());
        assert_eq!(intro.context.get("h2"), Some("Inscrição"));
        assert_eq!(intro.context.get("pseudo"), None);

        let items = &page.blocks[1];
        assert_eq!(items.content, "I - RG");
        assert!(items.is_atomic());
        assert_eq!(
            items.context.get("pseudo"),
            Some("Documentos necessários para inscrição:")
        );

        assert_eq!(page.blocks[2].content, "Outro assunto.");
        assert_eq!(page.blocks[2].context.get("pseudo"), None);
    }

    #[test]
    fn headings_flush_under_previous_context() {
        let html = r#"<html><head><title>Edital</title></head><body><article>
            <p>Texto introdutório.</p>
            <h2>Cronograma</h2>
            <p>Datas do processo.</p>
            <h3>Recursos</h3>
            <p>Prazo de recurso.</p>
            <h2>Resultado</h2>
            <p>Divulgação final.</p>
        </article></body></html>"#;
        let page = extractor().extract(html, &url("https://example.gov.br/edital"));

        assert_eq!(
            texts(&page),
            vec![
                "Texto introdutório.",
                "Datas do processo.",
                "Prazo de recurso.",
                "Divulgação final."
            ]
        );
        assert_eq!(page.blocks[0].context.get("title"), Some("Edital"));
        assert_eq!(page.blocks[2].context.joined(" > "), "Cronograma > Recursos");
        assert_eq!(page.blocks[3].context.joined(" > "), "Resultado");
    }

    #[test]
    fn nested_text_is_not_duplicated() {
        let html = r#"<html><body><article>
            <p>Leia o <a href="/edital">edital</a> com <strong>atenção</strong>.</p>
            <div><span>Bloco</span> simples</div>
            <ul><li><p>Item um</p></li><li>Item dois</li></ul>
        </article></body></html>"#;
        let page = extractor().extract(html, &url("https://example.gov.br/x"));

        assert_eq!(page.blocks.len(), 2);
        assert_eq!(page.blocks[0].content, "Leia o edital com atenção .\nBloco simples");
        assert_eq!(page.blocks[1].content, "• Item um\n• Item dois");
        assert_eq!(page.blocks[1].kind, BlockKind::List { ordered: false });
    }

    #[test]
    fn list_keeps_pseudo_header_context() {
        let html = r#"<html><body><article>
            <h2>Matrícula</h2>
            <p>Documentos exigidos no ato da matrícula:</p>
            <ol><li>RG</li><li>CPF</li></ol>
            <p>Após a entrega, aguarde.</p>
        </article></body></html>"#;
        let page = extractor().extract(html, &url("https://example.gov.br/m"));

        assert_eq!(page.blocks.len(), 2);
        let list = &page.blocks[0];
        assert_eq!(list.kind, BlockKind::List { ordered: true });
        assert_eq!(
            list.context.get("pseudo"),
            Some("Documentos exigidos no ato da matrícula:")
        );
        assert_eq!(page.blocks[1].context.get("pseudo"), None);
    }

    #[test]
    fn tables_are_single_blocks() {
        let html = r#"<html><body><article>
            <h2>Cronograma</h2>
            <table>
              <thead><tr><th>Evento</th><th>Data</th></tr></thead>
              <tbody><tr><td><p>Inscrições</p></td><td>10/01 a 20/01</td></tr></tbody>
            </table>
        </article></body></html>"#;
        let page = extractor().extract(html, &url("https://example.gov.br/c"));

        assert_eq!(page.blocks.len(), 1);
        let table = &page.blocks[0];
        assert!(table.content.starts_with("<table"));
        match &table.kind {
            BlockKind::Table { summary } => {
                assert_eq!(summary.headers, vec!["Evento", "Data"]);
                assert_eq!(summary.rows, vec![vec!["Inscrições", "10/01 a 20/01"]]);
                assert_eq!(summary.columns, 2);
            }
            other => panic!("expected table, got {other:?}"),
        }
        assert_eq!(table.context.get("h2"), Some("Cronograma"));
    }

    #[test]
    fn iframe_src_is_resolved() {
        let html = r#"<html><body><article>
            <p>Assista abaixo.</p>
            <iframe src="/embed/video"></iframe>
            <iframe></iframe>
        </article></body></html>"#;
        let page = extractor().extract(html, &url("https://example.gov.br/pagina/video"));

        assert_eq!(page.blocks.len(), 2);
        assert_eq!(page.blocks[1].kind, BlockKind::Iframe);
        assert_eq!(page.blocks[1].content, "https://example.gov.br/embed/video");
        assert_eq!(page.blocks[1].confidence, Confidence::Medium);
    }

    #[test]
    fn callouts_open_persistent_pseudo_context() {
        let html = r#"<html><body><article>
            <p class="callout">Atenção</p>
            <p>Prazo encerrado.</p>
            <p>Consulte o edital.</p>
        </article></body></html>"#;
        // News pages keep callouts; the default layout strips them.
        let page = extractor().extract(html, &url("https://example.gov.br/noticias/aviso"));

        assert_eq!(page.blocks.len(), 1);
        assert_eq!(page.blocks[0].content, "Prazo encerrado.\nConsulte o edital.");
        assert_eq!(page.blocks[0].context.get("pseudo"), Some("Atenção"));
    }

    #[test]
    fn cleanup_removes_boilerplate() {
        let html = r#"<html><body>
            <div id="portal-header"><p>Menu</p></div>
            <div id="content">
              <div id="viewlet-below-content-title">Compartilhe</div>
              <script>var x = 1;</script>
              <p>Conteúdo real.</p>
            </div>
        </body></html>"#;
        let page = extractor().extract(html, &url("https://example.gov.br/y"));
        assert_eq!(texts(&page), vec!["Conteúdo real."]);
    }

    #[test]
    fn skip_layout_returns_links_only() {
        let html = r##"<html><head><title>IFPI</title></head><body>
            <p>Portal</p>
            <a href="/noticias">Notícias</a>
            <a href="https://ifpi.edu.br/noticias">Notícias de novo</a>
            <a href="#topo">Topo</a>
            <a href="mailto:contato@ifpi.edu.br">Contato</a>
            <a href="javascript:void(0)">Abrir</a>
        </body></html>"##;
        let page = extractor().extract(html, &url("https://ifpi.edu.br/"));

        assert_eq!(page.layout, "skip");
        assert!(page.blocks.is_empty());
        assert_eq!(page.links, vec!["https://ifpi.edu.br/noticias"]);
    }

    #[test]
    fn campus_seed_prefixes_context() {
        let html = r#"<html><head><title>Cursos</title></head><body><article>
            <h2>Técnicos</h2><p>Informática.</p>
        </article></body></html>"#;
        let page = extractor().extract(html, &url("https://ifpi.edu.br/picos/cursos-tecnicos"));

        assert_eq!(page.blocks.len(), 1);
        assert_eq!(
            page.blocks[0].context.joined(" > "),
            "Conteúdo sobre o campus Picos > Técnicos"
        );
    }

    #[test]
    fn missing_title_falls_back() {
        let page = extractor().extract("<p>Oi</p>", &url("https://example.gov.br/z"));
        assert_eq!(page.title, "Untitled");
        assert_eq!(page.blocks[0].context.get("title"), Some("Untitled"));
    }

    #[test]
    fn enumeration_detection() {
        assert!(is_enumeration("I - RG"));
        assert!(is_enumeration("  xiv – documento"));
        assert!(!is_enumeration("Inscrição - prazo"));
        assert!(is_pseudo_header("Documentos necessários para inscrição:"));
        assert!(!is_pseudo_header("Curto:"));
        assert!(!is_pseudo_header("Envie seus documentos para o email abaixo:"));
    }
}
