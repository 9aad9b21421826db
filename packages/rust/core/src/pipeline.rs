//! Crawl orchestration: frontier → fetch → extract → chunk → sink.
//!
//! A run pops URLs until `max_pages` pages were indexed, the frontier drains, or
//! the cancellation token fires. Up to `concurrency` workers share one frontier;
//! each waits the politeness delay after every successful page.

use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::future::join_all;
use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use harvester_chunker::SemanticChunker;
use harvester_crawler::{Admission, FetchPolicy, Fetcher, Frontier, FrontierStats, UrlPolicy};
use harvester_extract::{BlockExtractor, ExtractedPage, LayoutTable};
use harvester_shared::{BlockKind, CrawlConfig, FetchResult, HarvestError, Result, SourceDocument};

use crate::sink::{InsertReport, PageSink};

/// Links to downloadable documents mentioned in page text.
static DOCUMENT_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)https?://[^\s"'<>]+\.(?:pdf|docx?|zip)\b"#)
        .expect("valid document link regex")
});

/// Idle wait while other workers may still enqueue links.
const IDLE_POLL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for reporting crawl status.
pub trait ProgressReporter: Send + Sync {
    /// Called before a URL is fetched.
    fn page_started(&self, url: &str, indexed: usize, budget: usize);
    /// Called once a URL has been handled, successfully or not.
    fn page_finished(&self, url: &str, outcome: &PageOutcome);
    /// Called for each document link found in page text.
    fn document_found(&self, url: &str);
    /// Called when the run completes.
    fn done(&self, stats: &CrawlStats);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn page_started(&self, _url: &str, _indexed: usize, _budget: usize) {}
    fn page_finished(&self, _url: &str, _outcome: &PageOutcome) {}
    fn document_found(&self, _url: &str) {}
    fn done(&self, _stats: &CrawlStats) {}
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Why a run ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    BudgetReached,
    FrontierExhausted,
    Cancelled,
}

/// What happened to one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    Indexed {
        title: String,
        layout: String,
        blocks: usize,
        report: InsertReport,
        links_queued: usize,
    },
    RobotsBlocked,
    Failed {
        status: u16,
        error: String,
    },
}

/// Totals for one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlStats {
    pub pages_indexed: usize,
    pub pages_failed: usize,
    pub robots_blocked: usize,
    pub links_queued: usize,
    pub chunks: InsertReport,
    /// Distinct document links seen in page text, in discovery order.
    pub document_links: Vec<String>,
    pub frontier: Option<FrontierStats>,
    pub elapsed: Duration,
    pub stop_reason: StopReason,
}

#[derive(Default)]
struct RunState {
    stats: CrawlStats,
    in_flight: usize,
}

enum Slot {
    Take(String),
    Wait,
    Stop,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The crawl-and-extract pipeline over one frontier and one sink.
pub struct Pipeline<S> {
    config: CrawlConfig,
    frontier: Frontier,
    fetcher: Fetcher,
    extractor: BlockExtractor,
    chunker: SemanticChunker,
    sink: S,
}

impl<S: PageSink> Pipeline<S> {
    /// Build every stage from `config` and queue its seeds.
    pub fn new(config: CrawlConfig, sink: S) -> Result<Self> {
        let extractor = match &config.layout_rules {
            Some(path) => BlockExtractor::new(LayoutTable::load(path)?),
            None => BlockExtractor::builtin()?,
        };
        let fetcher = Fetcher::new(FetchPolicy::from(&config))?;
        Self::with_parts(config, fetcher, extractor, sink)
    }

    /// Assemble from prebuilt fetch and extraction stages.
    pub fn with_parts(
        config: CrawlConfig,
        fetcher: Fetcher,
        extractor: BlockExtractor,
        sink: S,
    ) -> Result<Self> {
        let policy = UrlPolicy::from(&config);
        let frontier = match &config.checkpoint_path {
            Some(path) => Frontier::open(path, policy),
            None => Frontier::in_memory(policy),
        };

        let queued = frontier.add_seeds(&config.seeds);
        let stats = frontier.stats();
        if stats.pending == 0 {
            return Err(HarvestError::config(
                "no crawlable seed: every seed was rejected or already visited",
            ));
        }
        info!(queued, pending = stats.pending, visited = stats.visited, "frontier ready");

        Ok(Self {
            chunker: SemanticChunker::from(&config),
            config,
            frontier,
            fetcher,
            extractor,
            sink,
        })
    }

    pub fn frontier(&self) -> &Frontier {
        &self.frontier
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Crawl until the page budget is met, the frontier drains, or `cancel` fires.
    #[instrument(skip_all, fields(max_pages = self.config.max_pages, workers = self.config.concurrency))]
    pub async fn run(&self, progress: &dyn ProgressReporter, cancel: &CancellationToken) -> CrawlStats {
        let start = Instant::now();
        let state = Mutex::new(RunState::default());
        let workers = self.config.concurrency.max(1);

        join_all((0..workers).map(|id| self.worker(id, &state, progress, cancel))).await;

        let mut stats = state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .stats;
        stats.stop_reason = if cancel.is_cancelled() {
            StopReason::Cancelled
        } else if stats.pages_indexed >= self.config.max_pages {
            StopReason::BudgetReached
        } else {
            StopReason::FrontierExhausted
        };
        stats.frontier = Some(self.frontier.stats());
        stats.elapsed = start.elapsed();

        info!(
            indexed = stats.pages_indexed,
            failed = stats.pages_failed,
            robots_blocked = stats.robots_blocked,
            chunks_inserted = stats.chunks.inserted,
            chunks_skipped = stats.chunks.skipped,
            documents = stats.document_links.len(),
            reason = ?stats.stop_reason,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "crawl finished"
        );
        progress.done(&stats);
        stats
    }

    async fn worker(
        &self,
        id: usize,
        state: &Mutex<RunState>,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let url = match self.claim(state) {
                Slot::Take(url) => url,
                Slot::Stop => return,
                Slot::Wait => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                    continue;
                }
            };

            let indexed = lock(state).stats.pages_indexed;
            progress.page_started(&url, indexed, self.config.max_pages);
            debug!(worker = id, %url, "processing");

            let (outcome, documents) = self.process_page(&url).await;

            let indexed = {
                let mut guard = lock(state);
                guard.in_flight -= 1;
                let stats = &mut guard.stats;
                match &outcome {
                    PageOutcome::Indexed { report, links_queued, .. } => {
                        stats.pages_indexed += 1;
                        stats.links_queued += links_queued;
                        stats.chunks.absorb(*report);
                    }
                    PageOutcome::RobotsBlocked => stats.robots_blocked += 1,
                    PageOutcome::Failed { .. } => stats.pages_failed += 1,
                }
                for doc in documents {
                    if !stats.document_links.contains(&doc) {
                        progress.document_found(&doc);
                        stats.document_links.push(doc);
                    }
                }
                matches!(outcome, PageOutcome::Indexed { .. }).then_some(stats.pages_indexed)
            };
            progress.page_finished(&url, &outcome);

            if let Some(indexed) = indexed {
                if indexed >= self.config.max_pages {
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.config.delay) => {}
                }
            }
        }
    }

    /// Reserve a budget slot and pop a URL for it.
    fn claim(&self, state: &Mutex<RunState>) -> Slot {
        let mut guard = lock(state);
        let budget = self.config.max_pages;
        if guard.stats.pages_indexed >= budget {
            return Slot::Stop;
        }
        if guard.stats.pages_indexed + guard.in_flight >= budget {
            return Slot::Wait;
        }
        match self.frontier.pop_next() {
            Some(url) => {
                guard.in_flight += 1;
                Slot::Take(url)
            }
            None if guard.in_flight == 0 => Slot::Stop,
            None => Slot::Wait,
        }
    }

    /// Fetch, extract, chunk and persist one URL. Also returns document links found.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn process_page(&self, url: &str) -> (PageOutcome, Vec<String>) {
        let fetched = self.fetcher.fetch(url).await;
        if is_robots_block(&fetched) {
            debug!("skipped by robots.txt");
            return (PageOutcome::RobotsBlocked, Vec::new());
        }
        if !fetched.is_success() {
            warn!(status = fetched.status, error = ?fetched.error, "fetch failed");
            return (failed(fetched.status, fetched.error.unwrap_or_default()), Vec::new());
        }

        let page_url = match Url::parse(url) {
            Ok(u) => u,
            Err(e) => return (failed(0, format!("invalid URL: {e}")), Vec::new()),
        };
        let page = self.extractor.extract(&fetched.body, &page_url);

        let links_queued = page
            .links
            .iter()
            .filter(|link| self.frontier.add_pending(link) == Admission::Queued)
            .count();
        let documents = document_links(&page);

        match self.persist(url, &page).await {
            Ok(report) => {
                self.frontier.mark_visited(url);
                info!(
                    layout = %page.layout,
                    blocks = page.blocks.len(),
                    inserted = report.inserted,
                    skipped = report.skipped,
                    links_queued,
                    "page indexed"
                );
                let outcome = PageOutcome::Indexed {
                    title: page.title,
                    layout: page.layout,
                    blocks: page.blocks.len(),
                    report,
                    links_queued,
                };
                (outcome, documents)
            }
            Err(e) => {
                warn!(error = %e, "persisting page failed");
                (failed(fetched.status, e.to_string()), documents)
            }
        }
    }

    async fn persist(&self, url: &str, page: &ExtractedPage) -> Result<InsertReport> {
        let chunks = self.chunker.chunk_blocks(&page.blocks);
        let doc = SourceDocument {
            url: url.to_string(),
            normalized_url: self.frontier.policy().normalize(url),
            title: page.title.clone(),
            source_type: self.config.source_type.clone(),
        };
        let document_id = self.sink.insert_document(&doc).await?;
        if chunks.is_empty() {
            return Ok(InsertReport::default());
        }
        self.sink.insert_chunks(&document_id, &chunks).await
    }
}

fn lock(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn failed(status: u16, error: String) -> PageOutcome {
    PageOutcome::Failed { status, error }
}

fn is_robots_block(result: &FetchResult) -> bool {
    result.status == FetchResult::ROBOTS_BLOCKED && result.attempts == 0
}

/// Distinct document URLs mentioned in the text blocks of `page`.
pub fn document_links(page: &ExtractedPage) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for block in &page.blocks {
        if !matches!(block.kind, BlockKind::Text { .. } | BlockKind::List { .. }) {
            continue;
        }
        for m in DOCUMENT_LINK_RE.find_iter(&block.content) {
            let link = m.as_str().to_string();
            if !found.contains(&link) {
                found.push(link);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use harvester_shared::{ChunkType, SemanticChunk};
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingSink {
        documents: RefCell<Vec<SourceDocument>>,
        chunks: RefCell<Vec<SemanticChunk>>,
    }

    impl PageSink for RecordingSink {
        async fn insert_document(&self, doc: &SourceDocument) -> Result<String> {
            self.documents.borrow_mut().push(doc.clone());
            Ok(format!("doc-{}", self.documents.borrow().len()))
        }

        async fn insert_chunks(
            &self,
            _document_id: &str,
            chunks: &[SemanticChunk],
        ) -> Result<InsertReport> {
            self.chunks.borrow_mut().extend_from_slice(chunks);
            Ok(InsertReport {
                inserted: chunks.len(),
                ..InsertReport::default()
            })
        }
    }

    #[derive(Default)]
    struct CountingProgress {
        started: AtomicUsize,
        documents: AtomicUsize,
        done: AtomicUsize,
    }

    impl ProgressReporter for CountingProgress {
        fn page_started(&self, _url: &str, _indexed: usize, _budget: usize) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn page_finished(&self, _url: &str, _outcome: &PageOutcome) {}
        fn document_found(&self, _url: &str) {
            self.documents.fetch_add(1, Ordering::SeqCst);
        }
        fn done(&self, _stats: &CrawlStats) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_config(server: &MockServer) -> CrawlConfig {
        CrawlConfig {
            seeds: vec![format!("{}/enem", server.uri())],
            domain_filter: Some("127.0.0.1".into()),
            max_pages: 10,
            delay: Duration::from_millis(1),
            max_retries: 0,
            backoff_unit: Duration::from_millis(1),
            respect_robots_txt: false,
            checkpoint_path: None,
            concurrency: 1,
            upgrade_to_https: false,
            ..CrawlConfig::default()
        }
    }

    async fn mount_page(server: &MockServer, route: &str, html: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(html)
                    .insert_header("content-type", "text/html; charset=utf-8"),
            )
            .mount(server)
            .await;
    }

    const HOME: &str = r#"<html><head><title>Enem</title></head><body><div id="content">
        <h2>Inscrição</h2>
        <p>As inscrições ficam abertas de 27 de maio a 7 de junho.</p>
        <p>Consulte o edital em https://download.inep.gov.br/edital_enem.pdf para detalhes.</p>
        <a href="/enem/cronograma">Cronograma</a>
        <a href="/enem/quebrado">Quebrado</a>
        <a href="https://outro.gov.br/x">Externo</a>
        </div></body></html>"#;

    const SCHEDULE: &str = r#"<html><head><title>Cronograma</title></head><body><div id="content">
        <h2>Datas</h2>
        <table>
          <tr><th>Evento</th><th>Data</th></tr>
          <tr><td>Inscrições</td><td>27/05 a 07/06</td></tr>
          <tr><td>Aplicação</td><td>03/11 e 10/11</td></tr>
        </table>
        </div></body></html>"#;

    #[tokio::test]
    async fn crawl_indexes_reachable_pages() {
        let server = MockServer::start().await;
        mount_page(&server, "/enem", HOME).await;
        mount_page(&server, "/enem/cronograma", SCHEDULE).await;
        Mock::given(method("GET"))
            .and(path("/enem/quebrado"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let pipeline = Pipeline::new(test_config(&server), RecordingSink::default()).unwrap();
        let progress = CountingProgress::default();
        let stats = pipeline.run(&progress, &CancellationToken::new()).await;

        assert_eq!(stats.pages_indexed, 2);
        assert_eq!(stats.pages_failed, 1);
        assert_eq!(stats.stop_reason, StopReason::FrontierExhausted);
        assert_eq!(stats.links_queued, 2);
        assert_eq!(
            stats.document_links,
            vec!["https://download.inep.gov.br/edital_enem.pdf".to_string()]
        );
        assert_eq!(progress.started.load(Ordering::SeqCst), 3);
        assert_eq!(progress.documents.load(Ordering::SeqCst), 1);
        assert_eq!(progress.done.load(Ordering::SeqCst), 1);

        let sink = pipeline.sink();
        let titles: Vec<String> = sink.documents.borrow().iter().map(|d| d.title.clone()).collect();
        assert!(titles.contains(&"Enem".to_string()));
        assert!(titles.contains(&"Cronograma".to_string()));

        let chunks = sink.chunks.borrow();
        assert!(chunks.iter().any(|c| c.text.starts_with("Inscrição\n")));
        let entities = chunks
            .iter()
            .filter(|c| c.metadata.chunk_type == ChunkType::TableEntity)
            .count();
        assert_eq!(entities, 2);

        let frontier = stats.frontier.unwrap();
        assert_eq!(frontier.visited, 2);
        assert_eq!(frontier.pending, 0);
        assert!(!pipeline.frontier().is_visited(&format!("{}/enem/quebrado", server.uri())));
    }

    #[tokio::test]
    async fn page_budget_stops_the_run() {
        let server = MockServer::start().await;
        mount_page(&server, "/enem", HOME).await;
        mount_page(&server, "/enem/cronograma", SCHEDULE).await;

        let config = CrawlConfig {
            max_pages: 1,
            ..test_config(&server)
        };
        let pipeline = Pipeline::new(config, RecordingSink::default()).unwrap();
        let stats = pipeline.run(&SilentProgress, &CancellationToken::new()).await;

        assert_eq!(stats.pages_indexed, 1);
        assert_eq!(stats.stop_reason, StopReason::BudgetReached);
        assert_eq!(stats.frontier.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn cancelled_run_fetches_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(HOME))
            .expect(0)
            .mount(&server)
            .await;

        let pipeline = Pipeline::new(test_config(&server), RecordingSink::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = pipeline.run(&SilentProgress, &cancel).await;

        assert_eq!(stats.pages_indexed, 0);
        assert_eq!(stats.stop_reason, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn concurrent_workers_respect_the_budget() {
        let server = MockServer::start().await;
        let links: String = (0..8)
            .map(|i| format!(r#"<a href="/p{i}">p{i}</a>"#))
            .collect();
        let page = format!(
            r#"<html><head><title>Lista</title></head><body><div id="content"><p>Texto da página de teste.</p>{links}</div></body></html>"#
        );
        mount_page(&server, "/enem", &page).await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(&page))
            .mount(&server)
            .await;

        let config = CrawlConfig {
            max_pages: 4,
            concurrency: 3,
            ..test_config(&server)
        };
        let pipeline = Pipeline::new(config, RecordingSink::default()).unwrap();
        let stats = pipeline.run(&SilentProgress, &CancellationToken::new()).await;

        assert_eq!(stats.pages_indexed, 4);
        assert_eq!(stats.stop_reason, StopReason::BudgetReached);
        assert_eq!(pipeline.sink().documents.borrow().len(), 4);
    }

    #[tokio::test]
    async fn robots_blocked_pages_are_counted_separately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /\n"))
            .mount(&server)
            .await;

        let config = CrawlConfig {
            respect_robots_txt: true,
            ..test_config(&server)
        };
        let pipeline = Pipeline::new(config, RecordingSink::default()).unwrap();
        let stats = pipeline.run(&SilentProgress, &CancellationToken::new()).await;

        assert_eq!(stats.robots_blocked, 1);
        assert_eq!(stats.pages_indexed, 0);
        assert_eq!(stats.stop_reason, StopReason::FrontierExhausted);
    }

    #[tokio::test]
    async fn checkpoint_resumes_where_the_last_run_stopped() {
        let server = MockServer::start().await;
        mount_page(&server, "/enem", HOME).await;
        mount_page(&server, "/enem/cronograma", SCHEDULE).await;
        let checkpoint =
            std::env::temp_dir().join(format!("harvester_checkpoint_{}.json", Uuid::now_v7()));

        let config = CrawlConfig {
            max_pages: 1,
            checkpoint_path: Some(checkpoint.clone()),
            ..test_config(&server)
        };
        let first = Pipeline::new(config.clone(), RecordingSink::default()).unwrap();
        first.run(&SilentProgress, &CancellationToken::new()).await;

        let second = Pipeline::new(config, RecordingSink::default()).unwrap();
        assert!(second.frontier().is_visited(&format!("{}/enem", server.uri())));
        second.run(&SilentProgress, &CancellationToken::new()).await;

        let titles: Vec<String> = second
            .sink()
            .documents
            .borrow()
            .iter()
            .map(|d| d.title.clone())
            .collect();
        assert!(!titles.contains(&"Enem".to_string()));
        let _ = std::fs::remove_file(checkpoint);
    }

    #[test]
    fn rejected_seeds_fail_construction() {
        let config = CrawlConfig {
            seeds: vec!["https://outro.gov.br/".into()],
            domain_filter: Some("www.gov.br".into()),
            checkpoint_path: None,
            ..CrawlConfig::default()
        };
        let err = Pipeline::new(config, RecordingSink::default()).err().unwrap();
        assert!(matches!(err, HarvestError::Config { .. }));
    }

    #[test]
    fn document_links_are_found_in_text() {
        let extractor = BlockExtractor::builtin().unwrap();
        let url = Url::parse("https://www.gov.br/inep/enem").unwrap();
        let page = extractor.extract(
            r#"<html><body><div id="content">
               <p>Baixe https://a.gov.br/edital.PDF e https://a.gov.br/anexo.docx hoje.</p>
               <p>Repetido: https://a.gov.br/edital.PDF</p>
               <p>Página https://a.gov.br/pagina.html</p>
               </div></body></html>"#,
            &url,
        );
        assert_eq!(
            document_links(&page),
            vec![
                "https://a.gov.br/edital.PDF".to_string(),
                "https://a.gov.br/anexo.docx".to_string()
            ]
        );
    }
}
