//! Harvest orchestration.
//!
//! ```text
//! Discover ──urls──> Download ──pages──> Parse ──records──> Persist
//!  (source)          (transform,          (transform,        (sink,
//!                     cooperative)         isolated)          1 worker)
//! ```
//!
//! [`Harvester::run`] starts all four stages, then polls the store's accepted
//! count. Once it reaches the target the stop flag is raised, Discover exits
//! after its current batch, and the rest of the pipeline winds down through
//! the liveness counters as each stage drains its input.

use crate::config::HarvestConfig;
use crate::engine::{
    Backoff, BoundedChannel, BoxError, DeadLetter, DeadLetterRecord, ErrorPolicy, ExecutionMode,
    Liveness, LogAndDrop, Produced, Stage, StageError, StageOptions, StageStats, StopFlag,
};
use crate::models::{Page, ParsedArticle};
use crate::outputs::storage::RecordStore;
use crate::scrapers::medium::ArticleParser;
use crate::scrapers::{Discovery, Fetch};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Summary of one harvest run, written to `harvest.json`.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub search_term: String,
    pub requested: usize,
    pub accepted: usize,
    /// Parsed records dropped because their status was not `Ok`.
    pub rejected: usize,
    pub stages: Vec<StageStats>,
    /// Items whose transformation failed or panicked, when dead letters are on.
    pub dead_letters: Vec<DeadLetterRecord>,
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

fn serialize_secs<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}

#[derive(Debug, Clone)]
pub struct HarvestOptions {
    pub search_term: String,
    /// Accepted records after which discovery is stopped.
    pub target: usize,
    pub days_per_batch: usize,
    pub download_workers: usize,
    pub parse_workers: usize,
    pub queue_capacity: usize,
    pub queue_timeout: Duration,
    pub poll_interval: Duration,
    pub source_error_backoff: Duration,
    /// Failed items kept for the report; 0 only logs them.
    pub dead_letter_capacity: usize,
}

impl From<&HarvestConfig> for HarvestOptions {
    fn from(config: &HarvestConfig) -> Self {
        Self {
            search_term: config.search_term.clone(),
            target: config.num_articles,
            days_per_batch: config.days_per_batch,
            download_workers: config.download_workers,
            parse_workers: config.parse_workers,
            queue_capacity: config.queue_capacity,
            queue_timeout: config.queue_timeout(),
            poll_interval: config.poll_interval(),
            source_error_backoff: config.source_error_backoff(),
            dead_letter_capacity: config.dead_letter_capacity,
        }
    }
}

/// Live-worker counters of the four stages, in pipeline order.
#[derive(Debug, Clone, Default)]
struct PipelineLiveness {
    discover: Liveness,
    download: Liveness,
    parse: Liveness,
    persist: Liveness,
}

impl PipelineLiveness {
    fn total(&self) -> usize {
        [&self.discover, &self.download, &self.parse, &self.persist]
            .iter()
            .map(|l| l.read())
            .sum()
    }
}

pub struct Harvester<D, F, S> {
    options: HarvestOptions,
    discovery: Arc<D>,
    fetcher: Arc<F>,
    parser: ArticleParser,
    store: Arc<S>,
    stop: StopFlag,
    liveness: PipelineLiveness,
}

impl<D, F, S> Harvester<D, F, S>
where
    D: Discovery,
    F: Fetch,
    S: RecordStore,
{
    pub fn new(
        options: HarvestOptions,
        discovery: Arc<D>,
        fetcher: Arc<F>,
        parser: ArticleParser,
        store: Arc<S>,
    ) -> Self {
        Self {
            options,
            discovery,
            fetcher,
            parser,
            store,
            stop: StopFlag::new(),
            liveness: PipelineLiveness::default(),
        }
    }

    /// Share a stop flag with the caller, e.g. to stop on Ctrl-C.
    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    /// Workers still running across all stages. Zero once `run` returns.
    pub fn live_workers(&self) -> usize {
        self.liveness.total()
    }

    fn stage_options(
        &self,
        name: &str,
        workers: usize,
        liveness: &Liveness,
        policy: &Arc<dyn ErrorPolicy>,
    ) -> StageOptions {
        StageOptions::new(name, workers)
            .queue_timeout(self.options.queue_timeout)
            .policy(Arc::clone(policy))
            .liveness(liveness.clone())
    }

    fn channel<T: Send + 'static>(&self) -> BoundedChannel<T> {
        BoundedChannel::new(self.options.queue_capacity)
            .with_retry_interval(self.options.queue_timeout)
    }

    fn discover_stage(
        &self,
        urls: &BoundedChannel<String>,
        policy: &Arc<dyn ErrorPolicy>,
    ) -> Stage {
        let discovery = Arc::clone(&self.discovery);
        let days = self.options.days_per_batch;
        Stage::source(
            self.stage_options("Discover", 1, &self.liveness.discover, policy)
                .error_backoff(Backoff::new(self.options.source_error_backoff)),
            move || {
                let discovery = Arc::clone(&discovery);
                async move {
                    let found = discovery.next_batches(days).await;
                    Ok::<_, BoxError>(Produced::many(found).finished(discovery.is_exhausted()))
                }
            },
            urls.clone(),
            self.stop.clone(),
        )
    }

    fn download_stage(
        &self,
        urls: &BoundedChannel<String>,
        pages: &BoundedChannel<Page>,
        policy: &Arc<dyn ErrorPolicy>,
    ) -> Stage {
        let fetcher = Arc::clone(&self.fetcher);
        let workers = self.options.download_workers;
        Stage::transform(
            self.stage_options("Download", workers, &self.liveness.download, policy),
            move |url: String| {
                let fetcher = Arc::clone(&fetcher);
                async move { Ok::<_, BoxError>(fetcher.fetch(&url).await) }
            },
            urls.clone(),
            pages.clone(),
            self.liveness.discover.clone(),
        )
    }

    fn parse_stage(
        &self,
        pages: &BoundedChannel<Page>,
        records: &BoundedChannel<ParsedArticle>,
        policy: &Arc<dyn ErrorPolicy>,
    ) -> Stage {
        let parser = self.parser;
        let workers = self.options.parse_workers;
        Stage::transform(
            self.stage_options("Parse", workers, &self.liveness.parse, policy)
                .mode(ExecutionMode::Isolated),
            move |page: Page| async move { Ok::<_, BoxError>(parser.parse(page)) },
            pages.clone(),
            records.clone(),
            self.liveness.download.clone(),
        )
    }

    fn persist_stage(
        &self,
        records: &BoundedChannel<ParsedArticle>,
        rejected: &Arc<AtomicUsize>,
        policy: &Arc<dyn ErrorPolicy>,
    ) -> Stage {
        let store = Arc::clone(&self.store);
        let rejected = Arc::clone(rejected);
        Stage::sink(
            self.stage_options("Persist", 1, &self.liveness.persist, policy),
            move |record: ParsedArticle| {
                let store = Arc::clone(&store);
                let rejected = Arc::clone(&rejected);
                async move {
                    match record.article {
                        Some(article) if record.status.is_ok() => store.add(article).await,
                        _ => {
                            rejected.fetch_add(1, Ordering::Relaxed);
                            debug!(
                                url = %record.url,
                                status = %record.status,
                                "Dropping rejected record"
                            );
                            Ok(())
                        }
                    }
                }
            },
            records.clone(),
            self.liveness.parse.clone(),
        )
    }

    /// Run the pipeline to completion.
    ///
    /// Returns once every stage has joined, either because discovery ran
    /// out of URLs or because the target was reached and discovery stopped.
    ///
    /// # Returns
    ///
    /// A [`HarvestReport`] with per-stage counters, or the first
    /// [`StageError`] from starting or joining a stage. When a stage fails to
    /// start, discovery is stopped and the stages already running are joined
    /// before the error is returned.
    #[instrument(
        level = "info",
        skip(self),
        fields(search_term = %self.options.search_term, target = self.options.target)
    )]
    pub async fn run(&self) -> Result<HarvestReport, StageError> {
        let start = Instant::now();
        let urls = self.channel::<String>();
        let pages = self.channel::<Page>();
        let records = self.channel::<ParsedArticle>();
        let rejected = Arc::new(AtomicUsize::new(0));

        let dead_letters = (self.options.dead_letter_capacity > 0)
            .then(|| BoundedChannel::<DeadLetterRecord>::new(self.options.dead_letter_capacity));
        let policy: Arc<dyn ErrorPolicy> = match &dead_letters {
            Some(channel) => Arc::new(DeadLetter::new(channel.clone())),
            None => Arc::new(LogAndDrop),
        };

        let mut stages = [
            self.discover_stage(&urls, &policy),
            self.download_stage(&urls, &pages, &policy),
            self.parse_stage(&pages, &records, &policy),
            self.persist_stage(&records, &rejected, &policy),
        ];
        self.start_all(&mut stages).await?;

        self.supervise().await;

        let mut first_failure = None;
        for stage in &mut stages {
            if let Err(e) = stage.join().await {
                warn!(stage = stage.name(), error = %e, "Stage join failed");
                first_failure.get_or_insert(e);
            }
        }
        debug!(live_workers = self.live_workers(), "All stages joined");

        let leftovers = [
            ("urls", urls.drain().await.len()),
            ("pages", pages.drain().await.len()),
            ("records", records.drain().await.len()),
        ];
        for (channel, count) in leftovers {
            if count > 0 {
                warn!(channel, count, "Items left in channel after shutdown");
            }
        }

        if let Some(e) = first_failure {
            return Err(e);
        }

        let report = HarvestReport {
            search_term: self.options.search_term.clone(),
            requested: self.options.target,
            accepted: self.store.accepted_count(),
            rejected: rejected.load(Ordering::Relaxed),
            stages: stages.iter().map(Stage::stats).collect(),
            dead_letters: match &dead_letters {
                Some(channel) => channel.drain().await,
                None => Vec::new(),
            },
            elapsed: start.elapsed(),
        };
        info!(
            accepted = report.accepted,
            rejected = report.rejected,
            elapsed = ?report.elapsed,
            "Harvest finished"
        );
        Ok(report)
    }

    /// Start every stage in pipeline order.
    ///
    /// If one fails, nothing is left running: discovery is stopped, stages
    /// that never started release their liveness, and started ones are
    /// joined.
    async fn start_all(&self, stages: &mut [Stage]) -> Result<(), StageError> {
        let Some(failure) = stages.iter_mut().find_map(|stage| stage.start().err()) else {
            return Ok(());
        };
        error!(error = %failure, "Failed to start pipeline; shutting down");
        self.stop.stop();
        for stage in stages.iter_mut() {
            stage.abandon();
            if let Err(e) = stage.join().await {
                warn!(stage = stage.name(), error = %e, "Stage join failed during shutdown");
            }
        }
        Err(failure)
    }

    /// Poll the accepted count until the target is hit or parsing is done.
    async fn supervise(&self) {
        while !self.liveness.parse.is_zero() {
            let accepted = self.store.accepted_count();
            if accepted >= self.options.target {
                if self.stop.stop() {
                    let target = self.options.target;
                    info!(accepted, target, "Target reached; stopping discovery");
                }
                return;
            }
            if self.stop.is_stopped() {
                info!(accepted, "Stop requested; waiting for pipeline to drain");
                return;
            }
            info!(accepted, target = self.options.target, "Harvest progress");
            tokio::time::sleep(self.options.poll_interval).await;
        }
        debug!("Parse stage finished before target was reached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Article, PageStatus};
    use crate::scrapers::medium::fixtures::article_html;
    use std::sync::Mutex;

    const FAST: Duration = Duration::from_millis(20);

    fn options(target: usize) -> HarvestOptions {
        HarvestOptions {
            search_term: "rust".to_string(),
            target,
            days_per_batch: 3,
            download_workers: 4,
            parse_workers: 2,
            queue_capacity: 10,
            queue_timeout: FAST,
            poll_interval: FAST,
            source_error_backoff: Duration::ZERO,
            dead_letter_capacity: 10,
        }
    }

    /// Hands out `n` fresh URLs per call, optionally running dry.
    #[derive(Debug)]
    struct FakeDiscovery {
        next_id: AtomicUsize,
        calls: AtomicUsize,
        calls_after_stop: AtomicUsize,
        max_calls: Option<usize>,
        stop: StopFlag,
    }

    impl FakeDiscovery {
        fn new(stop: StopFlag, max_calls: Option<usize>) -> Self {
            Self {
                next_id: AtomicUsize::new(1),
                calls: AtomicUsize::new(0),
                calls_after_stop: AtomicUsize::new(0),
                max_calls,
                stop,
            }
        }
    }

    impl Discovery for FakeDiscovery {
        async fn next_batches(&self, num_batches: usize) -> Vec<String> {
            if self.stop.is_stopped() {
                self.calls_after_stop.fetch_add(1, Ordering::SeqCst);
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            (0..num_batches)
                .map(|_| {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    format!("https://example.test/p/{id}")
                })
                .collect()
        }

        fn is_exhausted(&self) -> bool {
            self.max_calls
                .is_some_and(|max| self.calls.load(Ordering::SeqCst) >= max)
        }
    }

    /// Every third article is too short; id 404 does not exist.
    #[derive(Debug, Default)]
    struct FakeFetch {
        panic_on: Option<usize>,
    }

    impl Fetch for FakeFetch {
        async fn fetch(&self, url: &str) -> Page {
            let id: usize = url.rsplit('/').next().and_then(|s| s.parse().ok()).unwrap_or(0);
            if self.panic_on == Some(id) {
                panic!("fetcher crashed on {url}");
            }
            if id == 404 {
                return Page::failed(url, PageStatus::NotFound);
            }
            let minutes = if id % 3 == 0 { 2 } else { 7 };
            Page {
                url: url.to_string(),
                body: Some(article_html(&id.to_string(), minutes)),
                status: PageStatus::Ok,
            }
        }
    }

    #[derive(Debug, Default)]
    struct MemoryStore {
        articles: Mutex<Vec<Article>>,
        accepted: AtomicUsize,
    }

    impl RecordStore for MemoryStore {
        fn accepted_count(&self) -> usize {
            self.accepted.load(Ordering::SeqCst)
        }

        async fn add(&self, article: Article) -> Result<(), BoxError> {
            self.articles.lock().unwrap().push(article);
            self.accepted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn harvester(
        target: usize,
        discovery: Arc<FakeDiscovery>,
        store: Arc<MemoryStore>,
        stop: StopFlag,
    ) -> Harvester<FakeDiscovery, FakeFetch, MemoryStore> {
        harvester_with_fetch(target, discovery, FakeFetch::default(), store, stop)
    }

    fn harvester_with_fetch(
        target: usize,
        discovery: Arc<FakeDiscovery>,
        fetch: FakeFetch,
        store: Arc<MemoryStore>,
        stop: StopFlag,
    ) -> Harvester<FakeDiscovery, FakeFetch, MemoryStore> {
        Harvester::new(
            options(target),
            discovery,
            Arc::new(fetch),
            ArticleParser::new(5, false),
            store,
        )
        .with_stop_flag(stop)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stops_discovery_once_target_is_reached() {
        let stop = StopFlag::new();
        let discovery = Arc::new(FakeDiscovery::new(stop.clone(), None));
        let store = Arc::new(MemoryStore::default());
        let harvester = harvester(10, Arc::clone(&discovery), Arc::clone(&store), stop.clone());

        let report = harvester.run().await.unwrap();

        assert!(stop.is_stopped());
        assert!(report.accepted >= 10);
        assert_eq!(report.accepted, store.articles.lock().unwrap().len());
        // A call already in flight when the flag flips may observe it; no
        // call starts after that.
        assert!(discovery.calls_after_stop.load(Ordering::SeqCst) <= 1);
        assert_eq!(harvester.live_workers(), 0);

        let names: Vec<&str> = report.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Discover", "Download", "Parse", "Persist"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_finishes_when_discovery_is_exhausted() {
        let stop = StopFlag::new();
        let discovery = Arc::new(FakeDiscovery::new(stop.clone(), Some(2)));
        let store = Arc::new(MemoryStore::default());
        let harvester = harvester(100, Arc::clone(&discovery), Arc::clone(&store), stop.clone());

        let report = harvester.run().await.unwrap();

        // Two calls of three URLs: ids 1..=6, of which 3 and 6 are too short.
        assert!(!stop.is_stopped());
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.accepted, 4);
        assert_eq!(report.rejected, 2);
        assert_eq!(report.requested, 100);
        assert_eq!(harvester.live_workers(), 0);

        let mut ids: Vec<String> = store
            .articles
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.id.clone())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "2", "4", "5"]);

        let download = &report.stages[1];
        assert_eq!(download.processed, 6);
        assert_eq!(download.emitted, 6);
        assert!(report.dead_letters.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panicking_download_lands_in_dead_letters() {
        let stop = StopFlag::new();
        let discovery = Arc::new(FakeDiscovery::new(stop.clone(), Some(2)));
        let store = Arc::new(MemoryStore::default());
        let fetch = FakeFetch { panic_on: Some(2) };
        let harvester =
            harvester_with_fetch(100, discovery, fetch, Arc::clone(&store), stop.clone());

        let report = harvester.run().await.unwrap();

        // Ids 1..=6: 2 crashes the fetcher, 3 and 6 are too short.
        assert_eq!(report.accepted, 3);
        assert_eq!(report.rejected, 2);
        assert_eq!(report.stages[1].failed, 1);
        assert_eq!(report.dead_letters.len(), 1);
        assert_eq!(report.dead_letters[0].stage, "Download");
        assert!(report.dead_letters[0].error.contains("fetcher crashed"));
        assert_eq!(harvester.live_workers(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_start_failure_leaves_nothing_running() {
        let stop = StopFlag::new();
        let discovery = Arc::new(FakeDiscovery::new(stop.clone(), None));
        let store = Arc::new(MemoryStore::default());
        let harvester = harvester(10, discovery, store, stop.clone());

        let urls = harvester.channel::<String>();
        let pages = harvester.channel::<Page>();
        let records = harvester.channel::<ParsedArticle>();
        let rejected = Arc::new(AtomicUsize::new(0));
        let policy: Arc<dyn ErrorPolicy> = Arc::new(LogAndDrop);
        let mut stages = [
            harvester.discover_stage(&urls, &policy),
            harvester.download_stage(&urls, &pages, &policy),
            harvester.parse_stage(&pages, &records, &policy),
            harvester.persist_stage(&records, &rejected, &policy),
        ];
        // Discover starts, then Download refuses a second start.
        stages[1].start().unwrap();

        let res = harvester.start_all(&mut stages).await;

        assert!(matches!(res, Err(StageError::AlreadyStarted(ref name)) if name == "Download"));
        assert!(stop.is_stopped());
        assert_eq!(harvester.live_workers(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_external_stop_winds_down_pipeline() {
        let stop = StopFlag::new();
        let discovery = Arc::new(FakeDiscovery::new(stop.clone(), None));
        let store = Arc::new(MemoryStore::default());
        let harvester = harvester(usize::MAX, discovery, Arc::clone(&store), stop.clone());

        let stopper = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.stop();
        });
        let report = harvester.run().await.unwrap();

        assert!(stop.is_stopped());
        assert_eq!(harvester.live_workers(), 0);
        assert_eq!(
            report.accepted + report.rejected,
            report.stages[2].emitted as usize
        );
    }

    #[test]
    fn test_options_from_config() {
        let config = HarvestConfig {
            search_term: "go".to_string(),
            num_articles: 42,
            poll_interval_secs: 3,
            ..HarvestConfig::default()
        };
        let options = HarvestOptions::from(&config);
        assert_eq!(options.target, 42);
        assert_eq!(options.poll_interval, Duration::from_secs(3));
        assert_eq!(options.source_error_backoff, Duration::from_millis(500));
        assert_eq!(options.dead_letter_capacity, 100);
    }
}
