//! Runs the collection streams for one subject and merges them into a single
//! interaction graph.

use crate::classifier::{self, ClassifyReport};
use crate::clock::Clock;
use crate::collector::{has_more, CollectSummary, PaginatedCollector};
use crate::error::{AnalysisError, CollectError};
use crate::feeds::InteractionFetcher;
use crate::graph::InteractionGraph;
use crate::limiter::RateLimiter;
use crate::search::{BatchedSearchCollector, SearchSettings};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Span;

/// One limiter per endpoint; endpoints never share a quota.
#[derive(Debug, Clone)]
pub struct EndpointLimiters {
    pub timeline: Arc<RateLimiter>,
    pub liked: Arc<RateLimiter>,
    pub search: Arc<RateLimiter>,
}

impl EndpointLimiters {
    /// Builds the limiters from `(requests, window)` quotas in timeline,
    /// liked, search order.
    pub fn from_quotas(quotas: [(u32, Duration); 3], clock: Arc<dyn Clock>) -> Self {
        let [timeline, liked, search] =
            quotas.map(|(requests, window)| Arc::new(RateLimiter::with_clock(requests, window, clock.clone())));
        Self {
            timeline,
            liked,
            search,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    pub timeline_page_size: u32,
    pub liked_page_size: u32,
    pub timeline_max_items: usize,
    pub liked_max_items: usize,
    pub search: SearchSettings,
}

pub struct Analyzer {
    fetcher: Arc<dyn InteractionFetcher>,
    limiters: EndpointLimiters,
    clock: Arc<dyn Clock>,
    settings: AnalyzerSettings,
    cancel: CancellationToken,
    span: Span,
}

impl Analyzer {
    pub fn new(
        fetcher: Arc<dyn InteractionFetcher>,
        limiters: EndpointLimiters,
        clock: Arc<dyn Clock>,
        settings: AnalyzerSettings,
        cancel: CancellationToken,
        span: Span,
    ) -> Self {
        Self {
            fetcher,
            limiters,
            clock,
            settings,
            cancel,
            span,
        }
    }

    /// Builds the graph from the subject's timeline (replies, retweets,
    /// quotes) and the tweets the subject liked. Both streams run
    /// concurrently; a failing stream does not stop the other one.
    pub async fn create_interaction_graph(&self, subject_id: &str) -> Result<InteractionGraph, AnalysisError> {
        let graph = Mutex::new(InteractionGraph::new(subject_id));

        let (timeline, likes) = tokio::join!(
            self.collect_timeline(subject_id, &graph),
            self.collect_likes(subject_id, &graph, None),
        );

        self.finish(graph.into_inner(), vec![timeline.map(drop), likes.map(drop)])
    }

    /// Builds the graph of interactions between the subject and a known list
    /// of counterparts, discovered through batched search plus the subject's
    /// likes of tweets by those counterparts.
    pub async fn analyze_counterpart_interactions(
        &self,
        subject_id: &str,
        counterparts: &[String],
    ) -> Result<InteractionGraph, AnalysisError> {
        let mut unique: Vec<String> = Vec::with_capacity(counterparts.len());
        for id in counterparts {
            if id != subject_id && !id.is_empty() && !unique.contains(id) {
                unique.push(id.clone());
            }
        }

        let graph = Mutex::new(InteractionGraph::new(subject_id));

        let (search, likes) = tokio::join!(
            self.collect_search(subject_id, &unique, &graph),
            self.collect_likes(subject_id, &graph, Some(&unique)),
        );

        self.finish(graph.into_inner(), vec![search.map(drop), likes.map(drop)])
    }

    async fn collect_timeline(
        &self,
        subject_id: &str,
        graph: &Mutex<InteractionGraph>,
    ) -> Result<CollectSummary, CollectError> {
        let collector = PaginatedCollector::new(
            "timeline",
            self.limiters.timeline.clone(),
            self.settings.timeline_page_size,
            self.cancel.clone(),
            self.span.clone(),
        );
        let page_size = collector.page_size();
        let max_items = self.settings.timeline_max_items;
        let fetcher = self.fetcher.as_ref();
        let mut collected = 0;

        collector
            .run(
                |options| fetcher.fetch_timeline_page(subject_id, options),
                |page| {
                    let report = classifier::classify_interactions(subject_id, page, &mut graph.lock());
                    self.log_skipped("timeline", &report);
                    collected += page.records.len();
                    has_more(page, page_size, collected, max_items)
                },
            )
            .await
    }

    async fn collect_likes(
        &self,
        subject_id: &str,
        graph: &Mutex<InteractionGraph>,
        only: Option<&[String]>,
    ) -> Result<CollectSummary, CollectError> {
        let collector = PaginatedCollector::new(
            "liked",
            self.limiters.liked.clone(),
            self.settings.liked_page_size,
            self.cancel.clone(),
            self.span.clone(),
        );
        let page_size = collector.page_size();
        let max_items = self.settings.liked_max_items;
        let fetcher = self.fetcher.as_ref();
        let mut collected = 0;

        collector
            .run(
                |options| fetcher.fetch_liked_page(subject_id, options),
                |page| {
                    let report = classifier::classify_likes(page, &mut graph.lock(), only);
                    self.log_skipped("liked", &report);
                    collected += page.records.len();
                    has_more(page, page_size, collected, max_items)
                },
            )
            .await
    }

    async fn collect_search(
        &self,
        subject_id: &str,
        counterparts: &[String],
        graph: &Mutex<InteractionGraph>,
    ) -> Result<(), CollectError> {
        let collector = BatchedSearchCollector::new(
            self.limiters.search.clone(),
            self.clock.clone(),
            self.settings.search.clone(),
            self.cancel.clone(),
            self.span.clone(),
        );

        collector
            .run(self.fetcher.as_ref(), subject_id, counterparts, |page| {
                let report = classifier::classify_interactions(subject_id, page, &mut graph.lock());
                self.log_skipped("search", &report);
            })
            .await
            .map(drop)
    }

    fn log_skipped(&self, stream: &str, report: &ClassifyReport) {
        for skipped in &report.skipped {
            tracing::warn!(parent: &self.span, stream, ?skipped, "record skipped");
        }
    }

    fn finish(
        &self,
        mut graph: InteractionGraph,
        results: Vec<Result<(), CollectError>>,
    ) -> Result<InteractionGraph, AnalysisError> {
        graph.remove_subject();

        let failures: Vec<CollectError> = results.into_iter().filter_map(Result::err).collect();
        if failures.is_empty() {
            tracing::info!(parent: &self.span, subject = %graph.subject_id, interactions = graph.total(), "analysis complete");
            return Ok(graph);
        }

        for failure in &failures {
            tracing::error!(parent: &self.span, subject = %graph.subject_id, error = %failure, "collection stream failed");
        }
        Err(AnalysisError { graph, failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::error::FetchError;
    use crate::feeds::{Page, PageOptions, Record, ReferenceKind, ReferencedRecord};
    use crate::graph::Category;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};

    type Responses = Mutex<VecDeque<Result<Page, FetchError>>>;

    #[derive(Default)]
    struct FakeApi {
        timeline: Responses,
        liked: Responses,
        search: Responses,
        search_batches: Mutex<Vec<Vec<String>>>,
    }

    fn next(responses: &Responses) -> Result<Page, FetchError> {
        responses.lock().pop_front().unwrap_or_else(|| Ok(Page::default()))
    }

    #[async_trait]
    impl InteractionFetcher for FakeApi {
        async fn fetch_timeline_page(&self, _: &str, _: PageOptions) -> Result<Page, FetchError> {
            next(&self.timeline)
        }

        async fn fetch_liked_page(&self, _: &str, _: PageOptions) -> Result<Page, FetchError> {
            next(&self.liked)
        }

        async fn fetch_search_page(
            &self,
            _: &str,
            counterparts: &[String],
            _: PageOptions,
        ) -> Result<Page, FetchError> {
            self.search_batches.lock().push(counterparts.to_vec());
            next(&self.search)
        }
    }

    fn reply(author: &str, target: &str) -> Record {
        Record {
            id: format!("{}-{}", author, target),
            author_id: author.to_string(),
            in_reply_to_user_id: Some(target.to_string()),
            ..Default::default()
        }
    }

    fn liked(author: &str) -> Record {
        Record {
            id: format!("liked-{}", author),
            author_id: author.to_string(),
            ..Default::default()
        }
    }

    fn page(records: Vec<Record>, next_token: Option<&str>) -> Page {
        Page {
            records,
            next_token: next_token.map(String::from),
            referenced_authors: HashMap::new(),
        }
    }

    fn analyzer(api: FakeApi, cancel: CancellationToken) -> Analyzer {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        let window = Duration::from_secs(15 * 60);
        Analyzer::new(
            Arc::new(api),
            EndpointLimiters::from_quotas([(1, window), (1, window), (5, window)], clock.clone()),
            clock,
            AnalyzerSettings {
                timeline_page_size: 2,
                liked_page_size: 2,
                timeline_max_items: 100,
                liked_max_items: 4,
                search: SearchSettings {
                    page_size: 100,
                    max_query_len: 512,
                    recency_threshold: chrono::Duration::days(7),
                    batch_size: Some(2),
                },
            },
            cancel,
            Span::none(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeline_and_likes_are_merged() {
        let mut retweet = liked("s");
        retweet.references.push(ReferencedRecord {
            kind: ReferenceKind::Retweeted,
            id: "orig".to_string(),
        });
        let mut with_retweet = page(vec![retweet, reply("s", "s")], None);
        with_retweet
            .referenced_authors
            .insert("orig".to_string(), "bob".to_string());

        let api = FakeApi::default();
        api.timeline.lock().extend([
            Ok(page(vec![reply("s", "alice"), reply("s", "bob")], Some("t1"))),
            Ok(with_retweet),
        ]);
        api.liked.lock().extend([
            Ok(page(vec![liked("alice"), liked("s")], Some("l1"))),
            Ok(page(vec![liked("carol")], None)),
        ]);

        let graph = analyzer(api, CancellationToken::new())
            .create_interaction_graph("s")
            .await
            .unwrap();

        assert_eq!(graph.count(Category::ReplyTo, "alice"), 1);
        assert_eq!(graph.count(Category::ReplyTo, "bob"), 1);
        assert_eq!(graph.count(Category::RetweetTo, "bob"), 1);
        assert_eq!(graph.count(Category::Like, "alice"), 1);
        assert_eq!(graph.count(Category::Like, "carol"), 1);
        for category in Category::ALL {
            assert!(!graph.counts(category).contains_key("s"));
        }

        let (ids, scores) = graph.ranked();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
        assert_eq!(scores, vec![2, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stream_returns_partial_graph() {
        let api = FakeApi::default();
        api.timeline.lock().extend([
            Ok(page(vec![reply("s", "alice"), reply("s", "alice")], Some("t1"))),
            Err(FetchError::Other("503".to_string())),
        ]);
        api.liked
            .lock()
            .extend([Ok(page(vec![liked("carol")], None))]);

        let err = analyzer(api, CancellationToken::new())
            .create_interaction_graph("s")
            .await
            .unwrap_err();

        assert_eq!(err.failures.len(), 1);
        assert!(matches!(
            err.failures[0],
            CollectError::Fetch { ref endpoint, .. } if endpoint == "timeline"
        ));
        let graph = err.into_partial();
        assert_eq!(graph.count(Category::ReplyTo, "alice"), 2);
        assert_eq!(graph.count(Category::Like, "carol"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_likes_stop_at_item_cap() {
        let api = FakeApi::default();
        api.liked.lock().extend([
            Ok(page(vec![liked("a"), liked("b")], Some("l1"))),
            Ok(page(vec![liked("c"), liked("d")], Some("l2"))),
            Ok(page(vec![liked("e"), liked("f")], Some("l3"))),
        ]);

        let graph = analyzer(api, CancellationToken::new())
            .create_interaction_graph("s")
            .await
            .unwrap();

        assert_eq!(graph.likes_given.len(), 4);
        assert_eq!(graph.count(Category::Like, "e"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counterpart_analysis() {
        let api = FakeApi::default();
        api.search.lock().extend([
            Ok(page(vec![reply("s", "r1"), reply("r2", "s")], None)),
            Ok(page(vec![reply("r3", "s")], None)),
        ]);
        api.liked
            .lock()
            .extend([Ok(page(vec![liked("r1"), liked("stranger")], None))]);

        let counterparts: Vec<String> = ["r1", "r2", "s", "r1", "r3"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let analyzer = analyzer(api, CancellationToken::new());
        let graph = analyzer
            .analyze_counterpart_interactions("s", &counterparts)
            .await
            .unwrap();

        assert_eq!(graph.count(Category::ReplyTo, "r1"), 1);
        assert_eq!(graph.count(Category::ReplyFrom, "r2"), 1);
        assert_eq!(graph.count(Category::ReplyFrom, "r3"), 1);
        assert_eq!(graph.count(Category::Like, "r1"), 1);
        assert_eq!(graph.count(Category::Like, "stranger"), 0);

        let (ids, scores) = graph.ranked();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
        assert_eq!(scores, vec![2, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counterpart_batches_skip_subject_and_duplicates() {
        let api = Arc::new(FakeApi::default());
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        let window = Duration::from_secs(15 * 60);
        let analyzer = Analyzer::new(
            api.clone(),
            EndpointLimiters::from_quotas([(1, window), (1, window), (5, window)], clock.clone()),
            clock,
            AnalyzerSettings {
                timeline_page_size: 2,
                liked_page_size: 2,
                timeline_max_items: 10,
                liked_max_items: 10,
                search: SearchSettings {
                    page_size: 100,
                    max_query_len: 512,
                    recency_threshold: chrono::Duration::days(7),
                    batch_size: Some(2),
                },
            },
            CancellationToken::new(),
            Span::none(),
        );

        let counterparts: Vec<String> = ["a", "s", "b", "a", "c"].iter().map(|s| s.to_string()).collect();
        analyzer
            .analyze_counterpart_interactions("s", &counterparts)
            .await
            .unwrap();

        assert_eq!(
            *api.search_batches.lock(),
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string()]
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_counterparts_fails_search_stream_only() {
        let api = FakeApi::default();
        api.liked.lock().extend([Ok(page(vec![liked("x")], None))]);

        let err = analyzer(api, CancellationToken::new())
            .analyze_counterpart_interactions("s", &["s".to_string()])
            .await
            .unwrap_err();

        assert_eq!(err.failures.len(), 1);
        assert!(matches!(err.failures[0], CollectError::NoCounterparts));
        assert!(err.graph.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_reports_both_streams() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = analyzer(FakeApi::default(), cancel)
            .create_interaction_graph("s")
            .await
            .unwrap_err();

        assert_eq!(err.failures.len(), 2);
        assert!(err
            .failures
            .iter()
            .all(|f| matches!(f, CollectError::Cancelled { .. })));
    }
}
