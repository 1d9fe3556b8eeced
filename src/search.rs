//! Interaction discovery through the search endpoint.
//!
//! The counterpart list is split into batches that each fit into a single
//! search query. How many ids fit depends on their length, so the batch size
//! starts from an estimate and shrinks whenever the query turns out too long.

use crate::clock::Clock;
use crate::collector::{sleep_or_cancel, wait_for_reset, MIN_WAIT};
use crate::error::{CollectError, FetchError};
use crate::feeds::twitter::build_search_query;
use crate::feeds::{InteractionFetcher, Page, PageOptions};
use crate::limiter::RateLimiter;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Span;

const ENDPOINT: &str = "search";

/// Position in the counterpart list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCursor {
    index: usize,
    batch_size: usize,
    default_batch_size: usize,
    token: Option<String>,
}

/// What to request after a page has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Next page of the same batch.
    NextPage,
    /// First page of the next batch.
    NextBatch,
    /// Every counterpart has been searched.
    Done,
}

impl BatchCursor {
    pub fn new(default_batch_size: usize) -> Self {
        let default_batch_size = default_batch_size.max(1);
        Self {
            index: 0,
            batch_size: default_batch_size,
            default_batch_size,
            token: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn is_finished(&self, total: usize) -> bool {
        self.index >= total
    }

    /// The ids covered by the current batch.
    pub fn window<'a>(&self, ids: &'a [String]) -> &'a [String] {
        let start = self.index.min(ids.len());
        let end = (self.index + self.batch_size).min(ids.len());
        &ids[start..end]
    }

    /// Drops one id from the current batch. The batch keeps its start, and
    /// paging restarts because the query changed. Returns false when the
    /// batch is already down to a single id.
    pub fn shrink(&mut self, total: usize) -> bool {
        let current = self.batch_size.min(total.saturating_sub(self.index));
        if current <= 1 {
            return false;
        }
        self.batch_size = current - 1;
        self.token = None;
        true
    }

    /// Moves on after a page of the current batch.
    ///
    /// Paging continues only while a pagination token exists and the page is
    /// within the recency threshold. Otherwise the batch is closed: the start
    /// advances past every id the batch was queried with and the batch size
    /// returns to the default.
    pub fn advance(&mut self, next_token: Option<String>, within_threshold: bool, total: usize) -> Step {
        if let (Some(token), true) = (next_token, within_threshold) {
            self.token = Some(token);
            return Step::NextPage;
        }

        let queried = self.batch_size.min(total.saturating_sub(self.index));
        self.index += queried.max(1);
        self.batch_size = self.default_batch_size;
        self.token = None;

        if self.is_finished(total) {
            Step::Done
        } else {
            Step::NextBatch
        }
    }
}

/// Estimates how many counterparts fit into one query of at most
/// `max_query_len` characters, assuming ids of average length.
pub fn default_batch_size(subject: &str, counterparts: &[String], max_query_len: usize) -> usize {
    if counterparts.is_empty() {
        return 1;
    }
    let total_len: usize = counterparts.iter().map(String::len).sum();
    let avg_len = total_len.div_ceil(counterparts.len()).max(1);

    let sample = "0".repeat(avg_len);
    let one = build_search_query(subject, std::slice::from_ref(&sample)).len();
    let two = build_search_query(subject, &[sample.clone(), sample]).len();
    let per_id = two - one;
    let base = one.saturating_sub(per_id);

    (max_query_len.saturating_sub(base) / per_id).max(1)
}

/// Whether the oldest timestamped record of `page` is at or after
/// `now - threshold`. Pages without timestamps count as within, empty pages
/// do not.
pub fn within_threshold(page: &Page, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
    if page.records.is_empty() {
        return false;
    }
    match page.oldest_created_at() {
        Some(oldest) => oldest >= now - threshold,
        None => true,
    }
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub page_size: u32,
    pub max_query_len: usize,
    pub recency_threshold: chrono::Duration,
    /// Overrides the estimated default batch size.
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchSummary {
    pub pages: usize,
    pub items: usize,
    pub batches: usize,
    pub shrinks: usize,
    pub rate_limited: usize,
}

pub struct BatchedSearchCollector {
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    settings: SearchSettings,
    cancel: CancellationToken,
    span: Span,
}

impl BatchedSearchCollector {
    pub fn new(
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        settings: SearchSettings,
        cancel: CancellationToken,
        span: Span,
    ) -> Self {
        Self {
            limiter,
            clock,
            settings,
            cancel,
            span,
        }
    }

    /// Searches interactions between `subject_id` and every id of
    /// `counterparts`, handing each page to `process`.
    pub async fn run<P>(
        &self,
        fetcher: &dyn InteractionFetcher,
        subject_id: &str,
        counterparts: &[String],
        mut process: P,
    ) -> Result<SearchSummary, CollectError>
    where
        P: FnMut(&Page),
    {
        if counterparts.is_empty() {
            return Err(CollectError::NoCounterparts);
        }

        let default_size = self.settings.batch_size.unwrap_or_else(|| {
            default_batch_size(subject_id, counterparts, self.settings.max_query_len)
        });
        let total = counterparts.len();
        let mut cursor = BatchCursor::new(default_size);
        let mut summary = SearchSummary::default();
        tracing::info!(parent: &self.span, counterparts = total, batch_size = cursor.batch_size(), "starting batched search");

        while !cursor.is_finished(total) {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled());
            }

            // Shrink oversized queries before they cost a quota slot.
            let window = cursor.window(counterparts);
            let length = build_search_query(subject_id, window).len();
            if length > self.settings.max_query_len {
                self.shrink(&mut cursor, total, window, length, &mut summary)?;
                continue;
            }

            if !self.limiter.allow() {
                let wait = self.limiter.wait_time().max(MIN_WAIT);
                tracing::info!(parent: &self.span, wait_secs = wait.as_secs(), "search rate limit reached, waiting");
                if !sleep_or_cancel(&self.cancel, wait).await {
                    return Err(self.cancelled());
                }
                continue;
            }

            let options = PageOptions {
                page_size: self.settings.page_size,
                pagination_token: cursor.token().map(String::from),
            };
            tracing::debug!(parent: &self.span, index = cursor.index(), batch_size = window.len(), token = ?options.pagination_token, "searching batch");

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                result = fetcher.fetch_search_page(subject_id, window, options) => result,
            };

            match result {
                Ok(page) => {
                    summary.pages += 1;
                    summary.items += page.records.len();
                    process(&page);

                    let within = within_threshold(&page, self.clock.now(), self.settings.recency_threshold);
                    match cursor.advance(page.next_token, within, total) {
                        Step::NextPage => {}
                        Step::NextBatch | Step::Done => summary.batches += 1,
                    }
                }
                Err(FetchError::QueryTooLong { length, .. }) => {
                    self.shrink(&mut cursor, total, window, length, &mut summary)?;
                }
                Err(FetchError::RateLimited { reset_at }) => {
                    summary.rate_limited += 1;
                    tracing::warn!(parent: &self.span, reset_at = ?reset_at, "server reported search rate limit");
                    if !wait_for_reset(&self.limiter, reset_at, &self.cancel).await {
                        return Err(self.cancelled());
                    }
                }
                Err(source) => {
                    tracing::error!(parent: &self.span, error = %source, "batched search aborted");
                    return Err(CollectError::Fetch {
                        endpoint: ENDPOINT.to_string(),
                        source,
                    });
                }
            }
        }

        tracing::info!(
            parent: &self.span,
            pages = summary.pages,
            items = summary.items,
            batches = summary.batches,
            shrinks = summary.shrinks,
            "batched search finished"
        );
        Ok(summary)
    }

    fn shrink(
        &self,
        cursor: &mut BatchCursor,
        total: usize,
        window: &[String],
        length: usize,
        summary: &mut SearchSummary,
    ) -> Result<(), CollectError> {
        if !cursor.shrink(total) {
            return Err(CollectError::QueryUnsatisfiable {
                counterpart: window.first().cloned().unwrap_or_default(),
            });
        }
        summary.shrinks += 1;
        tracing::warn!(parent: &self.span, length, max = self.settings.max_query_len, batch_size = cursor.batch_size(), "search query too long, shrinking batch");
        Ok(())
    }

    fn cancelled(&self) -> CollectError {
        CollectError::Cancelled {
            endpoint: ENDPOINT.to_string(),
        }
    }
}
