//! The fetch, process, continue loop shared by every paginated endpoint.

use crate::error::{CollectError, FetchError};
use crate::feeds::{Page, PageOptions};
use crate::limiter::RateLimiter;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Span;

pub type FetchFuture<'a> = BoxFuture<'a, Result<Page, FetchError>>;

/// Shortest sleep when the limiter denies a request.
pub(crate) const MIN_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectSummary {
    pub pages: usize,
    pub items: usize,
    /// Number of 429 responses absorbed.
    pub rate_limited: usize,
}

pub struct PaginatedCollector {
    endpoint: String,
    limiter: Arc<RateLimiter>,
    page_size: u32,
    cancel: CancellationToken,
    span: Span,
}

impl PaginatedCollector {
    pub fn new(
        endpoint: impl Into<String>,
        limiter: Arc<RateLimiter>,
        page_size: u32,
        cancel: CancellationToken,
        span: Span,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            limiter,
            page_size,
            cancel,
            span,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Fetches pages until `process` returns false, the last page carries no
    /// pagination token, or a fatal error occurs.
    ///
    /// Rate limit responses are absorbed: the limiter is marked exhausted,
    /// corrected with the server's reset time, and the same page is requested
    /// again once the limiter admits it. Anything `process` already consumed
    /// stays consumed when an error is returned.
    pub async fn run<'a, F, P>(&self, mut fetch: F, mut process: P) -> Result<CollectSummary, CollectError>
    where
        F: FnMut(PageOptions) -> FetchFuture<'a>,
        P: FnMut(&Page) -> bool,
    {
        let mut summary = CollectSummary::default();
        let mut token: Option<String> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled());
            }

            if !self.limiter.allow() {
                let wait = self.limiter.wait_time().max(MIN_WAIT);
                tracing::info!(parent: &self.span, endpoint = %self.endpoint, wait_secs = wait.as_secs(), "rate limit reached, waiting");
                if !sleep_or_cancel(&self.cancel, wait).await {
                    return Err(self.cancelled());
                }
                continue;
            }

            let options = PageOptions {
                page_size: self.page_size,
                pagination_token: token.clone(),
            };
            tracing::debug!(parent: &self.span, endpoint = %self.endpoint, token = ?options.pagination_token, "fetching page");

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                result = fetch(options) => result,
            };

            match result {
                Ok(page) => {
                    summary.pages += 1;
                    summary.items += page.records.len();
                    if !process(&page) {
                        break;
                    }
                    match page.next_token {
                        Some(next) => token = Some(next),
                        None => break,
                    }
                }
                Err(FetchError::RateLimited { reset_at }) => {
                    summary.rate_limited += 1;
                    tracing::warn!(parent: &self.span, endpoint = %self.endpoint, reset_at = ?reset_at, "server reported rate limit");
                    if !wait_for_reset(&self.limiter, reset_at, &self.cancel).await {
                        return Err(self.cancelled());
                    }
                }
                Err(source) => {
                    tracing::error!(parent: &self.span, endpoint = %self.endpoint, error = %source, "collection aborted");
                    return Err(CollectError::Fetch {
                        endpoint: self.endpoint.clone(),
                        source,
                    });
                }
            }
        }

        tracing::info!(
            parent: &self.span,
            endpoint = %self.endpoint,
            pages = summary.pages,
            items = summary.items,
            "collection finished"
        );
        Ok(summary)
    }

    fn cancelled(&self) -> CollectError {
        CollectError::Cancelled {
            endpoint: self.endpoint.clone(),
        }
    }
}

/// Whether another page should be requested after `page`: the page was full,
/// it carries a pagination token and the item cap is not reached yet.
pub fn has_more(page: &Page, page_size: u32, collected: usize, max_items: usize) -> bool {
    page.records.len() >= page_size as usize && page.next_token.is_some() && collected < max_items
}

/// Applies a server-reported rate limit to `limiter` and sleeps until the
/// limiter reopens, at least [`MIN_WAIT`] even when `reset_at` already lies
/// in the past. Returns false if cancelled first.
pub(crate) async fn wait_for_reset(limiter: &RateLimiter, reset_at: Option<i64>, cancel: &CancellationToken) -> bool {
    limiter.mark_limited();
    if let Some(reset_at) = reset_at {
        limiter.set_available_time(reset_at);
    }
    sleep_or_cancel(cancel, limiter.wait_time().max(MIN_WAIT)).await
}

/// Sleeps for `duration`. Returns false if cancelled first.
pub(crate) async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
