pub mod twitter;

use crate::error::FetchError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// One page of tweets as returned by a timeline, likes or search endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<Record>,
    /// Pagination token for the next page, if any.
    pub next_token: Option<String>,
    /// Author ids of the tweets referenced by `records`, keyed by tweet id.
    pub referenced_authors: HashMap<String, String>,
}

impl Page {
    /// Creation time of the oldest record that carries one.
    pub fn oldest_created_at(&self) -> Option<DateTime<Utc>> {
        self.records.iter().filter_map(|r| r.created_at).min()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub id: String,
    pub author_id: String,
    /// Author of the tweet this one replies to. Absent for non-replies.
    pub in_reply_to_user_id: Option<String>,
    pub references: Vec<ReferencedRecord>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencedRecord {
    pub kind: ReferenceKind,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Retweeted,
    Quoted,
    RepliedTo,
}

impl ReferenceKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retweeted" => Some(Self::Retweeted),
            "quoted" => Some(Self::Quoted),
            "replied_to" => Some(Self::RepliedTo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageOptions {
    pub page_size: u32,
    pub pagination_token: Option<String>,
}

impl PageOptions {
    pub fn first(page_size: u32) -> Self {
        Self {
            page_size,
            pagination_token: None,
        }
    }
}

/// The remote API as seen by the collectors. Implementations only issue
/// requests and decode responses; throttling and retries are done by the
/// callers.
#[async_trait]
pub trait InteractionFetcher: Send + Sync {
    /// Tweets, replies, retweets and quotes posted by `subject_id`.
    async fn fetch_timeline_page(
        &self,
        subject_id: &str,
        options: PageOptions,
    ) -> Result<Page, FetchError>;

    /// Tweets liked by `subject_id`.
    async fn fetch_liked_page(
        &self,
        subject_id: &str,
        options: PageOptions,
    ) -> Result<Page, FetchError>;

    /// Replies and retweets between `subject_id` and any of `counterparts`,
    /// in both directions.
    async fn fetch_search_page(
        &self,
        subject_id: &str,
        counterparts: &[String],
        options: PageOptions,
    ) -> Result<Page, FetchError>;
}
