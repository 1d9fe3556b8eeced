use super::{InteractionFetcher, Page, PageOptions, Record, ReferenceKind, ReferencedRecord};
use crate::error::FetchError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::Span;

/// Twitter V2 API endpoint with trailing slash
pub const TWITTER_V2_API: &str = "https://api.twitter.com/2/";

const USER_AGENT: &str = "tweetgraph/0.1";

/// Twitter API subscription tier. Query length, search endpoint and quotas
/// all depend on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiPlan {
    #[default]
    Basic,
    Pro,
    Enterprise,
}

impl ApiPlan {
    pub fn max_search_query_length(self) -> usize {
        match self {
            ApiPlan::Basic => 512,
            ApiPlan::Pro | ApiPlan::Enterprise => 1024,
        }
    }

    /// Basic only has access to the last 7 days of search.
    pub fn search_endpoint(self) -> &'static str {
        match self {
            ApiPlan::Basic => "tweets/search/recent",
            ApiPlan::Pro | ApiPlan::Enterprise => "tweets/search/all",
        }
    }

    pub fn search_page_size(self) -> u32 {
        match self {
            ApiPlan::Basic => 100,
            ApiPlan::Pro | ApiPlan::Enterprise => 500,
        }
    }

    /// How far back batched search keeps paging.
    pub fn recency_threshold(self) -> chrono::Duration {
        match self {
            ApiPlan::Basic => chrono::Duration::days(7),
            ApiPlan::Pro => chrono::Duration::days(90),
            ApiPlan::Enterprise => chrono::Duration::days(365),
        }
    }

    /// `(requests, window)` quotas for the timeline, liked and search
    /// endpoints.
    pub fn quotas(self) -> [(u32, Duration); 3] {
        let window = Duration::from_secs(15 * 60);
        match self {
            ApiPlan::Basic => [(5, window), (5, window), (60, window)],
            ApiPlan::Pro | ApiPlan::Enterprise => [(900, window), (75, window), (300, window)],
        }
    }
}

impl std::str::FromStr for ApiPlan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(ApiPlan::Basic),
            "pro" => Ok(ApiPlan::Pro),
            "enterprise" => Ok(ApiPlan::Enterprise),
            other => Err(format!("unknown API plan: {}", other)),
        }
    }
}

pub struct TwitterClient {
    bearer_token: String,
    plan: ApiPlan,
    base_url: String,
    client: reqwest::Client,
    span: Span,
}

#[derive(Debug, Deserialize)]
struct TweetsResponse {
    #[serde(default)]
    data: Vec<ApiTweet>,
    #[serde(default)]
    includes: Includes,
    #[serde(default)]
    meta: Meta,
}

#[derive(Debug, Deserialize)]
struct ApiTweet {
    id: String,
    #[serde(default)]
    author_id: String,
    in_reply_to_user_id: Option<String>,
    #[serde(default)]
    referenced_tweets: Vec<ApiReference>,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiReference {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    tweets: Vec<ApiTweet>,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserDetail {
    pub id: String,
    pub name: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
struct UserLookupResponse {
    #[serde(default)]
    data: Vec<UserDetail>,
}

impl TweetsResponse {
    fn into_page(self) -> Page {
        let referenced_authors = self
            .includes
            .tweets
            .into_iter()
            .filter(|t| !t.author_id.is_empty())
            .map(|t| (t.id, t.author_id))
            .collect();

        let records = self
            .data
            .into_iter()
            .map(|t| Record {
                id: t.id,
                author_id: t.author_id,
                in_reply_to_user_id: t.in_reply_to_user_id.filter(|id| !id.is_empty()),
                references: t
                    .referenced_tweets
                    .into_iter()
                    .filter_map(|r| {
                        ReferenceKind::parse(&r.kind).map(|kind| ReferencedRecord { kind, id: r.id })
                    })
                    .collect(),
                created_at: t.created_at,
            })
            .collect();

        Page {
            records,
            next_token: self.meta.next_token.filter(|t| !t.is_empty()),
            referenced_authors,
        }
    }
}

impl TwitterClient {
    pub fn new(bearer_token: String, plan: ApiPlan, timeout: Duration, span: Span) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            bearer_token,
            plan,
            base_url: TWITTER_V2_API.to_string(),
            client,
            span,
        }
    }

    /// Points the client at another server, e.g. a local mock.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        self.base_url = base_url;
        self
    }

    pub fn plan(&self) -> ApiPlan {
        self.plan
    }

    /// Resolves user handles to user details.
    pub async fn lookup_users(&self, usernames: &[String]) -> Result<Vec<UserDetail>, FetchError> {
        let body = self
            .send_get("users/by", &[("usernames", usernames.join(","))])
            .await?;
        let response: UserLookupResponse = serde_json::from_str(&body)
            .map_err(|e| FetchError::Other(format!("parsing user lookup response: {}", e)))?;
        Ok(response.data)
    }

    async fn fetch_tweets(
        &self,
        endpoint: &str,
        params: Vec<(&str, String)>,
        options: PageOptions,
    ) -> Result<Page, FetchError> {
        let mut params = params;
        if let Some(token) = options.pagination_token {
            params.push(("pagination_token", token));
        }

        let body = self.send_get(endpoint, &params).await?;
        let response: TweetsResponse = serde_json::from_str(&body)
            .map_err(|e| FetchError::Other(format!("parsing {} response: {}", endpoint, e)))?;
        Ok(response.into_page())
    }

    async fn send_get(&self, endpoint: &str, params: &[(&str, String)]) -> Result<String, FetchError> {
        let query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect();
        let url = format!("{}{}?{}", self.base_url, endpoint, query.join("&"));

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|e| FetchError::Other(format!("{}: {}", endpoint, e)))?;

        let status = response.status();
        tracing::debug!(parent: &self.span, endpoint, status = status.as_u16(), "sent GET request");

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let reset_at = parse_reset_header(
                response
                    .headers()
                    .get("x-rate-limit-reset")
                    .and_then(|v| v.to_str().ok()),
            );
            return Err(FetchError::RateLimited { reset_at });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(parent: &self.span, endpoint, status = status.as_u16(), body = %body, "request failed");
            return Err(FetchError::Other(format!(
                "{} returned {}: {}",
                endpoint, status, body
            )));
        }

        response
            .text()
            .await
            .map_err(|e| FetchError::Other(format!("reading {} response: {}", endpoint, e)))
    }
}

#[async_trait]
impl InteractionFetcher for TwitterClient {
    async fn fetch_timeline_page(
        &self,
        subject_id: &str,
        options: PageOptions,
    ) -> Result<Page, FetchError> {
        let endpoint = format!("users/{}/tweets", subject_id);
        let params = vec![
            ("max_results", options.page_size.clamp(5, 100).to_string()),
            (
                "tweet.fields",
                "author_id,conversation_id,referenced_tweets,created_at".to_string(),
            ),
            (
                "expansions",
                "in_reply_to_user_id,referenced_tweets.id,referenced_tweets.id.author_id"
                    .to_string(),
            ),
        ];
        let page = self.fetch_tweets(&endpoint, params, options).await?;
        Ok(attribute_to(page, subject_id))
    }

    async fn fetch_liked_page(
        &self,
        subject_id: &str,
        options: PageOptions,
    ) -> Result<Page, FetchError> {
        let endpoint = format!("users/{}/liked_tweets", subject_id);
        let params = vec![
            ("max_results", options.page_size.clamp(10, 100).to_string()),
            ("expansions", "author_id".to_string()),
        ];
        self.fetch_tweets(&endpoint, params, options).await
    }

    async fn fetch_search_page(
        &self,
        subject_id: &str,
        counterparts: &[String],
        options: PageOptions,
    ) -> Result<Page, FetchError> {
        if counterparts.is_empty() {
            return Err(FetchError::Other(
                "no counterpart ids were provided".to_string(),
            ));
        }

        let query = build_search_query(subject_id, counterparts);
        let max = self.plan.max_search_query_length();
        if query.len() > max {
            return Err(FetchError::QueryTooLong {
                length: query.len(),
                max,
            });
        }

        let params = vec![
            ("query", query),
            (
                "expansions",
                "in_reply_to_user_id,referenced_tweets.id.author_id".to_string(),
            ),
            (
                "tweet.fields",
                "created_at,referenced_tweets,author_id".to_string(),
            ),
            (
                "max_results",
                options
                    .page_size
                    .clamp(10, self.plan.search_page_size())
                    .to_string(),
            ),
        ];
        self.fetch_tweets(self.plan.search_endpoint(), params, options)
            .await
    }
}

/// Every tweet of a user timeline is authored by that user, whether or not
/// the response carried the author.
fn attribute_to(mut page: Page, author_id: &str) -> Page {
    for record in page.records.iter_mut().filter(|r| r.author_id.is_empty()) {
        record.author_id = author_id.to_string();
    }
    page
}

/// Parses the `x-rate-limit-reset` header (epoch seconds).
fn parse_reset_header(value: Option<&str>) -> Option<i64> {
    value?.trim().parse::<i64>().ok().filter(|t| *t > 0)
}

/// Builds the search query matching replies and retweets between `subject`
/// and `counterparts` in both directions. No length validation happens here.
///
/// See <https://developer.twitter.com/en/docs/twitter-api/tweets/search/integrate/build-a-query>
pub fn build_search_query(subject: &str, counterparts: &[String]) -> String {
    let any_of = |operator: &str| {
        counterparts
            .iter()
            .map(|id| format!("{}:{}", operator, id))
            .collect::<Vec<_>>()
            .join(" OR ")
    };

    let to_counterparts = any_of("to");
    let from_counterparts = any_of("from");
    let retweets_of_counterparts = any_of("retweets_of");

    format!(
        "(from:{s} ({to})) OR (to:{s} ({from})) OR (from:{s} ({rt})) OR (retweets_of:{s} ({from}))",
        s = subject,
        to = to_counterparts,
        from = from_counterparts,
        rt = retweets_of_counterparts,
    )
}
