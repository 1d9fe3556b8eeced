use crate::graph::InteractionGraph;
use thiserror::Error;

/// Errors returned by an [`InteractionFetcher`](crate::feeds::InteractionFetcher).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// HTTP 429. `reset_at` is the epoch second at which the quota resets,
    /// when the server said so.
    #[error("rate limited (reset at {reset_at:?})")]
    RateLimited { reset_at: Option<i64> },

    #[error("search query too long: {length} > {max} characters")]
    QueryTooLong { length: usize, max: usize },

    #[error("{0}")]
    Other(String),
}

/// Why a collection stream stopped early.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("{endpoint}: {source}")]
    Fetch {
        endpoint: String,
        #[source]
        source: FetchError,
    },

    #[error("search query for counterpart {counterpart} exceeds the query length limit on its own")]
    QueryUnsatisfiable { counterpart: String },

    #[error("{endpoint}: cancelled")]
    Cancelled { endpoint: String },

    #[error("no counterpart ids were provided")]
    NoCounterparts,
}

/// At least one collection stream failed. The graph holds whatever the
/// streams collected before stopping.
#[derive(Debug, Error)]
#[error("interaction analysis of {} incomplete: {}", .graph.subject_id, .failures.first().map(ToString::to_string).unwrap_or_default())]
pub struct AnalysisError {
    pub graph: InteractionGraph,
    pub failures: Vec<CollectError>,
}

impl AnalysisError {
    pub fn into_partial(self) -> InteractionGraph {
        self.graph
    }
}
