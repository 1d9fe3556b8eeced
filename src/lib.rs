//! Interaction graphs for Twitter users.
//!
//! An [`Analyzer`] pages through a user's timeline and liked tweets (or
//! searches the interactions with a given list of accounts), classifies
//! every tweet into replies, retweets and likes, and ranks the counterparts
//! by how often they interacted with the user. All requests go through
//! per-endpoint [`RateLimiter`]s.

pub mod analyzer;
pub mod classifier;
pub mod clock;
pub mod collector;
pub mod config;
pub mod error;
pub mod feeds;
pub mod graph;
pub mod limiter;
pub mod ranking;
pub mod search;

pub use analyzer::{Analyzer, AnalyzerSettings, EndpointLimiters};
pub use config::Config;
pub use error::{AnalysisError, CollectError, FetchError};
pub use feeds::twitter::{ApiPlan, TwitterClient};
pub use graph::{Category, InteractionGraph};
pub use limiter::RateLimiter;
