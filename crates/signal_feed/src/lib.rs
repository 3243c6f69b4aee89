use thiserror::Error;

pub mod remote;
pub mod services;
pub mod traits;

pub use services::feed_client::{FeedHandle, SignalFeed, SignalFeedClient};

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Malformed feed payload: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Feed payload has no destination tag")]
    MissingDestination,
    #[error("Feed payload has an invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}
