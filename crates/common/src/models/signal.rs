use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Destination tag of batches meant for the trader.
pub const TRADER_DESTINATION: &str = "trader";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub pair: String,
    pub probability: f64,
}

impl Candidate {
    pub fn new(pair: impl Into<String>, probability: f64) -> Self {
        Self {
            pair: pair.into(),
            probability,
        }
    }
}

/// One message from the signal feed, already validated by the feed client.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalBatch {
    pub destination: String,
    pub candidates: Vec<Candidate>,
    pub emitted_at: DateTime<Utc>,
}

impl SignalBatch {
    pub fn is_for_trader(&self) -> bool {
        self.destination == TRADER_DESTINATION
    }

    /// Age of the batch at `now`. Batches stamped in the future have zero age.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.emitted_at).max(chrono::Duration::zero())
    }
}

/// Strips the quote asset, so "ETHBTC" with quote "BTC" is "ETH".
pub fn asset_of<'a>(pair: &'a str, quote_asset: &str) -> &'a str {
    pair.strip_suffix(quote_asset).unwrap_or(pair)
}
