use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use common::models::{Candidate, SignalBatch};

use crate::{FeedError, traits::RemoteResponse};

/// Feed message as sent by the market scanner:
/// `{ "to": "trader", "data": [{"pair": "ETHBTC", "prob": 0.999}], "timestamp": 1700000000000 }`
#[derive(Deserialize, Debug)]
pub struct SignalMessage {
    pub to: Option<String>,
    pub data: Vec<CandidatePayload>,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
}

#[derive(Deserialize, Debug)]
pub struct CandidatePayload {
    pub pair: String,
    pub prob: f64,
}

impl RemoteResponse<SignalBatch> for SignalMessage {
    type Error = FeedError;

    fn to_model(&self) -> Result<SignalBatch, FeedError> {
        let destination = self.to.clone().ok_or(FeedError::MissingDestination)?;

        let emitted_at: DateTime<Utc> = DateTime::from_timestamp_millis(self.timestamp)
            .ok_or(FeedError::InvalidTimestamp(self.timestamp))?;

        let candidates = self
            .data
            .iter()
            .filter(|c| {
                let valid = c.prob.is_finite() && (0.0..=1.0).contains(&c.prob);
                if !valid {
                    debug!("Dropping candidate {} with probability {}", c.pair, c.prob);
                }
                valid
            })
            .map(|c| Candidate::new(c.pair.clone(), c.prob))
            .collect();

        Ok(SignalBatch {
            destination,
            candidates,
            emitted_at,
        })
    }
}

pub fn parse_signal_message(text: &str) -> Result<SignalBatch, FeedError> {
    serde_json::from_str::<SignalMessage>(text)?.to_model()
}
