use common::models::{Candidate, SignalBatch};

use super::state::SessionState;

/// Orders a batch into tradeable candidates for the given session.
pub fn select(batch: &SignalBatch, quote_asset: &str, state: &SessionState) -> Vec<Candidate> {
    rank(&batch.candidates, quote_asset, state.last_pair())
}

/// Sorts by probability, highest first (ties keep feed order), then keeps
/// pairs quoted in `quote_asset` other than `last_pair`.
pub fn rank(candidates: &[Candidate], quote_asset: &str, last_pair: Option<&str>) -> Vec<Candidate> {
    let mut ranked = candidates.to_vec();
    ranked.sort_by(|a, b| b.probability.total_cmp(&a.probability));

    ranked
        .into_iter()
        .filter(|c| c.pair.ends_with(quote_asset) && c.pair.len() > quote_asset.len())
        .filter(|c| Some(c.pair.as_str()) != last_pair)
        .collect()
}
