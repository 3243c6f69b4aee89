pub mod signal_response;

pub use signal_response::{CandidatePayload, SignalMessage};
