pub mod session;
pub mod signal;

pub use session::{SessionEvent, SessionSnapshot, StartRequest, StopRequest};
pub use signal::{Candidate, SignalBatch, TRADER_DESTINATION, asset_of};
