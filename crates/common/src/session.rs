use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::models::{SessionEvent, SessionSnapshot, StartRequest, StopRequest};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Exchange request failed: {0}")]
    Exchange(String),
    #[error("Order rejected for {pair}: {reason}")]
    Rejected { pair: String, reason: String },
    #[error("No trade is running")]
    NotTrading,
    #[error("A trade is already running on {0}")]
    AlreadyTrading(String),
    #[error("Trade state persistence failed: {0}")]
    Persistence(String),
}

/// The trading strategy capability driven by the orchestrator.
///
/// Implementations own order placement and price tracking. Lifecycle changes
/// are announced on the broadcast channel returned by `subscribe`.
#[cfg_attr(feature = "mocks", mockall::automock)]
#[async_trait]
pub trait Session: Send + Sync {
    async fn start_trading(&self, request: StartRequest) -> Result<(), SessionError>;

    async fn stop_trading(&self, request: StopRequest) -> Result<(), SessionError>;

    /// Sells the open position. `None` sells at market.
    async fn sell(&self, price: Option<f64>) -> Result<(), SessionError>;

    /// Loads any trade left open by a previous run. When it returns `true`
    /// the snapshot carries the pair to resume.
    async fn is_last_trade_open(&self) -> Result<bool, SessionError>;

    fn snapshot(&self) -> SessionSnapshot;

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}
