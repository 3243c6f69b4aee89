use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("No notification listener is attached")]
    NoListener,
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Outbound text channel to the operator.
#[cfg_attr(feature = "mocks", mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: String) -> Result<(), NotifyError>;
}

/// Fans notifications out to every delivery service subscribed to the channel.
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: broadcast::Sender<String>,
}

impl ChannelNotifier {
    pub fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, text: String) -> Result<(), NotifyError> {
        self.tx
            .send(text)
            .map(|_| ())
            .map_err(|_| NotifyError::NoListener)
    }
}
