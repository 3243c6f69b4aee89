use std::time::Duration;

use thiserror::Error;
use tokio::{sync::watch, time};
use tracing::{error, info};

use signal_feed::FeedHandle;

use crate::orchestrator::{OrchestratorError, OrchestratorHandle};

#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("Shutdown did not finish within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Stops the session, the signal feed and the supervised actors, bounded by
/// a single deadline.
pub struct ShutdownCoordinator {
    orchestrator: OrchestratorHandle,
    feed: FeedHandle,
    supervisor_stop: watch::Sender<bool>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(
        orchestrator: OrchestratorHandle,
        feed: FeedHandle,
        supervisor_stop: watch::Sender<bool>,
        timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            feed,
            supervisor_stop,
            timeout,
        }
    }

    pub async fn shutdown(self) -> Result<(), ShutdownError> {
        info!("Shutting down (timeout {:?})", self.timeout);

        let stopped = time::timeout(self.timeout, async {
            let (session, ()) = tokio::join!(self.orchestrator.shutdown(), self.feed.close());
            session
        })
        .await;
        self.supervisor_stop.send_replace(true);

        match stopped {
            Ok(Ok(())) => {
                info!("Trader stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Shutdown failed: {}", e);
                Err(e.into())
            }
            Err(_) => {
                error!("Shutdown timed out after {:?}", self.timeout);
                Err(ShutdownError::Timeout(self.timeout))
            }
        }
    }
}
