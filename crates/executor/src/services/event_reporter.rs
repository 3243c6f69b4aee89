use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::{
    actors::{Actor, ActorType, ControlMessage},
    models::{SessionEvent, SessionSnapshot},
    notifier::Notifier,
};

/// Relays session lifecycle events to the operator as chat messages.
pub struct EventReporter {
    id: Uuid,
    events: broadcast::Receiver<SessionEvent>,
    notifier: Arc<dyn Notifier>,
}

impl EventReporter {
    pub fn new(events: broadcast::Receiver<SessionEvent>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            id: Uuid::new_v4(),
            events,
            notifier,
        }
    }

    async fn report(&self, event: &SessionEvent) {
        let Some(text) = render(event) else {
            return;
        };
        if let Err(e) = self.notifier.notify(text).await {
            debug!("{} not reported: {}", event.kind(), e);
        }
    }
}

#[async_trait]
impl Actor for EventReporter {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> ActorType {
        ActorType::ReporterActor
    }

    async fn run(&mut self, supervisor_tx: mpsc::Sender<ControlMessage>) -> anyhow::Result<()> {
        let heartbeat = self.spawn_heartbeat(supervisor_tx.clone());
        info!("Reports started!");

        loop {
            match self.events.recv().await {
                Ok(event) => self.report(&event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Reporter lagged behind. Missed {} events.", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Session event channel closed. Stopping reporter.");
                    break;
                }
            }
        }

        drop(heartbeat);
        let _ = supervisor_tx.send(ControlMessage::Shutdown(self.id)).await;
        Ok(())
    }
}

pub fn render(event: &SessionEvent) -> Option<String> {
    let text = match event {
        SessionEvent::TradeStart { asset, .. } => format!("Buying {}.", asset),
        SessionEvent::TradeResume { asset, .. } => format!("Resuming {} trade.", asset),
        SessionEvent::TradeInfo(snapshot) => trade_info(snapshot),
        SessionEvent::PriceUpdate {
            asset,
            target,
            buy_price,
        } => {
            let up_pct = if *buy_price > 0.0 {
                (target / buy_price - 1.0) * 100.0
            } else {
                0.0
            };
            format!(
                "Target price for {} updated: {:.8}. New target {:.2}%",
                asset, target, up_pct
            )
        }
        SessionEvent::FilledOrder { asset, price, .. } => format!("Bought {} for {}!", asset, price),
        SessionEvent::Sold { asset, price, .. } => format!("Sold {} for {}!", asset, price),
        SessionEvent::CheckOrder(message) => message.clone(),
        SessionEvent::PersistenceTrigger { count } => {
            format!("Sell price triggered, persistence activated: {}!", count)
        }
        SessionEvent::TradeInfoStop { asset } => format!("{} trade ended!", asset),
        SessionEvent::Ended { .. } => "Trader ended".to_string(),
        SessionEvent::Failed { pair, reason } => format!("Trader on {} failed: {}", pair, reason),
    };
    Some(text).filter(|t| !t.is_empty())
}

fn trade_info(snapshot: &SessionSnapshot) -> String {
    let pct = snapshot.change_pct();
    format!(
        "*{}*\n*{}:* {:.2}%\n*Last Price:* {}\n*Buy Price:* {}\n*Sell Price:* {}\n*Stop Loss:* {}\n*Target Price:* {}",
        snapshot.pair.as_deref().unwrap_or("-"),
        if pct < 0.0 { "Down" } else { "Up" },
        pct,
        snapshot.last_price,
        snapshot.buy_price,
        snapshot.sell_price,
        snapshot.stop_loss,
        snapshot.target_price,
    )
}
