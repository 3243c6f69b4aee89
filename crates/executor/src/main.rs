use dotenvy::dotenv;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use common::{
    actors::{Actor, ActorType},
    config::TraderConfig,
    logger,
    models::SignalBatch,
    notifier::{ChannelNotifier, Notifier},
    session::Session,
};
use exchange::{BinanceClient, SpotSession};
use signal_feed::SignalFeed;

use crate::{
    actors::supervisor::Supervisor,
    orchestrator::TradeOrchestrator,
    services::{
        command_dispatcher::CommandDispatcher,
        event_reporter::EventReporter,
        keyboard::{KeyboardControl, shutdown_requested},
        shutdown::ShutdownCoordinator,
        telegram_service::{TelegramService, log_notifications},
    },
};

mod actors;
mod orchestrator;
mod services;

const SIGNAL_BUFFER: usize = 64;
const NOTIFY_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    logger::setup_logger();
    debug!("System starting up...");

    let config = TraderConfig::from_env()?;

    let client = BinanceClient::new(&config.exchange);
    let session: Arc<dyn Session> = Arc::new(SpotSession::new(
        client,
        config.strategy.clone(),
        &config.trading.quote_asset,
    ));

    let (notify_tx, _) = broadcast::channel::<String>(NOTIFY_BUFFER);
    let notifications = notify_tx.subscribe();
    let notifier: Arc<dyn Notifier> = Arc::new(ChannelNotifier::new(notify_tx));

    let (orchestrator, handle) =
        TradeOrchestrator::new(session.clone(), notifier.clone(), config.trading.clone());

    let commands = Arc::new(CommandDispatcher::new(handle.clone(), notifier.clone()));
    match &config.telegram {
        Some(telegram) => {
            let telegram_svc = TelegramService::new(telegram);
            tokio::spawn(telegram_svc.start(notifications, commands, handle.clone()));
        }
        None => {
            warn!("Telegram is not configured, notifications go to the log only");
            tokio::spawn(log_notifications(notifications));
        }
    }
    if let Err(e) = notifier.notify("Trader started".to_string()).await {
        warn!("Start notice not delivered: {}", e);
    }

    let (signal_tx, signal_rx) = mpsc::channel::<SignalBatch>(SIGNAL_BUFFER);
    let (feed, feed_handle) = SignalFeed::new(config.feed.clone(), signal_tx);

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut supervisor = Supervisor::new(stop_rx);

    supervisor.register_actor(
        ActorType::SignalFeedActor,
        Box::new(move || -> Box<dyn Actor> { Box::new(feed.client()) }),
    );

    let session_for_reporter = session.clone();
    let notifier_for_reporter = notifier.clone();
    supervisor.register_actor(
        ActorType::ReporterActor,
        Box::new(move || -> Box<dyn Actor> {
            Box::new(EventReporter::new(
                session_for_reporter.subscribe(),
                notifier_for_reporter.clone(),
            ))
        }),
    );

    let supervisor_task = tokio::spawn(async move { supervisor.start().await });
    let mut orchestrator_task = tokio::spawn(orchestrator.run(signal_rx));

    let keyboard = if config.keyboard_control {
        KeyboardControl::start().unwrap_or_else(|e| {
            warn!("Keyboard control unavailable: {}", e);
            None
        })
    } else {
        None
    };

    let coordinator =
        ShutdownCoordinator::new(handle.clone(), feed_handle, stop_tx, config.shutdown_timeout);

    let outcome = tokio::select! {
        _ = shutdown_requested(keyboard, &handle) => {
            coordinator.shutdown().await.map_err(anyhow::Error::from)
        }
        finished = &mut orchestrator_task => {
            let _ = coordinator.shutdown().await;
            match finished {
                Ok(Ok(())) => Err(anyhow::anyhow!("Orchestrator stopped unexpectedly")),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(anyhow::anyhow!("Orchestrator task failed: {}", e)),
            }
        }
    };

    if let Err(e) = supervisor_task.await {
        error!("Supervisor task failed: {}", e);
    }

    match &outcome {
        Ok(()) => info!("Goodbye"),
        Err(e) => error!("Trader exiting with failure: {:#}", e),
    }
    outcome
}
