use std::sync::Arc;

use teloxide::{prelude::*, types::ParseMode};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use common::config::TelegramConfig;

use crate::{orchestrator::OrchestratorHandle, services::command_dispatcher::CommandDispatcher};

pub struct TelegramService {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramService {
    pub fn new(config: &TelegramConfig) -> Self {
        Self {
            bot: Bot::new(&config.token),
            chat_id: ChatId(config.chat_id),
        }
    }

    /// Delivers notifications to the operator chat and, once the orchestrator
    /// is ready, routes operator messages to the command dispatcher.
    pub async fn start(
        self,
        rx: broadcast::Receiver<String>,
        commands: Arc<CommandDispatcher>,
        orchestrator: OrchestratorHandle,
    ) {
        info!("Starting Telegram Notification Service");

        let listener = listen(self.bot.clone(), self.chat_id, commands, orchestrator);
        tokio::select! {
            _ = self.deliver(rx) => {}
            _ = listener => {}
        }
    }

    async fn deliver(&self, mut rx: broadcast::Receiver<String>) {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if let Err(e) = self
                        .bot
                        .send_message(self.chat_id, msg)
                        .parse_mode(ParseMode::Markdown)
                        .await
                    {
                        error!("Failed to send Telegram message: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    error!("Telegram service lagged behind. Missed {} messages.", n);
                }
                Err(_) => {
                    info!("Telegram notification channel closed. Stopping service.");
                    break;
                }
            }
        }
    }
}

async fn listen(
    bot: Bot,
    operator: ChatId,
    commands: Arc<CommandDispatcher>,
    orchestrator: OrchestratorHandle,
) {
    if !orchestrator.ready().await {
        std::future::pending::<()>().await;
    }
    info!("Listening for operator commands");

    let handler = Update::filter_message().endpoint(on_message);
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![commands, operator])
        .default_handler(|_| async {})
        .build()
        .dispatch()
        .await;
}

async fn on_message(
    msg: Message,
    commands: Arc<CommandDispatcher>,
    operator: ChatId,
) -> ResponseResult<()> {
    if msg.chat.id != operator {
        debug!("Ignoring message from chat {}", msg.chat.id.0);
        return Ok(());
    }
    if let Some(text) = msg.text() {
        commands.dispatch(text).await;
    }
    Ok(())
}

/// Stands in for the chat when no bot is configured, so notifications still
/// reach the log.
pub async fn log_notifications(mut rx: broadcast::Receiver<String>) {
    loop {
        match rx.recv().await {
            Ok(msg) => info!("[notify] {}", msg),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("Notification log lagged behind. Missed {} messages.", n);
            }
            Err(_) => break,
        }
    }
}
