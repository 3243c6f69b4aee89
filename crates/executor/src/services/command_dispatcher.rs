use std::sync::Arc;

use tracing::{info, warn};

use common::notifier::Notifier;

use crate::orchestrator::{CommandOutcome, OrchestratorHandle};

pub const HELP_MESSAGE: &str = "
/help : display this list
/pause: pause the trader
/resume: resume trader
/sell: make a limit sell order at the last price
";

const NO_SESSION: &str = "No active session! Type /help for a list of commands.";
const NOT_RECOGNIZED: &str = "Action not recognized! Type /help for a list of commands.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Help,
    Pause,
    Resume,
    Sell,
    Unrecognized,
}

impl Command {
    /// Reads the first token of a chat message. A `/cmd@botname` form is
    /// accepted as `/cmd`.
    pub fn parse(text: &str) -> Self {
        let Some(token) = text.split_whitespace().next() else {
            return Command::Unrecognized;
        };
        let name = token.split('@').next().unwrap_or(token);
        match name {
            "/help" => Command::Help,
            "/pause" => Command::Pause,
            "/resume" => Command::Resume,
            "/sell" => Command::Sell,
            _ => Command::Unrecognized,
        }
    }
}

/// Turns operator text into orchestrator requests and answers on the
/// notification channel.
pub struct CommandDispatcher {
    orchestrator: OrchestratorHandle,
    notifier: Arc<dyn Notifier>,
}

impl CommandDispatcher {
    pub fn new(orchestrator: OrchestratorHandle, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            orchestrator,
            notifier,
        }
    }

    pub async fn dispatch(&self, text: &str) {
        let command = Command::parse(text);
        info!("Operator command: {:?}", command);

        let reply = self.execute(command).await;
        if let Err(e) = self.notifier.notify(reply).await {
            warn!("Could not answer operator: {}", e);
        }
    }

    async fn execute(&self, command: Command) -> String {
        let needs_session = matches!(command, Command::Pause | Command::Resume | Command::Sell);
        if needs_session && !self.orchestrator.view().has_session() {
            if matches!(command, Command::Pause | Command::Sell) {
                self.orchestrator.halt_attempts();
            }
            return NO_SESSION.to_string();
        }

        let outcome = match command {
            Command::Help => return HELP_MESSAGE.to_string(),
            Command::Unrecognized => return NOT_RECOGNIZED.to_string(),
            Command::Pause => self.orchestrator.pause().await,
            Command::Resume => self.orchestrator.resume().await,
            Command::Sell => self.orchestrator.sell().await,
        };

        match outcome {
            Ok(outcome) => render(&outcome),
            Err(e) => {
                warn!("Command {:?} not delivered: {}", command, e);
                format!("Trader is not accepting commands: {}", e)
            }
        }
    }
}

pub fn render(outcome: &CommandOutcome) -> String {
    match outcome {
        CommandOutcome::Paused { .. } => "Stopping trader! To resume write /resume.".to_string(),
        CommandOutcome::AlreadyPaused { asset } => {
            format!("Trader on {} is already paused. To resume write /resume.", asset)
        }
        CommandOutcome::Resuming { asset } => format!("Resuming trader on {}!", asset),
        CommandOutcome::StillStopping { asset } => {
            format!("Trader on {} is still stopping, try /resume again shortly.", asset)
        }
        CommandOutcome::NotPaused { phase } => {
            format!("Trader is {}, nothing to resume.", phase)
        }
        CommandOutcome::Selling { asset, price } => {
            format!("Sell message received! Selling {} for {}.", asset, price)
        }
        CommandOutcome::NotTrading { phase } => {
            format!("Trader is {}, nothing to sell right now.", phase)
        }
        CommandOutcome::NoActiveSession => NO_SESSION.to_string(),
    }
}
