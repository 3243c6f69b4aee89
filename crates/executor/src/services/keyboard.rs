use std::{io::IsTerminal, thread, time::Duration};

use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyModifiers},
    terminal,
};
use tokio::{signal, sync::mpsc};
use tracing::{info, warn};

use crate::{orchestrator::OrchestratorHandle, services::command_dispatcher::render};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Shutdown,
    ForceSell,
    None,
}

impl From<KeyEvent> for KeyAction {
    fn from(key: KeyEvent) -> Self {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Char('c') if ctrl => KeyAction::Shutdown,
            KeyCode::Char('s') if ctrl => KeyAction::ForceSell,
            _ => KeyAction::None,
        }
    }
}

/// Raw-mode key reader. Raw mode is left again on drop.
pub struct KeyboardControl {
    rx: mpsc::UnboundedReceiver<KeyAction>,
}

impl KeyboardControl {
    /// Returns `None` when stdin is not a terminal.
    pub fn start() -> std::io::Result<Option<Self>> {
        if !std::io::stdin().is_terminal() {
            return Ok(None);
        }
        terminal::enable_raw_mode()?;

        let (tx, rx) = mpsc::unbounded_channel();
        thread::spawn(move || {
            loop {
                if event::poll(Duration::from_millis(100)).unwrap_or(false) {
                    if let Ok(Event::Key(key)) = event::read() {
                        let action = KeyAction::from(key);
                        if action != KeyAction::None && tx.send(action).is_err() {
                            break;
                        }
                    }
                } else if tx.is_closed() {
                    break;
                }
            }
        });

        info!("Keyboard control on: Ctrl+C stops the trader, Ctrl+S sells the open position");
        Ok(Some(Self { rx }))
    }

    pub async fn next(&mut self) -> Option<KeyAction> {
        self.rx.recv().await
    }
}

impl Drop for KeyboardControl {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Resolves when the operator asks the process to stop. Force-sell keys are
/// handled along the way.
pub async fn shutdown_requested(keyboard: Option<KeyboardControl>, orchestrator: &OrchestratorHandle) {
    if let Some(mut keys) = keyboard {
        while let Some(action) = keys.next().await {
            match action {
                KeyAction::Shutdown => return,
                KeyAction::ForceSell => match orchestrator.force_sell().await {
                    Ok(outcome) => info!("{}", render(&outcome)),
                    Err(e) => warn!("Force sell not delivered: {}", e),
                },
                KeyAction::None => {}
            }
        }
    }

    if let Err(e) = signal::ctrl_c().await {
        warn!("Could not listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
