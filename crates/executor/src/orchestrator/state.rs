use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use common::models::Candidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Resuming,
    Trading,
    Buying,
    Selling,
    PausedByOperator,
    Stopped,
}

impl Phase {
    /// A session is running or about to; no other session may start.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Phase::Resuming | Phase::Trading | Phase::Buying | Phase::Selling
        )
    }

    /// An order is on the book.
    pub fn is_mid_transaction(&self) -> bool {
        matches!(self, Phase::Buying | Phase::Selling)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Resuming => "resuming",
            Phase::Trading => "trading",
            Phase::Buying => "buying",
            Phase::Selling => "selling",
            Phase::PausedByOperator => "paused",
            Phase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// The process-wide session record. Only the orchestrator holds one.
#[derive(Debug, Default)]
pub struct SessionState {
    pub(crate) phase: Phase,
    pub(crate) asset: Option<String>,
    pub(crate) pair: Option<String>,
    pub(crate) last_pair: Option<String>,
    pub(crate) pending_candidates: Vec<Candidate>,
    /// The running session was ended by the operator; suppresses auto-restart.
    pub(crate) operator_stop: bool,
}

impl SessionState {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn last_pair(&self) -> Option<&str> {
        self.last_pair.as_deref()
    }

    pub fn has_session(&self) -> bool {
        self.pair.is_some()
    }

    pub(crate) fn begin(&mut self, pair: &str, asset: &str, phase: Phase) {
        self.pair = Some(pair.to_string());
        self.asset = Some(asset.to_string());
        self.phase = phase;
        self.operator_stop = false;
    }

    /// Ends the current session, remembering its pair so it is not re-entered.
    pub(crate) fn finish(&mut self, phase: Phase) {
        if let Some(pair) = self.pair.take() {
            self.last_pair = Some(pair);
        }
        self.asset = None;
        self.phase = phase;
    }

    pub(crate) fn view(&self) -> SessionView {
        SessionView {
            phase: self.phase,
            asset: self.asset.clone(),
            pair: self.pair.clone(),
            last_pair: self.last_pair.clone(),
            pending: self.pending_candidates.len(),
        }
    }
}

/// Read-only snapshot of `SessionState` handed to other components.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionView {
    pub phase: Phase,
    pub asset: Option<String>,
    pub pair: Option<String>,
    pub last_pair: Option<String>,
    pub pending: usize,
}

impl SessionView {
    pub fn has_session(&self) -> bool {
        self.pair.is_some()
    }
}

/// Raised by operator commands so an attempt loop in progress stops issuing
/// further starts. Cleared once the orchestrator has handled the command.
/// `close` is permanent and used on shutdown.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    raised: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst)
    }
}
