use std::{future::Future, sync::Arc};

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::{JoinError, JoinSet},
    time,
};
use tracing::{debug, error, info, warn};

use common::{
    config::TradingConfig,
    models::{Candidate, SessionEvent, SignalBatch, StartRequest, StopRequest, asset_of},
    notifier::Notifier,
    session::{Session, SessionError},
};

use self::state::{Interrupt, Phase, SessionState, SessionView};

pub mod selector;
pub mod state;

#[cfg(test)]
mod tests;

const INPUT_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Could not check for an open trade after {attempts} attempts: {source}")]
    ResumeCheckFailed { attempts: u32, source: SessionError },
    #[error("Could not resume {pair} after {attempts} attempts: {source}")]
    ResumeFailed {
        pair: String,
        attempts: u32,
        source: SessionError,
    },
    #[error("Stopping the session during shutdown failed: {0}")]
    ShutdownFailed(SessionError),
    #[error("Orchestrator is not running")]
    NotRunning,
}

/// What happened to an inbound signal batch.
#[derive(Debug, Clone, PartialEq)]
pub enum IntakeOutcome {
    NotForTrader,
    Busy(Phase),
    Stale { age_secs: i64 },
    NoPairs,
    Started { pair: String },
    Interrupted,
    Exhausted,
}

/// Result of an operator command, rendered by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Paused { asset: String },
    AlreadyPaused { asset: String },
    Resuming { asset: String },
    StillStopping { asset: String },
    NotPaused { phase: Phase },
    Selling { asset: String, price: f64 },
    NotTrading { phase: Phase },
    NoActiveSession,
}

enum Input {
    Pause(oneshot::Sender<CommandOutcome>),
    Resume(oneshot::Sender<CommandOutcome>),
    Sell(oneshot::Sender<CommandOutcome>),
    ForceSell(oneshot::Sender<CommandOutcome>),
    Shutdown(oneshot::Sender<Result<(), OrchestratorError>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Stop,
    Sell,
    Resume,
}

/// Completion of a session call that ran off the orchestration loop.
#[derive(Debug)]
struct CallReport {
    kind: CallKind,
    pair: String,
    result: Result<(), SessionError>,
}

/// Cloneable front door to the orchestrator. Every session mutation goes
/// through its input queue; reads come from the published `SessionView`.
#[derive(Clone)]
pub struct OrchestratorHandle {
    input_tx: mpsc::Sender<Input>,
    interrupt: Interrupt,
    view_rx: watch::Receiver<SessionView>,
    ready_rx: watch::Receiver<bool>,
}

impl OrchestratorHandle {
    pub fn view(&self) -> SessionView {
        self.view_rx.borrow().clone()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<SessionView> {
        self.view_rx.clone()
    }

    /// Resolves once the startup resumption check is done. `false` means the
    /// orchestrator stopped before getting there.
    pub async fn ready(&self) -> bool {
        let mut ready = self.ready_rx.clone();
        loop {
            if *ready.borrow_and_update() {
                return true;
            }
            if ready.changed().await.is_err() {
                return false;
            }
        }
    }

    pub async fn pause(&self) -> Result<CommandOutcome, OrchestratorError> {
        self.interrupt.raise();
        self.request(Input::Pause).await
    }

    pub async fn resume(&self) -> Result<CommandOutcome, OrchestratorError> {
        self.request(Input::Resume).await
    }

    pub async fn sell(&self) -> Result<CommandOutcome, OrchestratorError> {
        self.interrupt.raise();
        self.request(Input::Sell).await
    }

    /// Sells at market, but only while a position is open and no order is in flight.
    pub async fn force_sell(&self) -> Result<CommandOutcome, OrchestratorError> {
        self.request(Input::ForceSell).await
    }

    /// Halts any attempt loop right away, then waits for the orchestrator to
    /// stop the session.
    pub fn shutdown(&self) -> impl Future<Output = Result<(), OrchestratorError>> + Send + 'static {
        self.interrupt.close();
        let input_tx = self.input_tx.clone();
        async move {
            let (tx, rx) = oneshot::channel();
            input_tx
                .send(Input::Shutdown(tx))
                .await
                .map_err(|_| OrchestratorError::NotRunning)?;
            rx.await.map_err(|_| OrchestratorError::NotRunning)?
        }
    }

    /// Stops a running attempt loop before its next start without queueing a
    /// command.
    pub fn halt_attempts(&self) {
        self.interrupt.raise();
    }

    async fn request(
        &self,
        input: fn(oneshot::Sender<CommandOutcome>) -> Input,
    ) -> Result<CommandOutcome, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.input_tx
            .send(input(tx))
            .await
            .map_err(|_| OrchestratorError::NotRunning)?;
        rx.await.map_err(|_| OrchestratorError::NotRunning)
    }
}

/// Single owner of `SessionState`. Signal batches, operator commands and
/// session lifecycle events are consumed by one loop, so mutations never race.
pub struct TradeOrchestrator {
    session: Arc<dyn Session>,
    notifier: Arc<dyn Notifier>,
    config: TradingConfig,
    state: SessionState,
    interrupt: Interrupt,
    in_flight: JoinSet<CallReport>,
    /// Pair whose operator stop has not completed yet.
    stopping: Option<String>,
    input_rx: mpsc::Receiver<Input>,
    events: broadcast::Receiver<SessionEvent>,
    view_tx: watch::Sender<SessionView>,
    ready_tx: watch::Sender<bool>,
}

impl TradeOrchestrator {
    pub fn new(
        session: Arc<dyn Session>,
        notifier: Arc<dyn Notifier>,
        config: TradingConfig,
    ) -> (Self, OrchestratorHandle) {
        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let (view_tx, view_rx) = watch::channel(SessionView::default());
        let (ready_tx, ready_rx) = watch::channel(false);
        let interrupt = Interrupt::default();
        let events = session.subscribe();

        let orchestrator = Self {
            session,
            notifier,
            config,
            state: SessionState::default(),
            interrupt: interrupt.clone(),
            in_flight: JoinSet::new(),
            stopping: None,
            input_rx,
            events,
            view_tx,
            ready_tx,
        };
        let handle = OrchestratorHandle {
            input_tx,
            interrupt,
            view_rx,
            ready_rx,
        };
        (orchestrator, handle)
    }

    pub async fn run(mut self, mut signals: mpsc::Receiver<SignalBatch>) -> Result<(), OrchestratorError> {
        if let Err(e) = self.resume_open_trade().await {
            error!("{}", e);
            self.report(format!("Trader could not start: {}", e)).await;
            return Err(e);
        }
        self.ready_tx.send_replace(true);
        info!("Orchestrator ready, waiting for signals");

        loop {
            tokio::select! {
                biased;

                input = self.input_rx.recv() => match input {
                    Some(Input::Shutdown(done)) => {
                        let result = self.shutdown().await;
                        let _ = done.send(result);
                        break;
                    }
                    Some(input) => self.handle_input(input),
                    None => break,
                },
                Some(report) = self.in_flight.join_next() => self.settle(report).await,
                event = self.events.recv() => match event {
                    Ok(event) => self.handle_session_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Orchestrator lagged: missed {} session events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("Session event stream closed, stopping orchestrator");
                        break;
                    }
                },
                Some(batch) = signals.recv() => {
                    let outcome = self.handle_batch(batch, Utc::now()).await;
                    debug!("Signal batch handled: {:?}", outcome);
                }
            }
        }

        info!("Orchestrator stopped");
        Ok(())
    }

    fn handle_input(&mut self, input: Input) {
        let (reply, outcome) = match input {
            Input::Pause(reply) => (reply, self.pause()),
            Input::Resume(reply) => (reply, self.resume()),
            Input::Sell(reply) => (reply, self.sell(false)),
            Input::ForceSell(reply) => (reply, self.sell(true)),
            Input::Shutdown(_) => return,
        };
        debug!("Command outcome: {:?}", outcome);
        let _ = reply.send(outcome);
    }

    /// Applies the intake rule to a batch and, if it passes, runs the
    /// candidate attempt loop.
    pub(crate) async fn handle_batch(&mut self, batch: SignalBatch, now: DateTime<Utc>) -> IntakeOutcome {
        if !batch.is_for_trader() {
            debug!("Ignoring batch addressed to {:?}", batch.destination);
            return IntakeOutcome::NotForTrader;
        }

        let phase = self.state.phase;
        if phase.is_active() || phase == Phase::PausedByOperator {
            info!(
                "Bot is {} on {}, ignoring signal",
                phase,
                self.state.pair.as_deref().unwrap_or("-")
            );
            return IntakeOutcome::Busy(phase);
        }

        let age = batch.age(now);
        let max_age = TimeDelta::from_std(self.config.signal_max_age).unwrap_or(TimeDelta::MAX);
        if age >= max_age {
            warn!(
                "Signal is outdated! Sent {} minutes ago, waiting for the next one",
                age.num_minutes()
            );
            return IntakeOutcome::Stale {
                age_secs: age.num_seconds(),
            };
        }

        let threshold = self.config.confidence_threshold;
        let pending: Vec<Candidate> = selector::select(&batch, &self.config.quote_asset, &self.state)
            .into_iter()
            .take_while(|c| c.probability >= threshold)
            .collect();
        if pending.is_empty() {
            info!("No pairs to trade!");
            return IntakeOutcome::NoPairs;
        }
        self.state.pending_candidates = pending;
        self.publish();
        debug!("Candidates: {:?}", self.state.pending_candidates);

        self.interrupt.clear();
        self.attempt_candidates().await
    }

    /// Tries the retained candidates in order, one start at a time, until one
    /// starts. Attempted candidates leave the list whether they worked or not.
    async fn attempt_candidates(&mut self) -> IntakeOutcome {
        while let Some(candidate) = self.state.pending_candidates.first().cloned() {
            if self.interrupt.is_raised() {
                info!(
                    "Operator command received, halting with {} candidates retained",
                    self.state.pending_candidates.len()
                );
                return IntakeOutcome::Interrupted;
            }

            self.state.pending_candidates.remove(0);
            self.publish();

            info!(
                "Starting trade on {} (probability {:.4})",
                candidate.pair, candidate.probability
            );
            let request = StartRequest {
                pair: candidate.pair.clone(),
                interval: self.config.interval.clone(),
            };
            match self.session.start_trading(request).await {
                Ok(()) => {
                    let asset = asset_of(&candidate.pair, &self.config.quote_asset).to_string();
                    self.state.begin(&candidate.pair, &asset, Phase::Trading);
                    self.publish();
                    info!("Trading {} on {}", asset, candidate.pair);
                    return IntakeOutcome::Started {
                        pair: candidate.pair,
                    };
                }
                Err(e) => warn!("Could not start trading {}: {}", candidate.pair, e),
            }
        }

        info!("No pairs to trade! Every candidate failed to start");
        IntakeOutcome::Exhausted
    }

    /// Startup path: a trade left open by a previous run is resumed before
    /// any signal is considered.
    pub(crate) async fn resume_open_trade(&mut self) -> Result<(), OrchestratorError> {
        let attempts = self.config.resume_attempts.max(1);

        let open = self
            .retry("Open trade check", attempts, |session| async move {
                session.is_last_trade_open().await
            })
            .await
            .map_err(|source| OrchestratorError::ResumeCheckFailed { attempts, source })?;

        let snapshot = self.session.snapshot();
        self.state.last_pair = snapshot.last_pair.clone();
        self.publish();

        if !open {
            return Ok(());
        }
        let Some(pair) = snapshot.pair.clone() else {
            warn!("Session reported an open trade without a pair, starting fresh");
            return Ok(());
        };
        let asset = snapshot
            .asset
            .clone()
            .unwrap_or_else(|| asset_of(&pair, &self.config.quote_asset).to_string());

        self.state.begin(&pair, &asset, Phase::Resuming);
        self.publish();
        info!("Resuming open trade on {}", pair);

        let request = StartRequest {
            pair: pair.clone(),
            interval: self.config.interval.clone(),
        };
        let resumed = self
            .retry("Resume", attempts, move |session| {
                let request = request.clone();
                async move { session.start_trading(request).await }
            })
            .await;

        match resumed {
            Ok(()) => {
                if self.state.phase == Phase::Resuming {
                    self.state.phase = Phase::Trading;
                }
                self.publish();
                Ok(())
            }
            Err(source) => {
                self.state.phase = Phase::Stopped;
                self.publish();
                Err(OrchestratorError::ResumeFailed {
                    pair,
                    attempts,
                    source,
                })
            }
        }
    }

    async fn retry<T, F, Fut>(&self, what: &str, attempts: u32, call: F) -> Result<T, SessionError>
    where
        F: Fn(Arc<dyn Session>) -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let mut attempt = 1;
        loop {
            match call(self.session.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                    time::sleep(self.config.resume_backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn pause(&mut self) -> CommandOutcome {
        self.interrupt.clear();
        let Some(asset) = self.state.asset.clone() else {
            return CommandOutcome::NoActiveSession;
        };

        match self.state.phase {
            Phase::PausedByOperator => CommandOutcome::AlreadyPaused { asset },
            phase if phase.is_active() => {
                let cancel = phase.is_mid_transaction();
                self.state.phase = Phase::PausedByOperator;
                self.state.operator_stop = true;
                self.publish();

                info!("Pausing trader on {} (cancel: {})", asset, cancel);
                self.stopping = self.state.pair.clone();
                self.spawn_call(CallKind::Stop, move |session| async move {
                    session
                        .stop_trading(StopRequest {
                            cancel,
                            user_stop: true,
                        })
                        .await
                });
                CommandOutcome::Paused { asset }
            }
            phase => CommandOutcome::NotTrading { phase },
        }
    }

    fn resume(&mut self) -> CommandOutcome {
        let (Some(asset), Some(pair)) = (self.state.asset.clone(), self.state.pair.clone()) else {
            return CommandOutcome::NoActiveSession;
        };
        if self.state.phase != Phase::PausedByOperator {
            return CommandOutcome::NotPaused {
                phase: self.state.phase,
            };
        }
        if self.stopping.as_deref() == Some(pair.as_str()) {
            info!("Stop on {} still in progress, not resuming yet", pair);
            return CommandOutcome::StillStopping { asset };
        }

        self.state.phase = Phase::Resuming;
        self.state.operator_stop = false;
        self.publish();

        info!("Resuming trader on {}", pair);
        let request = StartRequest {
            pair,
            interval: self.config.interval.clone(),
        };
        self.spawn_call(CallKind::Resume, move |session| async move {
            session.start_trading(request).await
        });
        CommandOutcome::Resuming { asset }
    }

    fn sell(&mut self, force: bool) -> CommandOutcome {
        self.interrupt.clear();
        let Some(asset) = self.state.asset.clone() else {
            return CommandOutcome::NoActiveSession;
        };

        let phase = self.state.phase;
        let allowed = if force {
            phase == Phase::Trading
        } else {
            phase.is_active() && phase != Phase::Selling
        };
        if !allowed {
            return CommandOutcome::NotTrading { phase };
        }

        let price = self.session.snapshot().last_price;
        self.state.phase = Phase::Selling;
        self.state.operator_stop = true;
        self.publish();

        info!("Selling {} at {}", asset, price);
        let limit = (price > 0.0 && !force).then_some(price);
        self.spawn_call(CallKind::Sell, move |session| async move {
            session.sell(limit).await
        });
        CommandOutcome::Selling { asset, price }
    }

    fn spawn_call<F, Fut>(&mut self, kind: CallKind, call: F)
    where
        F: FnOnce(Arc<dyn Session>) -> Fut,
        Fut: Future<Output = Result<(), SessionError>> + Send + 'static,
    {
        let pair = self.state.pair.clone().unwrap_or_default();
        let call = call(self.session.clone());
        self.in_flight.spawn(async move {
            CallReport {
                kind,
                pair,
                result: call.await,
            }
        });
    }

    async fn settle(&mut self, report: Result<CallReport, JoinError>) {
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                error!("Session call aborted: {}", e);
                return;
            }
        };
        let current = self.state.pair.as_deref() == Some(report.pair.as_str());
        if report.kind == CallKind::Stop && self.stopping.as_deref() == Some(report.pair.as_str()) {
            self.stopping = None;
        }

        match (report.kind, report.result) {
            (CallKind::Resume, Ok(())) if current && self.state.phase == Phase::Resuming => {
                self.state.phase = Phase::Trading;
                self.publish();
            }
            (CallKind::Resume, Err(e)) if current && self.state.phase == Phase::Resuming => {
                warn!("Resuming {} failed: {}", report.pair, e);
                self.state.phase = Phase::PausedByOperator;
                self.state.operator_stop = true;
                self.publish();
                self.report(format!("Could not resume {}: {}", report.pair, e))
                    .await;
            }
            (CallKind::Sell, Err(e)) if current && self.state.phase == Phase::Selling => {
                warn!("Selling {} failed: {}", report.pair, e);
                self.state.phase = Phase::Trading;
                self.state.operator_stop = false;
                self.publish();
                self.report(format!("Sell on {} failed: {}", report.pair, e))
                    .await;
            }
            (kind, Err(e)) => {
                warn!("{:?} on {} failed: {}", kind, report.pair, e);
                self.report(format!("{:?} on {} failed: {}", kind, report.pair, e))
                    .await;
            }
            (kind, Ok(())) => debug!("{:?} on {} done", kind, report.pair),
        }
    }

    pub(crate) async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::TradeStart { pair, .. } if self.is_current(&pair) => {
                if matches!(self.state.phase, Phase::Trading | Phase::Resuming) {
                    self.state.phase = Phase::Buying;
                    self.publish();
                }
            }
            SessionEvent::FilledOrder { pair, .. } | SessionEvent::TradeResume { pair, .. }
                if self.is_current(&pair) =>
            {
                if matches!(self.state.phase, Phase::Buying | Phase::Resuming) {
                    self.state.phase = Phase::Trading;
                    self.publish();
                }
            }
            SessionEvent::Sold { pair, price, .. } if self.is_current(&pair) => {
                info!("Sold {} at {}", pair, price);
                self.close_session(true).await;
            }
            SessionEvent::Ended { pair, user_stop } if self.is_current(&pair) => {
                // A pause's own stop may land after the operator resumed.
                let stale = user_stop && self.state.phase == Phase::Resuming;
                if self.state.phase != Phase::PausedByOperator && !stale {
                    info!("Trade on {} ended (user stop: {})", pair, user_stop);
                    self.close_session(!user_stop).await;
                }
            }
            SessionEvent::Failed { pair, reason } if self.is_current(&pair) => {
                error!("Session on {} failed: {}", pair, reason);
                self.state.pending_candidates.clear();
                self.state.operator_stop = false;
                self.state.finish(Phase::Stopped);
                self.publish();
            }
            _ => {}
        }
    }

    /// Ends the current session and, unless the operator ended it, retries the
    /// retained candidates.
    async fn close_session(&mut self, allow_restart: bool) {
        let restart = allow_restart && !self.state.operator_stop;
        self.state.operator_stop = false;
        self.state.finish(Phase::Stopped);

        let retained = std::mem::take(&mut self.state.pending_candidates);
        self.state.pending_candidates = selector::rank(
            &retained,
            &self.config.quote_asset,
            self.state.last_pair(),
        );
        self.state.phase = Phase::Idle;
        self.publish();

        if restart && !self.state.pending_candidates.is_empty() {
            info!(
                "Restarting from {} retained candidates",
                self.state.pending_candidates.len()
            );
            let outcome = self.attempt_candidates().await;
            debug!("Restart outcome: {:?}", outcome);
        }
    }

    async fn shutdown(&mut self) -> Result<(), OrchestratorError> {
        info!("Stopping Trader Bot");
        self.state.pending_candidates.clear();
        self.state.operator_stop = true;

        while let Some(report) = self.in_flight.join_next().await {
            self.settle(report).await;
        }

        let phase = self.state.phase;
        let result = if self.state.has_session() && phase.is_active() {
            let cancel = phase.is_mid_transaction();
            info!("Stopping session on {:?} (cancel: {})", self.state.pair, cancel);
            self.session
                .stop_trading(StopRequest {
                    cancel,
                    user_stop: true,
                })
                .await
                .map_err(OrchestratorError::ShutdownFailed)
        } else {
            Ok(())
        };

        self.state.phase = Phase::Stopped;
        self.publish();
        result
    }

    fn is_current(&self, pair: &str) -> bool {
        self.state.pair.as_deref() == Some(pair)
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.state.view());
    }

    async fn report(&self, text: String) {
        if let Err(e) = self.notifier.notify(text).await {
            warn!("Notification failed: {}", e);
        }
    }
}
