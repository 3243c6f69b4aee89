use std::{
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use chrono::{TimeDelta, Utc};
use common::{
    models::SessionSnapshot,
    notifier::{MockNotifier, NotifyError},
    session::MockSession,
};
use mockall::{Sequence, predicate::eq};

use super::*;

fn config() -> TradingConfig {
    TradingConfig {
        resume_backoff: Duration::ZERO,
        ..TradingConfig::default()
    }
}

fn mock_session() -> (MockSession, broadcast::Sender<SessionEvent>) {
    let (events_tx, _) = broadcast::channel(16);
    let mut session = MockSession::new();
    let tx = events_tx.clone();
    session.expect_subscribe().returning(move || tx.subscribe());
    (session, events_tx)
}

fn quiet_notifier() -> MockNotifier {
    let mut notifier = MockNotifier::new();
    notifier.expect_notify().returning(|_| Ok(()));
    notifier
}

fn orchestrator(session: MockSession) -> (TradeOrchestrator, OrchestratorHandle) {
    TradeOrchestrator::new(Arc::new(session), Arc::new(quiet_notifier()), config())
}

fn batch(candidates: &[(&str, f64)]) -> SignalBatch {
    SignalBatch {
        destination: "trader".to_string(),
        candidates: candidates
            .iter()
            .map(|(pair, prob)| Candidate::new(*pair, *prob))
            .collect(),
        emitted_at: Utc::now(),
    }
}

fn pending_pairs(orch: &TradeOrchestrator) -> Vec<&str> {
    orch.state
        .pending_candidates
        .iter()
        .map(|c| c.pair.as_str())
        .collect()
}

async fn settle_all(orch: &mut TradeOrchestrator) {
    while let Some(report) = orch.in_flight.join_next().await {
        orch.settle(report).await;
    }
}

#[tokio::test]
async fn test_starts_best_candidate() {
    let (mut session, _events) = mock_session();
    session
        .expect_start_trading()
        .withf(|r| r.pair == "ETHBTC" && r.interval == "1m")
        .times(1)
        .returning(|_| Ok(()));
    let (mut orch, handle) = orchestrator(session);

    let outcome = orch
        .handle_batch(batch(&[("ETHBTC", 0.999), ("LTCBTC", 0.5)]), Utc::now())
        .await;

    assert_eq!(
        outcome,
        IntakeOutcome::Started {
            pair: "ETHBTC".to_string()
        }
    );
    let view = handle.view();
    assert_eq!(view.phase, Phase::Trading);
    assert_eq!(view.asset.as_deref(), Some("ETH"));
    assert_eq!(view.pending, 0);
}

#[tokio::test]
async fn test_last_pair_is_not_reentered() {
    let (session, _events) = mock_session();
    let (mut orch, _handle) = orchestrator(session);
    orch.state.last_pair = Some("ETHBTC".to_string());

    let outcome = orch
        .handle_batch(batch(&[("ETHBTC", 0.999), ("LTCBTC", 0.5)]), Utc::now())
        .await;

    assert_eq!(outcome, IntakeOutcome::NoPairs);
    assert_eq!(orch.state.phase, Phase::Idle);
    assert!(orch.state.pending_candidates.is_empty());
}

#[tokio::test]
async fn test_batch_for_other_destination_is_ignored() {
    let (session, _events) = mock_session();
    let (mut orch, handle) = orchestrator(session);
    orch.state.pending_candidates = vec![Candidate::new("XRPBTC", 0.999)];
    let before = orch.state.view();

    let mut b = batch(&[("ETHBTC", 0.999)]);
    b.destination = "dashboard".to_string();
    let outcome = orch.handle_batch(b, Utc::now()).await;

    assert_eq!(outcome, IntakeOutcome::NotForTrader);
    assert_eq!(orch.state.view(), before);
    assert_eq!(handle.view(), SessionView::default());
}

#[tokio::test]
async fn test_stale_batch_is_rejected() {
    let (session, _events) = mock_session();
    let (mut orch, _handle) = orchestrator(session);

    let mut b = batch(&[("ETHBTC", 0.9999)]);
    b.emitted_at = Utc::now() - TimeDelta::minutes(16);
    let outcome = orch.handle_batch(b, Utc::now()).await;

    assert!(matches!(outcome, IntakeOutcome::Stale { age_secs } if age_secs >= 960));
    assert_eq!(orch.state.phase, Phase::Idle);
}

#[tokio::test]
async fn test_batch_exactly_at_max_age_is_stale() {
    let (session, _events) = mock_session();
    let (mut orch, _handle) = orchestrator(session);

    let now = Utc::now();
    let mut b = batch(&[("ETHBTC", 0.9999)]);
    b.emitted_at = now - TimeDelta::minutes(15);
    let outcome = orch.handle_batch(b, now).await;

    assert_eq!(outcome, IntakeOutcome::Stale { age_secs: 900 });
}

#[tokio::test]
async fn test_busy_session_ignores_batches() {
    let (session, _events) = mock_session();
    let (mut orch, _handle) = orchestrator(session);
    orch.state.begin("ETHBTC", "ETH", Phase::Trading);

    let outcome = orch
        .handle_batch(batch(&[("LTCBTC", 0.9999)]), Utc::now())
        .await;
    assert_eq!(outcome, IntakeOutcome::Busy(Phase::Trading));

    orch.state.phase = Phase::PausedByOperator;
    let outcome = orch
        .handle_batch(batch(&[("LTCBTC", 0.9999)]), Utc::now())
        .await;
    assert_eq!(outcome, IntakeOutcome::Busy(Phase::PausedByOperator));
}

#[tokio::test]
async fn test_below_threshold_candidates_are_not_tried() {
    let (session, _events) = mock_session();
    let (mut orch, _handle) = orchestrator(session);

    let outcome = orch
        .handle_batch(batch(&[("ETHBTC", 0.997), ("LTCBTC", 0.2)]), Utc::now())
        .await;

    assert_eq!(outcome, IntakeOutcome::NoPairs);
}

#[tokio::test]
async fn test_empty_selection_keeps_retained_candidates() {
    let (session, _events) = mock_session();
    let (mut orch, _handle) = orchestrator(session);
    orch.state.pending_candidates = vec![Candidate::new("XRPBTC", 0.999)];

    let outcome = orch
        .handle_batch(batch(&[("ETHBTC", 0.2), ("ETHUSDT", 0.9999)]), Utc::now())
        .await;

    assert_eq!(outcome, IntakeOutcome::NoPairs);
    assert_eq!(pending_pairs(&orch), vec!["XRPBTC"]);
}

#[tokio::test]
async fn test_failed_start_advances_to_next_candidate() {
    let (mut session, _events) = mock_session();
    let mut seq = Sequence::new();
    session
        .expect_start_trading()
        .withf(|r| r.pair == "AAABTC")
        .times(1)
        .in_sequence(&mut seq)
        .returning(|r| {
            Err(SessionError::Rejected {
                pair: r.pair,
                reason: "MIN_NOTIONAL".to_string(),
            })
        });
    session
        .expect_start_trading()
        .withf(|r| r.pair == "BBBBTC")
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(()));
    let (mut orch, _handle) = orchestrator(session);

    let outcome = orch
        .handle_batch(
            batch(&[("BBBBTC", 0.9985), ("AAABTC", 0.999), ("CCCBTC", 0.9981)]),
            Utc::now(),
        )
        .await;

    assert_eq!(
        outcome,
        IntakeOutcome::Started {
            pair: "BBBBTC".to_string()
        }
    );
    assert_eq!(pending_pairs(&orch), vec!["CCCBTC"]);
}

#[tokio::test]
async fn test_every_candidate_failing_exhausts() {
    let (mut session, _events) = mock_session();
    session
        .expect_start_trading()
        .times(2)
        .returning(|_| Err(SessionError::Exchange("timeout".to_string())));
    let (mut orch, _handle) = orchestrator(session);

    let outcome = orch
        .handle_batch(batch(&[("AAABTC", 0.999), ("BBBBTC", 0.999)]), Utc::now())
        .await;

    assert_eq!(outcome, IntakeOutcome::Exhausted);
    assert_eq!(orch.state.phase, Phase::Idle);
    assert!(!orch.state.has_session());
}

#[tokio::test]
async fn test_operator_interrupt_halts_attempt_loop() {
    let (mut session, _events) = mock_session();
    let handle_slot: Arc<OnceLock<OrchestratorHandle>> = Arc::new(OnceLock::new());
    let slot = handle_slot.clone();
    session
        .expect_start_trading()
        .times(1)
        .returning(move |_| {
            if let Some(handle) = slot.get() {
                handle.halt_attempts();
            }
            Err(SessionError::Exchange("timeout".to_string()))
        });
    let (mut orch, handle) = orchestrator(session);
    let _ = handle_slot.set(handle);

    let outcome = orch
        .handle_batch(
            batch(&[("AAABTC", 0.9999), ("BBBBTC", 0.999), ("CCCBTC", 0.999)]),
            Utc::now(),
        )
        .await;

    assert_eq!(outcome, IntakeOutcome::Interrupted);
    assert_eq!(pending_pairs(&orch), vec!["BBBBTC", "CCCBTC"]);
}

#[tokio::test]
async fn test_shutdown_request_halts_attempt_loop() {
    let (mut session, _events) = mock_session();
    let handle_slot: Arc<OnceLock<OrchestratorHandle>> = Arc::new(OnceLock::new());
    let slot = handle_slot.clone();
    session
        .expect_start_trading()
        .times(1)
        .returning(move |_| {
            if let Some(handle) = slot.get() {
                tokio::spawn(handle.shutdown());
            }
            Err(SessionError::Exchange("timeout".to_string()))
        });
    let (mut orch, handle) = orchestrator(session);
    let _ = handle_slot.set(handle);

    let outcome = orch
        .handle_batch(
            batch(&[("AAABTC", 0.9999), ("BBBBTC", 0.999), ("CCCBTC", 0.999)]),
            Utc::now(),
        )
        .await;

    assert_eq!(outcome, IntakeOutcome::Interrupted);
    assert!(matches!(orch.input_rx.recv().await, Some(Input::Shutdown(_))));

    // A batch racing the shutdown request starts nothing either.
    let outcome = orch
        .handle_batch(batch(&[("DDDBTC", 0.9999)]), Utc::now())
        .await;
    assert_eq!(outcome, IntakeOutcome::Interrupted);
}

#[tokio::test]
async fn test_pause_mid_transaction_cancels_order() {
    let (mut session, _events) = mock_session();
    session
        .expect_stop_trading()
        .with(eq(StopRequest {
            cancel: true,
            user_stop: true,
        }))
        .times(1)
        .returning(|_| Ok(()));
    let (mut orch, handle) = orchestrator(session);
    orch.state.begin("ETHBTC", "ETH", Phase::Buying);

    let outcome = orch.pause();
    settle_all(&mut orch).await;

    assert_eq!(
        outcome,
        CommandOutcome::Paused {
            asset: "ETH".to_string()
        }
    );
    assert_eq!(handle.view().phase, Phase::PausedByOperator);
    assert!(orch.state.operator_stop);
}

#[tokio::test]
async fn test_pause_is_idempotent() {
    let (mut session, _events) = mock_session();
    session
        .expect_stop_trading()
        .with(eq(StopRequest {
            cancel: false,
            user_stop: true,
        }))
        .times(1)
        .returning(|_| Ok(()));
    let (mut orch, _handle) = orchestrator(session);
    orch.state.begin("ETHBTC", "ETH", Phase::Trading);

    assert!(matches!(orch.pause(), CommandOutcome::Paused { .. }));
    settle_all(&mut orch).await;
    assert!(matches!(orch.pause(), CommandOutcome::AlreadyPaused { .. }));
    settle_all(&mut orch).await;

    assert_eq!(orch.state.phase, Phase::PausedByOperator);
}

#[tokio::test]
async fn test_resume_waits_for_pending_stop() {
    let (mut session, _events) = mock_session();
    session
        .expect_stop_trading()
        .with(eq(StopRequest {
            cancel: true,
            user_stop: true,
        }))
        .times(1)
        .returning(|_| Ok(()));
    session
        .expect_start_trading()
        .withf(|r| r.pair == "ETHBTC")
        .times(1)
        .returning(|_| Ok(()));
    let (mut orch, _handle) = orchestrator(session);
    orch.state.begin("ETHBTC", "ETH", Phase::Buying);

    assert!(matches!(orch.pause(), CommandOutcome::Paused { .. }));
    assert_eq!(
        orch.resume(),
        CommandOutcome::StillStopping {
            asset: "ETH".to_string()
        }
    );
    assert_eq!(orch.state.phase, Phase::PausedByOperator);

    settle_all(&mut orch).await;
    assert!(matches!(orch.resume(), CommandOutcome::Resuming { .. }));

    // The stop's own end event arriving late must not close the resumed trade.
    orch.handle_session_event(SessionEvent::Ended {
        pair: "ETHBTC".to_string(),
        user_stop: true,
    })
    .await;
    assert_eq!(orch.state.phase, Phase::Resuming);

    settle_all(&mut orch).await;
    assert_eq!(orch.state.phase, Phase::Trading);
    assert!(orch.state.has_session());
}

#[tokio::test]
async fn test_commands_without_session_touch_nothing() {
    let (session, _events) = mock_session();
    let (mut orch, _handle) = orchestrator(session);

    assert_eq!(orch.pause(), CommandOutcome::NoActiveSession);
    assert_eq!(orch.resume(), CommandOutcome::NoActiveSession);
    assert_eq!(orch.sell(false), CommandOutcome::NoActiveSession);
    assert_eq!(orch.sell(true), CommandOutcome::NoActiveSession);
    assert!(orch.in_flight.is_empty());
    assert_eq!(orch.state.view(), SessionView::default());
}

#[tokio::test]
async fn test_resume_after_pause() {
    let (mut session, _events) = mock_session();
    session
        .expect_start_trading()
        .withf(|r| r.pair == "ETHBTC")
        .times(1)
        .returning(|_| Ok(()));
    let (mut orch, _handle) = orchestrator(session);
    orch.state.begin("ETHBTC", "ETH", Phase::PausedByOperator);
    orch.state.operator_stop = true;

    assert_eq!(
        orch.resume(),
        CommandOutcome::Resuming {
            asset: "ETH".to_string()
        }
    );
    assert_eq!(orch.state.phase, Phase::Resuming);
    settle_all(&mut orch).await;

    assert_eq!(orch.state.phase, Phase::Trading);
    assert!(!orch.state.operator_stop);
}

#[tokio::test]
async fn test_failed_resume_returns_to_paused() {
    let (mut session, _events) = mock_session();
    session
        .expect_start_trading()
        .times(1)
        .returning(|_| Err(SessionError::Exchange("down".to_string())));
    let (mut orch, _handle) = orchestrator(session);
    orch.state.begin("ETHBTC", "ETH", Phase::PausedByOperator);

    orch.resume();
    settle_all(&mut orch).await;

    assert_eq!(orch.state.phase, Phase::PausedByOperator);
}

#[tokio::test]
async fn test_resume_requires_pause() {
    let (session, _events) = mock_session();
    let (mut orch, _handle) = orchestrator(session);
    orch.state.begin("ETHBTC", "ETH", Phase::Trading);

    assert_eq!(
        orch.resume(),
        CommandOutcome::NotPaused {
            phase: Phase::Trading
        }
    );
}

#[tokio::test]
async fn test_operator_sell_uses_last_price() {
    let (mut session, _events) = mock_session();
    session.expect_snapshot().returning(|| SessionSnapshot {
        last_price: 0.05,
        ..SessionSnapshot::default()
    });
    session
        .expect_sell()
        .with(eq(Some(0.05)))
        .times(1)
        .returning(|_| Ok(()));
    let (mut orch, _handle) = orchestrator(session);
    orch.state.begin("ETHBTC", "ETH", Phase::Trading);

    assert_eq!(
        orch.sell(false),
        CommandOutcome::Selling {
            asset: "ETH".to_string(),
            price: 0.05
        }
    );
    settle_all(&mut orch).await;

    assert_eq!(orch.state.phase, Phase::Selling);
    assert!(orch.state.operator_stop);
}

#[tokio::test]
async fn test_failed_sell_returns_to_trading() {
    let (mut session, _events) = mock_session();
    session
        .expect_snapshot()
        .returning(SessionSnapshot::default);
    session
        .expect_sell()
        .with(eq(None))
        .times(1)
        .returning(|_| Err(SessionError::NotTrading));
    let (mut orch, _handle) = orchestrator(session);
    orch.state.begin("ETHBTC", "ETH", Phase::Trading);

    orch.sell(false);
    settle_all(&mut orch).await;

    assert_eq!(orch.state.phase, Phase::Trading);
    assert!(!orch.state.operator_stop);
}

#[tokio::test]
async fn test_force_sell_only_when_position_is_idle() {
    let (mut session, _events) = mock_session();
    session
        .expect_snapshot()
        .returning(SessionSnapshot::default);
    session
        .expect_sell()
        .with(eq(None))
        .times(1)
        .returning(|_| Ok(()));
    let (mut orch, _handle) = orchestrator(session);
    orch.state.begin("ETHBTC", "ETH", Phase::Buying);

    assert_eq!(
        orch.sell(true),
        CommandOutcome::NotTrading {
            phase: Phase::Buying
        }
    );

    orch.state.phase = Phase::Trading;
    assert!(matches!(orch.sell(true), CommandOutcome::Selling { .. }));
    settle_all(&mut orch).await;
}

#[tokio::test]
async fn test_sold_restarts_from_retained_candidates() {
    let (mut session, _events) = mock_session();
    session
        .expect_start_trading()
        .withf(|r| r.pair == "BBBBTC")
        .times(1)
        .returning(|_| Ok(()));
    let (mut orch, _handle) = orchestrator(session);
    orch.state.begin("AAABTC", "AAA", Phase::Trading);
    orch.state.pending_candidates = vec![Candidate::new("BBBBTC", 0.999)];

    orch.handle_session_event(SessionEvent::Sold {
        pair: "AAABTC".to_string(),
        asset: "AAA".to_string(),
        price: 1.0,
    })
    .await;

    assert_eq!(orch.state.phase, Phase::Trading);
    assert_eq!(orch.state.pair.as_deref(), Some("BBBBTC"));
    assert_eq!(orch.state.last_pair(), Some("AAABTC"));
    assert!(orch.state.pending_candidates.is_empty());
}

#[tokio::test]
async fn test_operator_sell_does_not_restart() {
    let (session, _events) = mock_session();
    let (mut orch, _handle) = orchestrator(session);
    orch.state.begin("AAABTC", "AAA", Phase::Selling);
    orch.state.operator_stop = true;
    orch.state.pending_candidates = vec![Candidate::new("BBBBTC", 0.999)];

    orch.handle_session_event(SessionEvent::Sold {
        pair: "AAABTC".to_string(),
        asset: "AAA".to_string(),
        price: 1.0,
    })
    .await;

    assert_eq!(orch.state.phase, Phase::Idle);
    assert!(!orch.state.has_session());
    assert!(!orch.state.operator_stop);
    assert_eq!(pending_pairs(&orch), vec!["BBBBTC"]);
}

#[tokio::test]
async fn test_order_events_move_phase() {
    let (session, _events) = mock_session();
    let (mut orch, _handle) = orchestrator(session);
    orch.state.begin("ETHBTC", "ETH", Phase::Trading);

    orch.handle_session_event(SessionEvent::TradeStart {
        pair: "ETHBTC".to_string(),
        asset: "ETH".to_string(),
    })
    .await;
    assert_eq!(orch.state.phase, Phase::Buying);

    orch.handle_session_event(SessionEvent::FilledOrder {
        pair: "LTCBTC".to_string(),
        asset: "LTC".to_string(),
        price: 1.0,
    })
    .await;
    assert_eq!(orch.state.phase, Phase::Buying);

    orch.handle_session_event(SessionEvent::FilledOrder {
        pair: "ETHBTC".to_string(),
        asset: "ETH".to_string(),
        price: 1.0,
    })
    .await;
    assert_eq!(orch.state.phase, Phase::Trading);
}

#[tokio::test]
async fn test_session_failure_stops_and_drops_candidates() {
    let (session, _events) = mock_session();
    let (mut orch, _handle) = orchestrator(session);
    orch.state.begin("ETHBTC", "ETH", Phase::Trading);
    orch.state.pending_candidates = vec![Candidate::new("BBBBTC", 0.999)];

    orch.handle_session_event(SessionEvent::Failed {
        pair: "ETHBTC".to_string(),
        reason: "price feed lost".to_string(),
    })
    .await;

    assert_eq!(orch.state.phase, Phase::Stopped);
    assert!(orch.state.pending_candidates.is_empty());
    assert_eq!(orch.state.last_pair(), Some("ETHBTC"));
}

#[tokio::test]
async fn test_new_batch_trades_after_session_failure() {
    let (mut session, _events) = mock_session();
    session
        .expect_start_trading()
        .withf(|r| r.pair == "LTCBTC")
        .times(1)
        .returning(|_| Ok(()));
    let (mut orch, handle) = orchestrator(session);
    orch.state.begin("ETHBTC", "ETH", Phase::Trading);

    orch.handle_session_event(SessionEvent::Failed {
        pair: "ETHBTC".to_string(),
        reason: "price feed lost".to_string(),
    })
    .await;
    let outcome = orch
        .handle_batch(batch(&[("ETHBTC", 0.9999), ("LTCBTC", 0.999)]), Utc::now())
        .await;

    assert_eq!(
        outcome,
        IntakeOutcome::Started {
            pair: "LTCBTC".to_string()
        }
    );
    assert_eq!(handle.view().phase, Phase::Trading);
}

#[tokio::test]
async fn test_startup_resumes_open_trade() {
    let (mut session, _events) = mock_session();
    let handle_slot: Arc<OnceLock<OrchestratorHandle>> = Arc::new(OnceLock::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    session.expect_is_last_trade_open().returning(|| Ok(true));
    session.expect_snapshot().returning(|| SessionSnapshot {
        asset: Some("ETH".to_string()),
        pair: Some("ETHBTC".to_string()),
        last_pair: Some("LTCBTC".to_string()),
        ..SessionSnapshot::default()
    });
    let slot = handle_slot.clone();
    let phases = seen.clone();
    session
        .expect_start_trading()
        .withf(|r| r.pair == "ETHBTC")
        .times(1)
        .returning(move |_| {
            if let Some(handle) = slot.get() {
                phases.lock().unwrap().push(handle.view().phase);
            }
            Ok(())
        });
    let (mut orch, handle) = orchestrator(session);
    let _ = handle_slot.set(handle.clone());

    orch.resume_open_trade().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![Phase::Resuming]);
    let view = handle.view();
    assert_eq!(view.phase, Phase::Trading);
    assert_eq!(view.pair.as_deref(), Some("ETHBTC"));
    assert_eq!(view.last_pair.as_deref(), Some("LTCBTC"));
}

#[tokio::test]
async fn test_startup_without_open_trade() {
    let (mut session, _events) = mock_session();
    session.expect_is_last_trade_open().returning(|| Ok(false));
    session.expect_snapshot().returning(|| SessionSnapshot {
        last_pair: Some("ETHBTC".to_string()),
        ..SessionSnapshot::default()
    });
    let (mut orch, _handle) = orchestrator(session);

    orch.resume_open_trade().await.unwrap();

    assert_eq!(orch.state.phase, Phase::Idle);
    assert_eq!(orch.state.last_pair(), Some("ETHBTC"));
}

#[tokio::test]
async fn test_resume_failure_is_bounded_and_reported() {
    let (mut session, _events) = mock_session();
    session.expect_is_last_trade_open().returning(|| Ok(true));
    session.expect_snapshot().returning(|| SessionSnapshot {
        pair: Some("ETHBTC".to_string()),
        ..SessionSnapshot::default()
    });
    session
        .expect_start_trading()
        .times(3)
        .returning(|_| Err(SessionError::Exchange("down".to_string())));
    let mut notifier = MockNotifier::new();
    notifier
        .expect_notify()
        .withf(|text| text.contains("ETHBTC"))
        .times(1)
        .returning(|_| Err(NotifyError::NoListener));

    let (orch, _handle) =
        TradeOrchestrator::new(Arc::new(session), Arc::new(notifier), config());
    let (_signal_tx, signal_rx) = mpsc::channel(1);

    let err = orch.run(signal_rx).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::ResumeFailed { attempts: 3, .. }
    ));
}

#[tokio::test]
async fn test_shutdown_cancels_order_in_flight() {
    let (mut session, _events) = mock_session();
    session
        .expect_stop_trading()
        .with(eq(StopRequest {
            cancel: true,
            user_stop: true,
        }))
        .times(1)
        .returning(|_| Ok(()));
    let (mut orch, _handle) = orchestrator(session);
    orch.state.begin("ETHBTC", "ETH", Phase::Buying);
    orch.state.pending_candidates = vec![Candidate::new("BBBBTC", 0.999)];

    orch.shutdown().await.unwrap();

    assert_eq!(orch.state.phase, Phase::Stopped);
    assert!(orch.state.pending_candidates.is_empty());
}

#[tokio::test]
async fn test_run_loop_trades_and_shuts_down() {
    let (mut session, _events) = mock_session();
    session.expect_is_last_trade_open().returning(|| Ok(false));
    session
        .expect_snapshot()
        .returning(SessionSnapshot::default);
    session
        .expect_start_trading()
        .withf(|r| r.pair == "ETHBTC")
        .times(1)
        .returning(|_| Ok(()));
    session
        .expect_stop_trading()
        .with(eq(StopRequest {
            cancel: false,
            user_stop: true,
        }))
        .times(1)
        .returning(|_| Ok(()));
    let (orch, handle) = orchestrator(session);
    let (signal_tx, signal_rx) = mpsc::channel(4);
    let run = tokio::spawn(orch.run(signal_rx));

    assert!(handle.ready().await);
    signal_tx
        .send(batch(&[("ETHBTC", 0.999)]))
        .await
        .unwrap();

    let mut view = handle.subscribe_view();
    time::timeout(Duration::from_secs(5), view.wait_for(|v| v.phase == Phase::Trading))
        .await
        .unwrap()
        .unwrap();

    handle.shutdown().await.unwrap();
    run.await.unwrap().unwrap();
    assert_eq!(handle.view().phase, Phase::Stopped);
}
