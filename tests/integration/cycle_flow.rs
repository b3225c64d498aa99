//! End-to-end cycle behaviour over the in-memory fakes.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use swapcycle::types::{CycleError, CycleOutcome, Direction, StopReason};

use crate::fakes::{keypair_b58, Harness};

#[tokio::test]
async fn rejects_keys_that_are_not_64_bytes() {
    let h = Harness::new(100).await;

    let short = bs58::encode([7u8; 32]).into_string();
    let err = h.controller.set_wallet("alice", &short).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_key");
    assert!(err.to_string().contains("got 32"));

    let long = bs58::encode([7u8; 65]).into_string();
    tokio_test::assert_err!(h.controller.set_wallet("alice", &long).await);
    assert!(h.store.get("alice").await.unwrap().is_none());
}

#[tokio::test]
async fn start_with_enough_balance_runs_one_buy_and_sell() {
    let h = Harness::new(100).await;
    let wallet = h.funded_wallet("alice", 1, dec!(0.02)).await;

    let outcome = h.controller.start("alice").await.unwrap();
    match outcome {
        CycleOutcome::Completed { sell, volume_usd, counted, cycles_completed, .. } => {
            assert!(sell.is_some());
            assert!(counted);
            assert_eq!(cycles_completed, 1);
            // 0.005 SOL × $150 × 2 legs
            assert_eq!(volume_usd, dec!(1.5));
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let swaps = h.chain.submitted();
    assert_eq!(swaps.len(), 2);
    assert_eq!(swaps[0].direction, Direction::Buy);
    assert_eq!(swaps[0].in_amount, 5_000_000);
    assert_eq!(swaps[1].direction, Direction::Sell);
    assert_eq!(swaps[1].in_amount, swaps[0].out_amount);
    assert!(swaps.iter().all(|s| s.owner == wallet));
    assert_eq!(h.chain.tokens(&wallet), 0);

    let s = h.store.require("alice").await.unwrap();
    assert!(s.is_active);
    assert_eq!(s.cycles_completed, 1);
    assert_eq!(s.total_volume_usd, dec!(1.5));
    assert!(s.next_run_at.is_some());
}

#[tokio::test]
async fn start_below_twice_trade_size_fails_without_mutation() {
    let h = Harness::new(100).await;
    h.funded_wallet("alice", 1, dec!(0.006)).await;
    let before = h.store.require("alice").await.unwrap();

    let err = h.controller.start("alice").await.unwrap_err();
    assert_eq!(err.to_string(), "Need 0.0100 SOL, have 0.0060");
    assert_eq!(err.kind(), "insufficient_balance");

    assert_eq!(h.store.require("alice").await.unwrap(), before);
    assert!(h.chain.submitted().is_empty());
}

#[tokio::test]
async fn runs_between_thresholds_and_pauses_below() {
    let h = Harness::new(100).await;
    let wallet = h.funded_wallet("alice", 1, dec!(0.02)).await;
    h.controller.start("alice").await.unwrap();

    // Between 1.5× (0.0075) and 2× (0.01): keeps running.
    h.chain.set_balance(&wallet, dec!(0.008));
    let outcome = h.controller.run_cycle("alice").await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(h.store.require("alice").await.unwrap().cycles_completed, 2);

    // Below 1.5×: deactivates without trading.
    h.chain.set_balance(&wallet, dec!(0.007));
    let swaps_before = h.chain.submitted().len();
    let outcome = h.controller.run_cycle("alice").await.unwrap();
    assert_eq!(outcome, CycleOutcome::Stopped { reason: StopReason::LowBalance });
    assert_eq!(h.chain.submitted().len(), swaps_before);

    let s = h.store.require("alice").await.unwrap();
    assert!(!s.is_active);
    assert_eq!(s.cycles_completed, 2);
}

#[tokio::test]
async fn stop_on_inactive_session_is_not_running() {
    let h = Harness::new(100).await;
    h.funded_wallet("alice", 1, dec!(0.02)).await;
    h.controller.start("alice").await.unwrap();
    let summary = h.controller.stop("alice").await.unwrap();
    assert_eq!(summary.cycles_completed, 1);

    let err = h.controller.stop("alice").await.unwrap_err();
    assert_eq!(err, CycleError::NotRunning);
    assert_eq!(err.to_string(), "Not running");

    let s = h.store.require("alice").await.unwrap();
    assert_eq!(s.cycles_completed, 1);
    assert_eq!(s.total_volume_usd, dec!(1.5));
}

#[tokio::test]
async fn counter_never_exceeds_max_cycles() {
    let h = Harness::new(3).await;
    h.funded_wallet("alice", 1, dec!(0.05)).await;
    h.controller.start("alice").await.unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..4 {
        outcomes.push(h.controller.run_cycle("alice").await.unwrap());
    }

    let s = h.store.require("alice").await.unwrap();
    assert_eq!(s.cycles_completed, 3);
    assert!(!s.is_active);
    assert!(outcomes[1].is_completed());
    assert!(matches!(outcomes[2], CycleOutcome::Skipped { .. }));
    assert_eq!(h.chain.submitted().len(), 6);
}

#[tokio::test]
async fn cycles_after_stop_are_not_counted() {
    let h = Harness::new(100).await;
    h.funded_wallet("alice", 1, dec!(0.02)).await;
    h.controller.start("alice").await.unwrap();
    h.controller.stop("alice").await.unwrap();

    let outcome = h.controller.run_cycle("alice").await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Skipped { .. }));
    assert_eq!(h.store.require("alice").await.unwrap().cycles_completed, 1);
    assert_eq!(h.chain.submitted().len(), 2);
}

#[tokio::test]
async fn failed_sell_counts_one_leg() {
    let h = Harness::new(100).await;
    let wallet = h.funded_wallet("alice", 1, dec!(0.02)).await;
    h.chain.fail_sends(Some(Direction::Sell));

    match h.controller.start("alice").await.unwrap() {
        CycleOutcome::Completed { sell, sell_error, volume_usd, cycles_completed, .. } => {
            assert!(sell.is_none());
            assert_eq!(sell_error.as_deref(), Some("Blockhash not found"));
            assert_eq!(volume_usd, dec!(0.75));
            assert_eq!(cycles_completed, 1);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    // The bought tokens stay in the wallet.
    assert!(h.chain.tokens(&wallet) > 0);
}

#[tokio::test]
async fn failed_buy_is_not_counted_but_rescheduled() {
    let h = Harness::new(100).await;
    h.funded_wallet("alice", 1, dec!(0.02)).await;
    h.router.set_no_route(true);

    let outcome = h.controller.start("alice").await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Failed { ref kind, .. } if kind == "no_route"));

    let s = h.store.require("alice").await.unwrap();
    assert!(s.is_active);
    assert_eq!(s.cycles_completed, 0);
    assert!(s.next_run_at.is_some());

    h.router.set_no_route(false);
    assert!(h.controller.run_cycle("alice").await.unwrap().is_completed());
    assert_eq!(h.store.require("alice").await.unwrap().cycles_completed, 1);
}

#[tokio::test]
async fn volume_falls_back_to_default_sol_price() {
    let h = Harness::with_price(100, None).await;
    h.funded_wallet("alice", 1, dec!(0.02)).await;

    match h.controller.start("alice").await.unwrap() {
        CycleOutcome::Completed { volume_usd, .. } => assert_eq!(volume_usd, dec!(1.5)),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn scheduler_drives_due_sessions() {
    let h = Harness::new(100).await;
    h.funded_wallet("alice", 1, dec!(0.05)).await;
    h.funded_wallet("bob", 2, dec!(0.05)).await;
    h.controller.start("alice").await.unwrap();
    h.controller.start("bob").await.unwrap();

    // Zero pacing: both sessions are due again right away.
    let handles = h.scheduler.run_due().await.unwrap();
    assert_eq!(handles.len(), 2);
    for outcome in futures::future::join_all(handles).await {
        assert!(outcome.unwrap().unwrap().is_completed());
    }

    assert_eq!(h.store.require("alice").await.unwrap().cycles_completed, 2);
    assert_eq!(h.store.require("bob").await.unwrap().cycles_completed, 2);
    assert_eq!(h.scheduler.in_flight(), 0);
}

#[tokio::test]
async fn concurrent_triggers_run_a_cycle_once() {
    let h = Harness::new(100).await;
    h.funded_wallet("alice", 1, dec!(0.05)).await;
    h.controller.start("alice").await.unwrap();
    let swaps_before = h.chain.submitted().len();

    let (a, b) = tokio::join!(h.runner.run("alice"), h.runner.run("alice"));
    let completed = [a.unwrap(), b.unwrap()]
        .iter()
        .filter(|o| o.is_completed())
        .count();

    assert_eq!(completed, 1);
    assert_eq!(h.chain.submitted().len(), swaps_before + 2);
    assert_eq!(h.store.require("alice").await.unwrap().cycles_completed, 2);
}

#[tokio::test]
async fn restart_requeues_session_orphaned_mid_cycle() {
    let h = Harness::new(100).await;
    h.funded_wallet("alice", 1, dec!(0.05)).await;
    h.controller.start("alice").await.unwrap();

    // Simulate a crash after the claim: active, nothing pending.
    let mut s = h.store.require("alice").await.unwrap();
    s.next_run_at = None;
    h.store.update(&s).await.unwrap();
    assert!(h.store.due_sessions(Utc::now()).await.unwrap().is_empty());

    h.scheduler.recover(true).await.unwrap();
    let handles = h.scheduler.run_due().await.unwrap();
    assert_eq!(handles.len(), 1);
    futures::future::join_all(handles).await;
    assert_eq!(h.store.require("alice").await.unwrap().cycles_completed, 2);
}

#[tokio::test]
async fn replacing_wallet_resets_session() {
    let h = Harness::new(100).await;
    h.funded_wallet("alice", 1, dec!(0.02)).await;
    h.controller.start("alice").await.unwrap();

    let info = h.controller.set_wallet("alice", &keypair_b58(9)).await.unwrap();
    assert_eq!(info.balance, Decimal::ZERO);

    let s = h.store.require("alice").await.unwrap();
    assert_eq!(s.wallet_public_key, info.public_key);
    assert!(!s.is_active);
    assert_eq!(s.cycles_completed, 0);
}

#[tokio::test]
async fn status_reports_session_and_token() {
    let h = Harness::new(100).await;
    let wallet = h.funded_wallet("alice", 1, dec!(0.02)).await;

    let report = h.controller.status("alice").await.unwrap();
    let view = report.session.unwrap();
    assert_eq!(view.wallet, wallet);
    assert_eq!(view.balance, dec!(0.02));
    assert_eq!(view.max_cycles, 100);
    assert_eq!(report.token.unwrap().buys_24h, 12);
}

#[tokio::test]
async fn stop_during_cycle_leaves_counters_untouched() {
    let h = Harness::new(100).await;
    h.funded_wallet("alice", 1, dec!(0.05)).await;
    h.controller.start("alice").await.unwrap();

    let gate = h.chain.hold_next_token_read();
    let runner = h.runner.clone();
    let cycle = tokio::spawn(async move { runner.run("alice").await });

    // The buy has landed; the cycle waits before its sell.
    gate.reached().await;
    let summary = h.controller.stop("alice").await.unwrap();
    assert_eq!(summary.cycles_completed, 1);
    gate.release();

    match cycle.await.unwrap().unwrap() {
        CycleOutcome::Completed { counted, volume_usd, cycles_completed, sell, .. } => {
            assert!(!counted);
            assert!(sell.is_some());
            assert_eq!(volume_usd, Decimal::ZERO);
            assert_eq!(cycles_completed, 1);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let s = h.store.require("alice").await.unwrap();
    assert!(!s.is_active);
    assert!(s.next_run_at.is_none());
    assert!(s.run_id.is_none());
    assert_eq!(s.cycles_completed, 1);
    assert_eq!(s.total_volume_usd, dec!(1.5));
}

#[tokio::test]
async fn restart_waits_for_stopped_cycle_to_finish() {
    let h = Harness::new(100).await;
    h.funded_wallet("alice", 1, dec!(0.05)).await;
    h.controller.start("alice").await.unwrap();

    let gate = h.chain.hold_next_token_read();
    let runner = h.runner.clone();
    let cycle = tokio::spawn(async move { runner.run("alice").await });
    gate.reached().await;

    h.controller.stop("alice").await.unwrap();
    let err = h.controller.start("alice").await.unwrap_err();
    assert_eq!(err, CycleError::AlreadyRunning);
    assert!(h.scheduler.run_due().await.unwrap().is_empty());
    // Only the held cycle's buy went out.
    assert_eq!(h.chain.submitted().len(), 3);

    gate.release();
    let held = cycle.await.unwrap().unwrap();
    assert!(matches!(held, CycleOutcome::Completed { counted: false, .. }));

    // The claim is released, so a fresh activation starts from zero.
    match h.controller.start("alice").await.unwrap() {
        CycleOutcome::Completed { counted, cycles_completed, .. } => {
            assert!(counted);
            assert_eq!(cycles_completed, 1);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    // Legs never interleave across cycles.
    let directions: Vec<_> = h.chain.submitted().iter().map(|s| s.direction).collect();
    assert_eq!(
        directions,
        [Direction::Buy, Direction::Sell].repeat(3)
    );
    let s = h.store.require("alice").await.unwrap();
    assert_eq!(s.cycles_completed, 1);
    assert_eq!(s.total_volume_usd, dec!(1.5));
}
