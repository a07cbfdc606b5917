mod common;

use chrono::Duration;
use common::Harness;
use payguard_backend::audit::ActionKind;
use payguard_backend::database::repository::PayoutRepository;
use payguard_backend::lock::JobLock;
use payguard_backend::payout::reaper::REAPER_LOCK_NAME;
use payguard_backend::payout::{
    Payout, PayoutStatus, ReapRun, ReaperConfig, TransitionAuthority, TransitionError,
};

async fn backdated(h: &Harness, order_id: &str, age_hours: i64, status: PayoutStatus) -> Payout {
    let created_at = h.now() - Duration::hours(age_hours);
    let payout = Payout {
        status,
        ..Payout::intent(order_id, created_at)
    };
    h.payouts.insert(payout.clone()).await;
    payout
}

async fn status_of(h: &Harness, order_id: &str) -> PayoutStatus {
    h.payouts.find_by_order(order_id).await.unwrap().unwrap().status
}

fn reverted(run: ReapRun) -> usize {
    match run {
        ReapRun::Completed { reverted } => reverted,
        ReapRun::Skipped => 0,
    }
}

#[tokio::test]
async fn test_only_payouts_past_the_window_are_reverted() {
    let h = Harness::new();
    let stale = backdated(&h, "ORD-OLD", 50, PayoutStatus::ReceiptConfirmed).await;
    backdated(&h, "ORD-FRESH", 10, PayoutStatus::ReceiptConfirmed).await;

    let run = h.reaper(ReaperConfig::default()).run_once().await.unwrap();
    assert_eq!(run, ReapRun::Completed { reverted: 1 });

    assert_eq!(status_of(&h, "ORD-OLD").await, PayoutStatus::AutoReverted);
    assert_eq!(status_of(&h, "ORD-FRESH").await, PayoutStatus::ReceiptConfirmed);

    let entries = h.audit_sink.entries().await;
    let entry = entries
        .iter()
        .find(|e| e.action == ActionKind::PayoutAutoReverted)
        .unwrap();
    assert_eq!(entry.context["order_id"], "ORD-OLD");
    assert_eq!(entry.context["payout_id"], stale.id.to_string());
    assert_eq!(entry.context["prior_status"], "receipt_confirmed");
    assert_eq!(entry.context["elapsed_hours"], 50);
}

#[tokio::test]
async fn test_intent_only_payouts_are_reverted_too() {
    let h = Harness::new();
    backdated(&h, "ORD-1", 72, PayoutStatus::IntentMarked).await;

    let run = h.reaper(ReaperConfig::default()).run_once().await.unwrap();
    assert_eq!(run, ReapRun::Completed { reverted: 1 });
    assert_eq!(status_of(&h, "ORD-1").await, PayoutStatus::AutoReverted);
}

#[tokio::test]
async fn test_settled_payouts_are_left_alone() {
    let h = Harness::new();
    backdated(&h, "ORD-PAID", 100, PayoutStatus::Confirmed).await;
    backdated(&h, "ORD-FAILED", 100, PayoutStatus::VerificationFailed).await;
    backdated(&h, "ORD-HELD", 100, PayoutStatus::Blocked).await;

    let run = h.reaper(ReaperConfig::default()).run_once().await.unwrap();
    assert_eq!(run, ReapRun::Completed { reverted: 0 });

    assert_eq!(status_of(&h, "ORD-PAID").await, PayoutStatus::Confirmed);
    assert_eq!(status_of(&h, "ORD-FAILED").await, PayoutStatus::VerificationFailed);
    assert_eq!(status_of(&h, "ORD-HELD").await, PayoutStatus::Blocked);
}

#[tokio::test]
async fn test_overlapping_runs_revert_once() {
    let h = Harness::new();
    backdated(&h, "ORD-OLD", 50, PayoutStatus::IntentMarked).await;
    let reaper = h.reaper(ReaperConfig::default());

    let (a, b) = tokio::join!(reaper.run_once(), reaper.run_once());

    assert_eq!(reverted(a.unwrap()) + reverted(b.unwrap()), 1);
    assert_eq!(h.audit_sink.count(ActionKind::PayoutAutoReverted).await, 1);
}

#[tokio::test]
async fn test_instances_sharing_a_lease_revert_once() {
    let h = Harness::new();
    for i in 0..10 {
        backdated(&h, &format!("ORD-{i}"), 49 + i, PayoutStatus::IntentMarked).await;
    }
    let first = h.reaper(ReaperConfig::default());
    let second = h.reaper(ReaperConfig::default());

    let (a, b) = tokio::join!(first.run_once(), second.run_once());

    assert_eq!(reverted(a.unwrap()) + reverted(b.unwrap()), 10);
    assert_eq!(h.audit_sink.count(ActionKind::PayoutAutoReverted).await, 10);
}

#[tokio::test]
async fn test_run_is_skipped_while_lease_is_held_elsewhere() {
    let h = Harness::new();
    backdated(&h, "ORD-OLD", 50, PayoutStatus::IntentMarked).await;

    let token = h
        .lock
        .try_acquire(REAPER_LOCK_NAME, std::time::Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let reaper = h.reaper(ReaperConfig::default());
    assert_eq!(reaper.run_once().await.unwrap(), ReapRun::Skipped);
    assert_eq!(status_of(&h, "ORD-OLD").await, PayoutStatus::IntentMarked);

    h.lock.release(REAPER_LOCK_NAME, &token).await.unwrap();
    assert_eq!(
        reaper.run_once().await.unwrap(),
        ReapRun::Completed { reverted: 1 }
    );
}

#[tokio::test]
async fn test_reverted_payout_cannot_be_revived() {
    let h = Harness::new();
    backdated(&h, "ORD-OLD", 50, PayoutStatus::IntentMarked).await;
    h.reaper(ReaperConfig::default()).run_once().await.unwrap();

    let payout = h.payouts.find_by_order("ORD-OLD").await.unwrap().unwrap();
    let err = h
        .machine
        .transition(&payout, PayoutStatus::Confirmed, TransitionAuthority::VerificationWorker)
        .await
        .unwrap_err();

    assert!(matches!(err, TransitionError::Terminal { .. }));
    assert_eq!(status_of(&h, "ORD-OLD").await, PayoutStatus::AutoReverted);
    assert_eq!(h.audit_sink.count(ActionKind::PayoutTransitionRejected).await, 1);
}

#[tokio::test]
async fn test_late_confirmation_loses_to_reaper() {
    let h = Harness::new();
    let payout = backdated(&h, "ORD-OLD", 50, PayoutStatus::ReceiptConfirmed).await;
    h.reaper(ReaperConfig::default()).run_once().await.unwrap();

    // The worker still holds the pre-revert snapshot
    let outcome = h
        .machine
        .transition(&payout, PayoutStatus::Confirmed, TransitionAuthority::VerificationWorker)
        .await
        .unwrap();

    assert!(!outcome.is_applied());
    assert_eq!(status_of(&h, "ORD-OLD").await, PayoutStatus::AutoReverted);
}

#[tokio::test]
async fn test_blocked_payout_is_audited_as_critical() {
    let h = Harness::new();
    backdated(&h, "ORD-SUS", 1, PayoutStatus::ReceiptConfirmed).await;

    let outcome = h
        .machine
        .block("ORD-SUS", "compliance-officer-2", "sanctions screening hit")
        .await
        .unwrap();
    assert!(outcome.is_applied());
    assert_eq!(status_of(&h, "ORD-SUS").await, PayoutStatus::Blocked);

    let entries = h.audit_sink.entries().await;
    let entry = entries
        .iter()
        .find(|e| e.action == ActionKind::PayoutBlocked)
        .unwrap();
    assert_eq!(entry.actor_id, "compliance-officer-2");
    assert_eq!(h.audit_sink.critical_count().await, 1);
}
