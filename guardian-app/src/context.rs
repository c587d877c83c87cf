//! State shared between the control loop and the operator surfaces.

use crate::approval::ApprovalBroker;
use crate::metrics::MetricsSnapshot;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Notify;

/// The diagnosis and action currently in front of the approval gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentReview {
    pub diagnosis: String,
    pub action: String,
}

/// Owned by the control loop; chat and HTTP handlers hold an `Arc` and only
/// touch it through these methods. Staleness is fine: every field is
/// last-write-wins.
pub struct GuardianContext {
    latest: RwLock<Option<MetricsSnapshot>>,
    review: RwLock<Option<CurrentReview>>,
    manual_trigger: AtomicBool,
    wake: Notify,
    broker: Arc<ApprovalBroker>,
}

impl GuardianContext {
    pub fn new(broker: Arc<ApprovalBroker>) -> Self {
        Self {
            latest: RwLock::new(None),
            review: RwLock::new(None),
            manual_trigger: AtomicBool::new(false),
            wake: Notify::new(),
            broker,
        }
    }

    pub fn broker(&self) -> &Arc<ApprovalBroker> {
        &self.broker
    }

    pub fn latest_snapshot(&self) -> Option<MetricsSnapshot> {
        read(&self.latest).clone()
    }

    pub fn publish_snapshot(&self, snapshot: MetricsSnapshot) {
        *write(&self.latest) = Some(snapshot);
    }

    pub fn current_review(&self) -> Option<CurrentReview> {
        read(&self.review).clone()
    }

    pub fn set_review(&self, diagnosis: &str, action: &str) {
        *write(&self.review) = Some(CurrentReview {
            diagnosis: diagnosis.to_string(),
            action: action.to_string(),
        });
    }

    pub fn clear_review(&self) {
        write(&self.review).take();
    }

    /// Ask for a manual investigation and wake the loop if it is idle.
    pub fn request_manual_check(&self) {
        self.manual_trigger.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Read and clear the trigger in one step.
    pub fn take_manual_trigger(&self) -> bool {
        self.manual_trigger.swap(false, Ordering::SeqCst)
    }

    /// Resolves once a manual check is pending. A wake-up left behind by a
    /// request that a running cycle already consumed is skipped.
    pub async fn manual_check_requested(&self) {
        while !self.manual_trigger.load(Ordering::SeqCst) {
            self.wake.notified().await;
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn manual_trigger_is_cleared_by_the_first_reader() {
        let ctx = GuardianContext::new(Arc::new(ApprovalBroker::new()));
        assert!(!ctx.take_manual_trigger());
        ctx.request_manual_check();
        assert!(ctx.take_manual_trigger());
        assert!(!ctx.take_manual_trigger());
    }

    #[tokio::test]
    async fn trigger_before_wait_still_wakes() {
        let ctx = GuardianContext::new(Arc::new(ApprovalBroker::new()));
        ctx.request_manual_check();
        tokio::time::timeout(Duration::from_secs(1), ctx.manual_check_requested())
            .await
            .expect("stored permit should wake the waiter");
    }

    #[tokio::test(start_paused = true)]
    async fn consumed_trigger_does_not_wake_the_next_wait() {
        let ctx = GuardianContext::new(Arc::new(ApprovalBroker::new()));
        ctx.request_manual_check();
        assert!(ctx.take_manual_trigger());
        let waited =
            tokio::time::timeout(Duration::from_secs(5), ctx.manual_check_requested()).await;
        assert!(waited.is_err(), "stale permit must not start another cycle");

        ctx.request_manual_check();
        tokio::time::timeout(Duration::from_secs(5), ctx.manual_check_requested())
            .await
            .expect("fresh request wakes the waiter");
    }

    #[test]
    fn review_is_replaced_and_cleared() {
        let ctx = GuardianContext::new(Arc::new(ApprovalBroker::new()));
        ctx.set_review("disk full", "du -sh /var");
        ctx.set_review("disk full", "rm /var/log/big.log");
        assert_eq!(
            ctx.current_review().map(|r| r.action),
            Some("rm /var/log/big.log".to_string())
        );
        ctx.clear_review();
        assert!(ctx.current_review().is_none());
    }
}
