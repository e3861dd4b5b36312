//! Test helpers for code built on the app crate
//!
//! Enabled by the `test-helpers` feature.

use std::sync::Mutex;
use std::time::Duration;

use crate::control_floor::{ControlFloor, Notification};

/// Control floor that records notifications instead of posting them
#[derive(Debug, Default)]
pub struct RecordingControlFloor {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingControlFloor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Endpoint variants in delivery order
    pub fn variants(&self) -> Vec<String> {
        self.notifications().iter().map(Notification::variant).collect()
    }

    pub fn count(&self, variant: &str) -> usize {
        self.variants().iter().filter(|v| *v == variant).count()
    }

    /// Notifications of `variant` for `udid`
    pub fn count_for(&self, variant: &str, udid: &str) -> usize {
        self.notifications()
            .iter()
            .filter(|n| n.udid() == udid && n.variant() == variant)
            .count()
    }

    /// Wait until at least `n` notifications arrived
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.notifications().len() >= n)
            .await
    }

    /// Wait until a notification of `variant` arrived
    pub async fn wait_for_variant(&self, variant: &str, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.count(variant) > 0).await
    }

    async fn wait_until(&self, timeout: Duration, done: impl Fn() -> bool) -> bool {
        tokio::time::timeout(timeout, async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }
}

impl ControlFloor for RecordingControlFloor {
    async fn notify(&self, notification: Notification) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
    }
}
