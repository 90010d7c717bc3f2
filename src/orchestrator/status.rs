//! The five-state status a caller watches for one verification.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::error::ErrorCategory;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationStatus {
    /// Submission not triggered yet.
    Waiting,
    Pending,
    Success { description: String },
    /// Already verified for this action; the user may still proceed.
    Warning { description: String },
    Error { reason: String, category: ErrorCategory },
}

impl VerificationStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, VerificationStatus::Error { .. })
    }
}

/// Publishes [`VerificationStatus`] changes. An `Error` falls back to
/// `Waiting` after the reset delay unless something else was published
/// meanwhile.
#[derive(Clone, Debug)]
pub struct StatusBoard {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    sender: watch::Sender<VerificationStatus>,
    epoch: AtomicU64,
    error_reset: Duration,
}

impl StatusBoard {
    pub fn new(error_reset: Duration) -> Self {
        let (sender, _) = watch::channel(VerificationStatus::Waiting);
        Self {
            inner: Arc::new(Inner {
                sender,
                epoch: AtomicU64::new(0),
                error_reset,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<VerificationStatus> {
        self.inner.sender.subscribe()
    }

    pub fn current(&self) -> VerificationStatus {
        self.inner.sender.borrow().clone()
    }

    /// Move to `Pending`. Returns false if a submission is already pending.
    pub fn begin(&self) -> bool {
        let started = self.inner.sender.send_if_modified(|status| {
            if *status == VerificationStatus::Pending {
                false
            } else {
                *status = VerificationStatus::Pending;
                true
            }
        });
        if started {
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        }
        started
    }

    pub fn set(&self, status: VerificationStatus) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        debug!(?status, "verification status");
        self.inner.sender.send_replace(status);
    }

    pub fn fail(&self, reason: impl Into<String>, category: ErrorCategory) {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let status = VerificationStatus::Error {
            reason: reason.into(),
            category,
        };
        debug!(?status, "verification status");
        self.inner.sender.send_replace(status);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            tokio::time::sleep(inner.error_reset).await;
            inner.sender.send_if_modified(|status| {
                if inner.epoch.load(Ordering::SeqCst) != epoch || !status.is_error() {
                    return false;
                }
                *status = VerificationStatus::Waiting;
                true
            });
        });
    }
}
