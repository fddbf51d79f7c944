//! Internal bug reports.
//!
//! Every report is logged. The first one is also shown to the user, once,
//! when `reportInternalBugs` is enabled.

use crate::client::Client;
use lsp_types::MessageType;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Collects internal invariant violations.
pub struct BugReporter {
    client: Arc<dyn Client>,
    enabled: AtomicBool,
    shown: AtomicBool,
    count: AtomicUsize,
}

impl std::fmt::Debug for BugReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BugReporter")
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl BugReporter {
    /// Create a reporter that shows its first report through `client`.
    #[must_use]
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self {
            client,
            enabled: AtomicBool::new(true),
            shown: AtomicBool::new(false),
            count: AtomicUsize::new(0),
        }
    }

    /// Enable or disable showing reports to the user.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Report a bug.
    pub async fn report(&self, message: impl Into<String>) {
        let message = message.into();
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        error!(bug = n, "Internal error: {message}");
        if !self.enabled.load(Ordering::SeqCst) || self.shown.swap(true, Ordering::SeqCst) {
            return;
        }
        let text = format!("keel: internal error: {message}. Please file an issue with the server log.");
        if let Err(e) = self.client.show_message(MessageType::ERROR, text).await {
            warn!(error = %e, "Showing bug report failed");
        }
    }

    /// Number of bugs reported so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}
