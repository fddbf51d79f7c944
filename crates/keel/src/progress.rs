//! Work-done progress reporting.
//!
//! [`ProgressTracker::start`] hands out a [`WorkHandle`] that long-running
//! operations report through. When the client supports work-done progress the
//! handle drives a `$/progress` begin/report/end sequence on a fresh token;
//! otherwise the start and end are shown with `window/showMessage` and
//! intermediate reports are dropped.
//!
//! [`WorkHandle::end`] is the single termination point and consumes the
//! handle.

use crate::client::Client;
use lsp_types::{
    MessageType, NumberOrString, ProgressToken, WorkDoneProgress, WorkDoneProgressBegin,
    WorkDoneProgressEnd, WorkDoneProgressReport,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Creates and tracks work-done progress.
pub struct ProgressTracker {
    client: Arc<dyn Client>,
    supports_work_done: AtomicBool,
    next_token: AtomicU64,
    in_progress: Mutex<HashMap<String, CancellationToken>>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("supports_work_done", &self.supports_work_done)
            .finish_non_exhaustive()
    }
}

impl ProgressTracker {
    /// Create a tracker reporting to `client`.
    #[must_use]
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self {
            client,
            supports_work_done: AtomicBool::new(false),
            next_token: AtomicU64::new(1),
            in_progress: Mutex::new(HashMap::new()),
        }
    }

    /// Record whether the client supports `window/workDoneProgress/create`.
    pub fn set_supports_work_done(&self, supported: bool) {
        self.supports_work_done.store(supported, Ordering::SeqCst);
    }

    /// Start reporting progress for a piece of work.
    ///
    /// Progress is best effort: transport failures are logged and the handle
    /// degrades to the `showMessage` fallback.
    pub async fn start(
        self: &Arc<Self>,
        title: impl Into<String>,
        message: impl Into<String>,
        cancellable: bool,
    ) -> WorkHandle {
        let title = title.into();
        let message = message.into();
        let cancel = CancellationToken::new();

        let mut token = None;
        if self.supports_work_done.load(Ordering::SeqCst) {
            let id = format!("keel-{}", self.next_token.fetch_add(1, Ordering::SeqCst));
            let candidate = NumberOrString::String(id.clone());
            match self.client.create_work_done_progress(candidate.clone()).await {
                Ok(()) => {
                    self.lock().insert(id, cancel.clone());
                    token = Some(candidate);
                }
                Err(e) => warn!(error = %e, title = %title, "Creating progress token failed"),
            }
        }

        match &token {
            Some(token) => {
                let begin = WorkDoneProgress::Begin(WorkDoneProgressBegin {
                    title: title.clone(),
                    cancellable: Some(cancellable),
                    message: (!message.is_empty()).then(|| message.clone()),
                    percentage: None,
                });
                if let Err(e) = self.client.progress(token.clone(), begin).await {
                    warn!(error = %e, "Sending progress begin failed");
                }
            }
            None => {
                let text = if message.is_empty() {
                    title.clone()
                } else {
                    format!("{title}: {message}")
                };
                if let Err(e) = self.client.show_message(MessageType::LOG, text).await {
                    warn!(error = %e, "Sending progress message failed");
                }
            }
        }
        debug!(title = %title, token = ?token, "Started progress");

        WorkHandle {
            tracker: self.clone(),
            token,
            title,
            cancel,
        }
    }

    /// Trip the cancel token of the work behind `token`.
    ///
    /// Returns `false` for unknown tokens.
    pub fn cancel(&self, token: &ProgressToken) -> bool {
        let NumberOrString::String(id) = token else {
            return false;
        };
        match self.lock().get(id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.in_progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A piece of work being reported to the client.
pub struct WorkHandle {
    tracker: Arc<ProgressTracker>,
    token: Option<ProgressToken>,
    title: String,
    cancel: CancellationToken,
}

impl std::fmt::Debug for WorkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkHandle")
            .field("title", &self.title)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl WorkHandle {
    /// Report intermediate progress.
    pub async fn report(&self, message: impl Into<String>, percentage: Option<u32>) {
        let Some(token) = &self.token else {
            return;
        };
        let report = WorkDoneProgress::Report(WorkDoneProgressReport {
            cancellable: None,
            message: Some(message.into()),
            percentage,
        });
        if let Err(e) = self.tracker.client.progress(token.clone(), report).await {
            warn!(error = %e, title = %self.title, "Sending progress report failed");
        }
    }

    /// Finish the work with a closing message.
    pub async fn end(self, message: impl Into<String>) {
        let message = message.into();
        match &self.token {
            Some(token) => {
                let end = WorkDoneProgress::End(WorkDoneProgressEnd {
                    message: (!message.is_empty()).then(|| message.clone()),
                });
                if let Err(e) = self.tracker.client.progress(token.clone(), end).await {
                    warn!(error = %e, title = %self.title, "Sending progress end failed");
                }
            }
            None => {
                if let Err(e) = self.tracker.client.show_message(MessageType::INFO, message).await {
                    warn!(error = %e, title = %self.title, "Sending progress message failed");
                }
            }
        }
    }

    /// Tripped when the client cancels the work.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The `$/progress` token, if the client supports work-done progress.
    #[must_use]
    pub fn token(&self) -> Option<&ProgressToken> {
        self.token.as_ref()
    }
}

impl Drop for WorkHandle {
    fn drop(&mut self) {
        if let Some(NumberOrString::String(id)) = &self.token {
            self.tracker.lock().remove(id);
        }
    }
}
