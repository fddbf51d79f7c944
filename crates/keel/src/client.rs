//! The transport back to the editor.
//!
//! The core never talks JSON-RPC itself. It sends notifications and requests
//! through a [`Client`], which the protocol front end implements on top of its
//! connection and tests implement with [`RecordingClient`].

use crate::error::Result;
use async_trait::async_trait;
use lsp_types::notification::{Notification, Progress, PublishDiagnostics, ShowMessage};
use lsp_types::request::{RegisterCapability, Request, UnregisterCapability, WorkDoneProgressCreate};
use lsp_types::{
    MessageType, ProgressParams, ProgressParamsValue, ProgressToken, PublishDiagnosticsParams,
    Registration, RegistrationParams, ShowMessageParams, Unregistration, UnregistrationParams,
    WorkDoneProgress, WorkDoneProgressCreateParams,
};
use serde_json::Value;

/// Outgoing side of the editor connection.
#[async_trait]
pub trait Client: Send + Sync {
    /// Send a notification.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transient` if the message could not be delivered.
    async fn notify(&self, method: &str, params: Value) -> Result<()>;

    /// Send a request and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transient` if the client answered with an error or the
    /// connection failed.
    async fn request(&self, method: &str, params: Value) -> Result<Value>;

    /// Close the connection. Further sends fail.
    async fn close(&self) {}
}

impl dyn Client {
    /// Send `textDocument/publishDiagnostics`.
    ///
    /// # Errors
    ///
    /// Fails if the notification cannot be delivered.
    pub async fn publish_diagnostics(&self, params: PublishDiagnosticsParams) -> Result<()> {
        self.notify(PublishDiagnostics::METHOD, serde_json::to_value(params)?)
            .await
    }

    /// Send `window/showMessage`.
    ///
    /// # Errors
    ///
    /// Fails if the notification cannot be delivered.
    pub async fn show_message(&self, typ: MessageType, message: impl Into<String>) -> Result<()> {
        let params = ShowMessageParams {
            typ,
            message: message.into(),
        };
        self.notify(ShowMessage::METHOD, serde_json::to_value(params)?)
            .await
    }

    /// Send `$/progress` for a work-done token.
    ///
    /// # Errors
    ///
    /// Fails if the notification cannot be delivered.
    pub async fn progress(&self, token: ProgressToken, value: WorkDoneProgress) -> Result<()> {
        let params = ProgressParams {
            token,
            value: ProgressParamsValue::WorkDone(value),
        };
        self.notify(Progress::METHOD, serde_json::to_value(params)?)
            .await
    }

    /// Request `window/workDoneProgress/create`.
    ///
    /// # Errors
    ///
    /// Fails if the client rejects the token.
    pub async fn create_work_done_progress(&self, token: ProgressToken) -> Result<()> {
        let params = WorkDoneProgressCreateParams { token };
        self.request(WorkDoneProgressCreate::METHOD, serde_json::to_value(params)?)
            .await
            .map(drop)
    }

    /// Request `client/registerCapability`.
    ///
    /// # Errors
    ///
    /// Fails if the client rejects the registration.
    pub async fn register_capability(&self, registrations: Vec<Registration>) -> Result<()> {
        let params = RegistrationParams { registrations };
        self.request(RegisterCapability::METHOD, serde_json::to_value(params)?)
            .await
            .map(drop)
    }

    /// Request `client/unregisterCapability`.
    ///
    /// # Errors
    ///
    /// Fails if the client rejects the unregistration.
    pub async fn unregister_capability(&self, unregisterations: Vec<Unregistration>) -> Result<()> {
        let params = UnregistrationParams { unregisterations };
        self.request(UnregisterCapability::METHOD, serde_json::to_value(params)?)
            .await
            .map(drop)
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use recording::{Message, MessageKind, RecordingClient};

#[cfg(any(test, feature = "test-util"))]
mod recording {
    use super::{Client, Notification, PublishDiagnostics, Result};
    use crate::error::Error;
    use async_trait::async_trait;
    use lsp_types::{PublishDiagnosticsParams, Url};
    use serde_json::Value;
    use std::collections::HashSet;
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::Instant;

    /// Whether a recorded message was a notification or a request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MessageKind {
        /// A notification.
        Notification,
        /// A request.
        Request,
    }

    /// A message sent to the [`RecordingClient`].
    #[derive(Debug, Clone)]
    pub struct Message {
        /// Notification or request.
        pub kind: MessageKind,
        /// LSP method name.
        pub method: String,
        /// Parameters as sent.
        pub params: Value,
        /// When the message was sent.
        pub at: Instant,
    }

    /// A [`Client`] that records everything it is sent.
    ///
    /// Requests succeed with `null` unless their method was marked failing
    /// with [`fail_method`](Self::fail_method).
    #[derive(Debug, Default)]
    pub struct RecordingClient {
        messages: Mutex<Vec<Message>>,
        failing: Mutex<HashSet<String>>,
        changed: Notify,
    }

    impl RecordingClient {
        /// Create an empty recorder.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every request (or notification) for `method` fail.
        pub fn fail_method(&self, method: &str) {
            self.failing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(method.to_string());
        }

        /// Every message so far, in send order.
        #[must_use]
        pub fn messages(&self) -> Vec<Message> {
            self.messages
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Messages for one method.
        #[must_use]
        pub fn messages_for(&self, method: &str) -> Vec<Message> {
            self.messages()
                .into_iter()
                .filter(|m| m.method == method)
                .collect()
        }

        /// Every `publishDiagnostics` notification, decoded.
        #[must_use]
        pub fn all_published(&self) -> Vec<PublishDiagnosticsParams> {
            self.messages_for(PublishDiagnostics::METHOD)
                .into_iter()
                .filter_map(|m| serde_json::from_value(m.params).ok())
                .collect()
        }

        /// `publishDiagnostics` notifications for one URI.
        #[must_use]
        pub fn published(&self, uri: &Url) -> Vec<PublishDiagnosticsParams> {
            self.all_published()
                .into_iter()
                .filter(|p| &p.uri == uri)
                .collect()
        }

        /// Forget everything recorded so far.
        pub fn clear(&self) {
            self.messages
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }

        /// Wait until at least `count` messages for `method` were recorded.
        ///
        /// Returns `false` if `timeout` elapsed first.
        pub async fn wait_for(&self, method: &str, count: usize, timeout: Duration) -> bool {
            let wait = async {
                loop {
                    let notified = self.changed.notified();
                    if self.messages_for(method).len() >= count {
                        return;
                    }
                    notified.await;
                }
            };
            tokio::time::timeout(timeout, wait).await.is_ok()
        }

        fn record(&self, kind: MessageKind, method: &str, params: Value) -> Result<()> {
            self.messages
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Message {
                    kind,
                    method: method.to_string(),
                    params,
                    at: Instant::now(),
                });
            self.changed.notify_waiters();
            if self
                .failing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(method)
            {
                return Err(Error::Transient(format!("{method} rejected by client")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Client for RecordingClient {
        async fn notify(&self, method: &str, params: Value) -> Result<()> {
            self.record(MessageKind::Notification, method, params)
        }

        async fn request(&self, method: &str, params: Value) -> Result<Value> {
            self.record(MessageKind::Request, method, params)
                .map(|()| Value::Null)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn helpers_send_typed_params() {
        let recorder = Arc::new(RecordingClient::new());
        let client: Arc<dyn Client> = recorder.clone();

        client
            .show_message(MessageType::WARNING, "careful")
            .await
            .unwrap();
        client
            .create_work_done_progress(ProgressToken::String("t".into()))
            .await
            .unwrap();

        let messages = recorder.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].method, "window/showMessage");
        assert_eq!(messages[0].kind, MessageKind::Notification);
        assert_eq!(messages[0].params["message"], "careful");
        assert_eq!(messages[1].method, "window/workDoneProgress/create");
        assert_eq!(messages[1].kind, MessageKind::Request);
    }

    #[tokio::test]
    async fn failing_methods_report_errors() {
        let recorder = Arc::new(RecordingClient::new());
        recorder.fail_method(RegisterCapability::METHOD);
        let client: Arc<dyn Client> = recorder.clone();
        assert!(client.register_capability(vec![]).await.is_err());
        assert_eq!(recorder.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_times_out() {
        let recorder = RecordingClient::new();
        assert!(!recorder.wait_for("x", 1, Duration::from_millis(50)).await);
    }
}
