//! The core's [`Client`] transport over a tower-lsp connection.
//!
//! The core addresses messages by method name with JSON parameters; tower-lsp
//! only sends typed messages. [`LspClient`] decodes the parameters into the
//! type the method names and forwards them.

use async_trait::async_trait;
use keel::client::Client;
use keel::{Error, Result};
use lsp_types::notification::{LogMessage, Notification, Progress, PublishDiagnostics, ShowMessage};
use lsp_types::request::{RegisterCapability, Request, UnregisterCapability, WorkDoneProgressCreate};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tracing::trace;

/// Forwards core messages to the editor.
///
/// The adapter exists before the connection does, so the core can be built
/// (and fail) before tower-lsp hands out its client. Sends fail until
/// [`bind`](Self::bind) and after [`Client::close`].
#[derive(Default)]
pub struct LspClient {
    inner: OnceLock<tower_lsp::Client>,
    closed: AtomicBool,
}

impl std::fmt::Debug for LspClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspClient")
            .field("bound", &self.inner.get().is_some())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

fn decode<T: serde::de::DeserializeOwned>(method: &str, params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| Error::Internal(format!("{method} parameters do not match the protocol: {e}")))
}

impl LspClient {
    /// An adapter with no connection yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the connection. Only the first call has an effect.
    pub fn bind(&self, client: tower_lsp::Client) {
        if self.inner.set(client).is_err() {
            trace!("Client already bound");
        }
    }

    fn connection(&self) -> Result<&tower_lsp::Client> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transient("connection closed".to_string()));
        }
        self.inner
            .get()
            .ok_or_else(|| Error::Transient("connection not established".to_string()))
    }
}

#[async_trait]
impl Client for LspClient {
    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let client = self.connection()?;
        match method {
            PublishDiagnostics::METHOD => {
                client
                    .send_notification::<PublishDiagnostics>(decode(method, params)?)
                    .await;
            }
            ShowMessage::METHOD => {
                client.send_notification::<ShowMessage>(decode(method, params)?).await;
            }
            LogMessage::METHOD => {
                client.send_notification::<LogMessage>(decode(method, params)?).await;
            }
            Progress::METHOD => {
                client.send_notification::<Progress>(decode(method, params)?).await;
            }
            other => return Err(Error::Internal(format!("unsupported notification {other}"))),
        }
        Ok(())
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let client = self.connection()?;
        let sent = match method {
            WorkDoneProgressCreate::METHOD => {
                client
                    .send_request::<WorkDoneProgressCreate>(decode(method, params)?)
                    .await
            }
            RegisterCapability::METHOD => {
                client
                    .send_request::<RegisterCapability>(decode(method, params)?)
                    .await
            }
            UnregisterCapability::METHOD => {
                client
                    .send_request::<UnregisterCapability>(decode(method, params)?)
                    .await
            }
            other => return Err(Error::Internal(format!("unsupported request {other}"))),
        };
        sent.map(|()| Value::Null)
            .map_err(|e| Error::Transient(format!("{method}: {e}")))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_fail_before_bind() {
        let client = LspClient::new();
        let err = client.notify(ShowMessage::METHOD, Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
    }

    #[tokio::test]
    async fn sends_fail_after_close() {
        let client = LspClient::new();
        client.close().await;
        let err = client.request(RegisterCapability::METHOD, Value::Null).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn mismatched_parameters_are_internal_errors() {
        let err = decode::<lsp_types::ShowMessageParams>(ShowMessage::METHOD, Value::Null).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
