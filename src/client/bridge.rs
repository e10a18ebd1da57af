//! Session clients hosted by the browser-automation bridge.
//!
//! The bridge is a sidecar process running one headless WhatsApp Web page per
//! session. It speaks plain HTTP:
//!
//! ```text
//! GET  /sessions/{name}/events    NDJSON stream of SessionEvent
//! POST /sessions/{name}/start     launch (or restore) the session
//! POST /sessions/{name}/messages  {"chat_id", "text"}            -> {"message_id"}
//! POST /sessions/{name}/media     {"chat_id", "path", "caption", "mime_type"} -> {"message_id"}
//! POST /sessions/{name}/logout
//! POST /sessions/{name}/close
//! ```
//!
//! Credentials are kept by the bridge under `<auth_dir>/session-{name}`, a
//! directory shared with this process so it can be wiped on logout.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::client::{
    ClientStatus, EventSender, OutboundMedia, SessionClient, SessionClientFactory, SessionEvent,
};
use crate::config::BridgeConfig;
use crate::error::ClientError;

/// Creates [`BridgeClient`]s against one bridge endpoint.
pub struct BridgeClientFactory {
    http: Client,
    config: BridgeConfig,
}

impl BridgeClientFactory {
    pub fn new(config: BridgeConfig) -> Self {
        let http = Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { http, config }
    }

    /// Directory holding the credentials of `session_name`.
    pub fn credential_dir(&self, session_name: &str) -> PathBuf {
        self.config
            .auth_dir
            .join(format!("session-{}", session_name))
    }
}

fn session_url(base_url: &str, session_name: &str, action: &str) -> String {
    format!(
        "{}/sessions/{}/{}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(session_name),
        action
    )
}

#[async_trait]
impl SessionClientFactory for BridgeClientFactory {
    async fn create(
        &self,
        session_name: &str,
        events: EventSender,
    ) -> Result<Arc<dyn SessionClient>, ClientError> {
        let creation_failed = |reason: String| ClientError::CreationFailed {
            session: session_name.to_string(),
            reason,
        };

        // Subscribe before starting so the first QR is not missed.
        let stream = self
            .http
            .get(session_url(&self.config.base_url, session_name, "events"))
            .send()
            .await
            .map_err(|e| creation_failed(format!("event stream: {}", e)))?;
        if !stream.status().is_success() {
            return Err(creation_failed(format!(
                "event stream returned HTTP {}",
                stream.status()
            )));
        }

        let closed = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(pump_events(
            session_name.to_string(),
            stream,
            events,
            Arc::clone(&closed),
        ));

        let response = self
            .http
            .post(session_url(&self.config.base_url, session_name, "start"))
            .timeout(self.config.request_timeout)
            .send()
            .await;
        let failure = match response {
            Ok(r) if r.status().is_success() => None,
            Ok(r) => {
                let status = r.status();
                let body = r.text().await.unwrap_or_default();
                Some(format!("HTTP {}: {}", status, body))
            }
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            closed.store(true, Ordering::SeqCst);
            pump.abort();
            return Err(creation_failed(reason));
        }

        tracing::debug!(session = %session_name, "Bridge session started");

        Ok(Arc::new(BridgeClient {
            session_name: session_name.to_string(),
            base_url: self.config.base_url.clone(),
            http: self.http.clone(),
            request_timeout: self.config.request_timeout,
            closed,
            pump,
        }))
    }

    async fn clear_credentials(&self, session_name: &str) -> Result<(), ClientError> {
        let path = self.credential_dir(session_name);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                tracing::info!(path = %path.display(), "Cleared session credentials");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ClientError::CredentialClear { path, source }),
        }
    }
}

/// Read the NDJSON event stream and forward parsed events in order.
async fn pump_events(
    session_name: String,
    response: reqwest::Response,
    events: EventSender,
    closed: Arc<AtomicBool>,
) {
    let mut body = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut end_reason = "event stream ended".to_string();

    'read: while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                end_reason = format!("event stream error: {}", e);
                break;
            }
        };
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionEvent>(line) {
                Ok(event) => {
                    if events.send(event).await.is_err() {
                        // Receiver gone: the instance was torn down.
                        break 'read;
                    }
                }
                Err(e) => {
                    tracing::warn!(session = %session_name, "Unparseable bridge event: {}", e);
                }
            }
        }
    }

    if !closed.load(Ordering::SeqCst) {
        tracing::warn!(session = %session_name, "{}", end_reason);
        let _ = events
            .send(SessionEvent::Status(ClientStatus::SessionClosed {
                reason: Some(end_reason),
            }))
            .await;
    }
}

/// A session hosted by the bridge.
pub struct BridgeClient {
    session_name: String,
    base_url: String,
    http: Client,
    request_timeout: std::time::Duration,
    closed: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

#[derive(Serialize)]
struct SendTextRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Serialize)]
struct SendMediaRequest<'a> {
    chat_id: &'a str,
    path: String,
    caption: Option<&'a str>,
    mime_type: &'a str,
}

#[derive(Deserialize)]
struct SendResponse {
    message_id: String,
}

impl BridgeClient {
    fn url(&self, action: &str) -> String {
        session_url(&self.base_url, &self.session_name, action)
    }

    fn request_failed(&self, reason: impl Into<String>) -> ClientError {
        ClientError::RequestFailed {
            session: self.session_name.clone(),
            reason: reason.into(),
        }
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed {
                session: self.session_name.clone(),
            });
        }
        Ok(())
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        action: &str,
        body: Option<&T>,
    ) -> Result<reqwest::Response, ClientError> {
        let mut request = self.http.post(self.url(action)).timeout(self.request_timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.request_failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.request_failed(format!("{} returned HTTP {}: {}", action, status, text)));
        }
        Ok(response)
    }

    async fn message_id(&self, response: reqwest::Response) -> Result<String, ClientError> {
        response
            .json::<SendResponse>()
            .await
            .map(|r| r.message_id)
            .map_err(|e| ClientError::InvalidResponse {
                session: self.session_name.clone(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl SessionClient for BridgeClient {
    fn session_name(&self) -> &str {
        &self.session_name
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<String, ClientError> {
        self.ensure_open()?;
        let response = self
            .post("messages", Some(&SendTextRequest { chat_id, text }))
            .await?;
        self.message_id(response).await
    }

    async fn send_media(
        &self,
        chat_id: &str,
        media: &OutboundMedia,
    ) -> Result<String, ClientError> {
        self.ensure_open()?;
        let body = SendMediaRequest {
            chat_id,
            path: media.path.display().to_string(),
            caption: media.caption.as_deref(),
            mime_type: &media.mime_type,
        };
        let response = self.post("media", Some(&body)).await?;
        self.message_id(response).await
    }

    async fn logout(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.post::<()>("logout", None).await.map(|_| ())
    }

    async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pump.abort();
        self.post::<()>("close", None).await.map(|_| ())
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory(auth_dir: PathBuf) -> BridgeClientFactory {
        BridgeClientFactory::new(BridgeConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            auth_dir,
            request_timeout: std::time::Duration::from_millis(200),
        })
    }

    #[test]
    fn test_session_url_encodes_name() {
        assert_eq!(
            session_url("http://bridge:3100/", "user_a b", "events"),
            "http://bridge:3100/sessions/user_a%20b/events"
        );
    }

    #[tokio::test]
    async fn test_clear_credentials_removes_session_dir() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path().to_path_buf());

        let session_dir = factory.credential_dir("user_42");
        tokio::fs::create_dir_all(session_dir.join("Default"))
            .await
            .unwrap();
        tokio::fs::write(session_dir.join("Default").join("Cookies"), b"x")
            .await
            .unwrap();

        factory.clear_credentials("user_42").await.unwrap();
        assert!(!session_dir.exists());
    }

    #[tokio::test]
    async fn test_clear_credentials_missing_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path().to_path_buf());
        assert!(factory.clear_credentials("user_never").await.is_ok());
    }

    #[tokio::test]
    async fn test_clear_credentials_on_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path().to_path_buf());
        // A plain file where the directory should be cannot be removed as a tree.
        tokio::fs::write(factory.credential_dir("user_7"), b"not a dir")
            .await
            .unwrap();

        let err = factory.clear_credentials("user_7").await.unwrap_err();
        assert!(matches!(err, ClientError::CredentialClear { .. }));
    }

    #[tokio::test]
    async fn test_create_fails_when_bridge_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path().to_path_buf());
        let (tx, _rx) = tokio::sync::mpsc::channel(8);

        let err = match factory.create("user_1", tx).await {
            Ok(_) => panic!("expected creation failure"),
            Err(e) => e,
        };
        assert!(matches!(err, ClientError::CreationFailed { .. }));
    }
}
