//! Session client abstraction.
//!
//! A session client is one live WhatsApp Web connection, hosted by an
//! external browser-automation process. The core only sees the
//! [`SessionClient`] handle and the ordered stream of [`SessionEvent`]s the
//! client pushes into the sender it was created with.

mod bridge;

pub use bridge::{BridgeClient, BridgeClientFactory};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::ClientError;

/// Connection state changes reported by a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ClientStatus {
    /// Restored a saved session without a QR scan.
    LoggedIn {
        #[serde(default)]
        phone_number: Option<String>,
    },
    /// The QR code was scanned and the session is up.
    QrConfirmed {
        #[serde(default)]
        phone_number: Option<String>,
    },
    SessionClosed {
        #[serde(default)]
        reason: Option<String>,
    },
    DeviceDisconnected {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Kind of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    #[serde(alias = "chat")]
    Text,
    Image,
    Video,
    Audio,
    #[serde(alias = "ptt")]
    Voice,
    Document,
    Sticker,
    Location,
    #[serde(alias = "vcard")]
    Contact,
    #[serde(other)]
    Other,
}

/// A message received by a session client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    /// Chat address the message arrived on (`<number>@c.us`, `<id>@g.us`, ...).
    pub from: String,
    /// Sender within a group chat.
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub profile_name: Option<String>,
    /// Group subject, for group chats.
    #[serde(default)]
    pub chat_name: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn text(id: impl Into<String>, from: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            author: None,
            from_me: false,
            kind: MessageKind::Text,
            body: body.into(),
            caption: None,
            push_name: None,
            profile_name: None,
            chat_name: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_push_name(mut self, name: impl Into<String>) -> Self {
        self.push_name = Some(name.into());
        self
    }
}

/// Events pushed by a session client, in emission order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Qr { qr: String },
    Status(ClientStatus),
    Message(InboundMessage),
    Ack { message_id: String, ack: i32 },
}

/// Sender side of a client's event stream.
pub type EventSender = mpsc::Sender<SessionEvent>;

/// Media attachment for an outbound message.
#[derive(Debug, Clone)]
pub struct OutboundMedia {
    pub path: PathBuf,
    pub caption: Option<String>,
    pub mime_type: String,
}

/// Handle to one live session.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Credential namespace this client was created under.
    fn session_name(&self) -> &str;

    /// Send a text message. Returns the transport message id.
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<String, ClientError>;

    /// Send a media message. Returns the transport message id.
    async fn send_media(&self, chat_id: &str, media: &OutboundMedia)
    -> Result<String, ClientError>;

    /// Log the device out of WhatsApp.
    async fn logout(&self) -> Result<(), ClientError>;

    /// Tear down the connection. Must tolerate an already-dead session.
    async fn close(&self) -> Result<(), ClientError>;
}

/// Creates session clients and owns their credential storage.
#[async_trait]
pub trait SessionClientFactory: Send + Sync {
    /// Create and start a client bound to `session_name`'s credentials.
    async fn create(
        &self,
        session_name: &str,
        events: EventSender,
    ) -> Result<Arc<dyn SessionClient>, ClientError>;

    /// Remove stored credentials for `session_name`. Absent storage is not an error.
    async fn clear_credentials(&self, session_name: &str) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_qr_event() {
        let event: SessionEvent = serde_json::from_str(r#"{"type":"qr","qr":"2@abc"}"#).unwrap();
        assert_eq!(event, SessionEvent::Qr { qr: "2@abc".to_string() });
    }

    #[test]
    fn test_parse_status_events() {
        let event: SessionEvent = serde_json::from_str(
            r#"{"type":"status","state":"qr_confirmed","phone_number":"5511999"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            SessionEvent::Status(ClientStatus::QrConfirmed {
                phone_number: Some("5511999".to_string())
            })
        );

        let event: SessionEvent =
            serde_json::from_str(r#"{"type":"status","state":"device_disconnected"}"#).unwrap();
        assert_eq!(
            event,
            SessionEvent::Status(ClientStatus::DeviceDisconnected { reason: None })
        );

        let event: SessionEvent =
            serde_json::from_str(r#"{"type":"status","state":"loading_screen"}"#).unwrap();
        assert_eq!(event, SessionEvent::Status(ClientStatus::Unknown));
    }

    #[test]
    fn test_parse_message_event_with_aliases() {
        let event: SessionEvent = serde_json::from_str(
            r#"{"type":"message","id":"m1","from":"5551@c.us","kind":"ptt","push_name":"Ana"}"#,
        )
        .unwrap();
        let SessionEvent::Message(msg) = event else {
            panic!("expected message event");
        };
        assert_eq!(msg.kind, MessageKind::Voice);
        assert_eq!(msg.push_name.as_deref(), Some("Ana"));
        assert!(msg.body.is_empty());
        assert!(!msg.from_me);
    }

    #[test]
    fn test_unknown_message_kind() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"id":"m1","from":"5551@c.us","kind":"poll_creation"}"#)
                .unwrap();
        assert_eq!(msg.kind, MessageKind::Other);
    }

    #[test]
    fn test_parse_ack_event() {
        let event: SessionEvent =
            serde_json::from_str(r#"{"type":"ack","message_id":"m9","ack":3}"#).unwrap();
        assert_eq!(
            event,
            SessionEvent::Ack {
                message_id: "m9".to_string(),
                ack: 3
            }
        );
    }
}
