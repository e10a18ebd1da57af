//! Downstream collaborators fed by the message router.
//!
//! The conversation log and the follow-up scheduler live outside the core;
//! the router only talks to them through these traits.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::store::{DeliveryStatus, MessageRecord, MessageRole, PersistenceGateway};

/// One line of a conversation, as handed to the logging collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub role: MessageRole,
    pub text: String,
    pub contact_id: String,
    pub display_name: String,
    pub is_group: bool,
    pub agent_id: String,
    /// Transport message id.
    pub message_id: String,
    pub status: Option<DeliveryStatus>,
    pub at: DateTime<Utc>,
}

/// Sink for routed and sent messages.
#[async_trait]
pub trait ConversationLog: Send + Sync {
    async fn record(&self, entry: LogEntry) -> Result<(), DatabaseError>;
}

/// Follow-up scheduler, notified whenever a contact writes in.
#[async_trait]
pub trait FollowUpScheduler: Send + Sync {
    /// Drop any pending follow-up for the contact.
    async fn cancel_for_contact(&self, contact_id: &str);
}

/// Conversation log backed by the `messages` table.
pub struct StoreConversationLog {
    store: Arc<dyn PersistenceGateway>,
}

impl StoreConversationLog {
    pub fn new(store: Arc<dyn PersistenceGateway>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ConversationLog for StoreConversationLog {
    async fn record(&self, entry: LogEntry) -> Result<(), DatabaseError> {
        tracing::debug!(
            agent_id = %entry.agent_id,
            contact_id = %entry.contact_id,
            role = entry.role.as_str(),
            "Logging message"
        );
        self.store
            .insert_message(&MessageRecord {
                id: entry.message_id,
                agent_id: entry.agent_id,
                contact_id: entry.contact_id,
                role: entry.role,
                text: entry.text,
                display_name: entry.display_name,
                is_group: entry.is_group,
                status: entry.status,
                created_at: entry.at,
            })
            .await
    }
}

/// Follow-up scheduler used when no scheduler service is deployed.
pub struct LoggingFollowUps;

#[async_trait]
impl FollowUpScheduler for LoggingFollowUps {
    async fn cancel_for_contact(&self, contact_id: &str) {
        tracing::debug!(contact_id = %contact_id, "No follow-up scheduler configured, nothing to cancel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_store_log_writes_message_row() {
        let store = Arc::new(MemoryStore::new());
        let log = StoreConversationLog::new(store.clone());

        log.record(LogEntry {
            role: MessageRole::Client,
            text: "hola".to_string(),
            contact_id: "5551".to_string(),
            display_name: "Ana".to_string(),
            is_group: false,
            agent_id: "a1".to_string(),
            message_id: "m1".to_string(),
            status: None,
            at: Utc::now(),
        })
        .await
        .unwrap();

        let messages = store.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].display_name, "Ana");
        assert_eq!(messages[0].role, MessageRole::Client);
    }
}
