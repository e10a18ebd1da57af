//! Persistence gateway.
//!
//! Narrow interface over the `instances`, `assignments` and `messages`
//! tables. The in-memory registry stays authoritative at runtime; this is
//! the durable copy it is rebuilt from at process start.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::instance::InstanceStatus;

/// Durable state of an agent's instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub agent_id: String,
    pub display_name: String,
    pub status: InstanceStatus,
    pub qr_payload: Option<String>,
    pub phone_number: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Binding of a contact to the agent that owns the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub contact_id: String,
    pub agent_id: String,
    pub is_group: bool,
    pub group_name: Option<String>,
    pub last_message_at: DateTime<Utc>,
}

/// Who authored a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// The end-user contact.
    Client,
    /// A human support agent.
    Agent,
    /// The AI layer.
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::Client => "client",
            MessageRole::Agent => "agent",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(MessageRole::Client),
            "agent" => Ok(MessageRole::Agent),
            "assistant" => Ok(MessageRole::Assistant),
            _ => Err(format!("unknown message role '{}'", s)),
        }
    }
}

/// Delivery status of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    /// Map a transport ack code. Only 2, 3 and 4 are meaningful.
    pub fn from_ack(code: i32) -> Option<Self> {
        match code {
            2 => Some(DeliveryStatus::Sent),
            3 => Some(DeliveryStatus::Delivered),
            4 => Some(DeliveryStatus::Read),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "read" => Ok(DeliveryStatus::Read),
            _ => Err(format!("unknown delivery status '{}'", s)),
        }
    }
}

/// A logged conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Transport message id.
    pub id: String,
    pub agent_id: String,
    pub contact_id: String,
    pub role: MessageRole,
    pub text: String,
    pub display_name: String,
    pub is_group: bool,
    /// Only outbound messages carry a delivery status.
    pub status: Option<DeliveryStatus>,
    pub created_at: DateTime<Utc>,
}

/// Storage operations the core depends on.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    // --- Instances ---

    async fn get_instance(&self, agent_id: &str) -> Result<Option<InstanceRecord>, DatabaseError>;

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, DatabaseError>;

    /// Insert or overwrite the agent's row.
    async fn save_instance(&self, record: &InstanceRecord) -> Result<(), DatabaseError>;

    // --- Assignments ---

    async fn get_assignment(
        &self,
        contact_id: &str,
    ) -> Result<Option<AssignmentRecord>, DatabaseError>;

    /// Claim a contact. Returns false if another row already exists for it.
    async fn insert_assignment(&self, record: &AssignmentRecord) -> Result<bool, DatabaseError>;

    /// Bump `last_message_at` if the contact is still bound to `agent_id`.
    async fn touch_assignment(
        &self,
        contact_id: &str,
        agent_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Bind the contact to `agent_id` whoever holds it now, in one atomic
    /// step. Creates the row if the contact was unassigned. Returns the
    /// previous owner.
    async fn reassign_assignment(
        &self,
        contact_id: &str,
        agent_id: &str,
        is_group: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<String>, DatabaseError>;

    /// The agent's contacts, most recently active first.
    async fn list_assignments_for_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<AssignmentRecord>, DatabaseError>;

    // --- Messages ---

    async fn insert_message(&self, record: &MessageRecord) -> Result<(), DatabaseError>;

    /// Returns whether an outbound message with that id was logged by
    /// `agent_id`.
    async fn update_message_status(
        &self,
        agent_id: &str,
        message_id: &str,
        status: DeliveryStatus,
    ) -> Result<bool, DatabaseError>;
}
