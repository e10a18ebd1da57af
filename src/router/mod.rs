//! Inbound message routing and contact assignment.
//!
//! Every message a session client receives passes through
//! [`MessageRouter::route_message`]: transport-level filtering, content
//! extraction, first-claim assignment of the contact to an agent, logging and
//! follow-up cancellation. The first agent whose session sees a contact owns
//! it until an explicit [`MessageRouter::reassign`].

pub mod address;
pub mod content;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::client::InboundMessage;
use crate::config::RouterConfig;
use crate::conversation::{ConversationLog, FollowUpScheduler, LogEntry};
use crate::error::{DatabaseError, InstanceError};
use crate::store::{AssignmentRecord, DeliveryStatus, MessageRole, PersistenceGateway};

use self::address::AddressKind;

/// Why a message was not routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discard {
    SelfSent,
    Broadcast,
    Status,
    GroupsDisabled,
    EmptyContent,
    /// The contact belongs to a different agent.
    AssignedElsewhere { owner: String },
    /// The assignment could not be read or written.
    AssignmentUnavailable,
}

/// A message accepted into an agent's conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedMessage {
    pub agent_id: String,
    pub contact_id: String,
    pub display_name: String,
    pub text: String,
    pub is_group: bool,
    pub message_id: String,
    /// Whether this message created the assignment.
    pub claimed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Routed(RoutedMessage),
    Discarded(Discard),
}

/// Routes inbound traffic from all sessions.
pub struct MessageRouter {
    config: RouterConfig,
    store: Arc<dyn PersistenceGateway>,
    log: Arc<dyn ConversationLog>,
    follow_ups: Arc<dyn FollowUpScheduler>,
}

enum Claim {
    Owned { claimed: bool },
    Elsewhere(String),
}

impl MessageRouter {
    pub fn new(
        config: RouterConfig,
        store: Arc<dyn PersistenceGateway>,
        log: Arc<dyn ConversationLog>,
        follow_ups: Arc<dyn FollowUpScheduler>,
    ) -> Self {
        Self {
            config,
            store,
            log,
            follow_ups,
        }
    }

    /// Route one message received by `agent_id`'s session.
    pub async fn route_message(&self, agent_id: &str, msg: &InboundMessage) -> RouteOutcome {
        if msg.from_me {
            return discard(agent_id, msg, Discard::SelfSent);
        }

        let is_group = match address::classify(&msg.from) {
            AddressKind::Status => return discard(agent_id, msg, Discard::Status),
            AddressKind::Broadcast => return discard(agent_id, msg, Discard::Broadcast),
            AddressKind::Group if !self.config.allow_groups => {
                return discard(agent_id, msg, Discard::GroupsDisabled);
            }
            AddressKind::Group => true,
            AddressKind::Individual => false,
        };

        let contact_id = address::contact_id(&msg.from);
        let sender = match (is_group, msg.author.as_deref()) {
            (true, Some(author)) => address::contact_id(author),
            _ => contact_id.clone(),
        };
        let display_name = content::display_name(msg, &sender);

        let text = content::extract_text(msg);
        if text.trim().is_empty() {
            return discard(agent_id, msg, Discard::EmptyContent);
        }

        let group_name = if is_group { msg.chat_name.clone() } else { None };
        let claimed = match self
            .claim(agent_id, &contact_id, is_group, group_name, msg.timestamp)
            .await
        {
            Ok(Claim::Owned { claimed }) => claimed,
            Ok(Claim::Elsewhere(owner)) => {
                return discard(agent_id, msg, Discard::AssignedElsewhere { owner });
            }
            Err(e) => {
                tracing::warn!(
                    agent_id = %agent_id,
                    contact_id = %contact_id,
                    error = %e,
                    "Assignment lookup failed, dropping message"
                );
                return RouteOutcome::Discarded(Discard::AssignmentUnavailable);
            }
        };

        if claimed {
            tracing::info!(agent_id = %agent_id, contact_id = %contact_id, "Contact assigned");
        }

        let entry = LogEntry {
            role: MessageRole::Client,
            text: text.clone(),
            contact_id: contact_id.clone(),
            display_name: display_name.clone(),
            is_group,
            agent_id: agent_id.to_string(),
            message_id: msg.id.clone(),
            status: None,
            at: msg.timestamp,
        };
        if let Err(e) = self.log.record(entry).await {
            tracing::warn!(
                agent_id = %agent_id,
                message_id = %msg.id,
                error = %e,
                "Failed to log inbound message"
            );
        }

        self.follow_ups.cancel_for_contact(&contact_id).await;

        RouteOutcome::Routed(RoutedMessage {
            agent_id: agent_id.to_string(),
            contact_id,
            display_name,
            text,
            is_group,
            message_id: msg.id.clone(),
            claimed,
        })
    }

    /// Apply a delivery ack to the logged outbound message. Returns the new
    /// status, or `None` for codes that carry no delivery meaning.
    pub async fn route_ack(
        &self,
        agent_id: &str,
        message_id: &str,
        code: i32,
    ) -> Option<DeliveryStatus> {
        let Some(status) = DeliveryStatus::from_ack(code) else {
            tracing::debug!(agent_id = %agent_id, message_id = %message_id, code, "Ignoring ack");
            return None;
        };

        match self
            .store
            .update_message_status(agent_id, message_id, status)
            .await
        {
            Ok(true) => {
                tracing::debug!(
                    agent_id = %agent_id,
                    message_id = %message_id,
                    status = status.as_str(),
                    "Delivery status updated"
                );
            }
            Ok(false) => {
                tracing::debug!(agent_id = %agent_id, message_id = %message_id, "Ack for unknown message");
            }
            Err(e) => {
                tracing::warn!(
                    agent_id = %agent_id,
                    message_id = %message_id,
                    error = %e,
                    "Failed to update delivery status"
                );
            }
        }
        Some(status)
    }

    /// Claim `contact_id` for an outbound message from `agent_id`.
    pub async fn claim_for_outbound(
        &self,
        agent_id: &str,
        contact_id: &str,
        is_group: bool,
    ) -> Result<(), InstanceError> {
        match self
            .claim(agent_id, contact_id, is_group, None, Utc::now())
            .await?
        {
            Claim::Owned { .. } => Ok(()),
            Claim::Elsewhere(_) => Err(InstanceError::ContactAssignedElsewhere {
                contact_id: contact_id.to_string(),
            }),
        }
    }

    /// Log a message sent by an agent, pending delivery.
    pub async fn log_outbound(
        &self,
        agent_id: &str,
        contact_id: &str,
        is_group: bool,
        message_id: &str,
        text: &str,
    ) {
        let entry = LogEntry {
            role: MessageRole::Agent,
            text: text.to_string(),
            contact_id: contact_id.to_string(),
            display_name: contact_id.to_string(),
            is_group,
            agent_id: agent_id.to_string(),
            message_id: message_id.to_string(),
            status: Some(DeliveryStatus::Pending),
            at: Utc::now(),
        };
        if let Err(e) = self.log.record(entry).await {
            tracing::warn!(
                agent_id = %agent_id,
                message_id = %message_id,
                error = %e,
                "Failed to log outbound message"
            );
        }
    }

    /// Move `contact_id` to `agent_id`. Returns the previous owner.
    ///
    /// The only path that changes an existing owner.
    pub async fn reassign(
        &self,
        contact_id: &str,
        agent_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let is_group = address::classify(contact_id) == AddressKind::Group;
        let previous = self
            .store
            .reassign_assignment(contact_id, agent_id, is_group, Utc::now())
            .await?;

        tracing::info!(
            contact_id = %contact_id,
            agent_id = %agent_id,
            previous = ?previous,
            "Contact reassigned"
        );
        Ok(previous)
    }

    async fn claim(
        &self,
        agent_id: &str,
        contact_id: &str,
        is_group: bool,
        group_name: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Claim, DatabaseError> {
        if let Some(current) = self.store.get_assignment(contact_id).await? {
            return self.owned_or_elsewhere(agent_id, contact_id, current, at).await;
        }

        let record = AssignmentRecord {
            contact_id: contact_id.to_string(),
            agent_id: agent_id.to_string(),
            is_group,
            group_name,
            last_message_at: at,
        };
        if self.store.insert_assignment(&record).await? {
            return Ok(Claim::Owned { claimed: true });
        }

        // Lost the insert race; whoever won owns the contact.
        match self.store.get_assignment(contact_id).await? {
            Some(current) => self.owned_or_elsewhere(agent_id, contact_id, current, at).await,
            None => Err(DatabaseError::Query(format!(
                "assignment for {} vanished during claim",
                contact_id
            ))),
        }
    }

    async fn owned_or_elsewhere(
        &self,
        agent_id: &str,
        contact_id: &str,
        current: AssignmentRecord,
        at: DateTime<Utc>,
    ) -> Result<Claim, DatabaseError> {
        if current.agent_id != agent_id {
            return Ok(Claim::Elsewhere(current.agent_id));
        }
        self.store.touch_assignment(contact_id, agent_id, at).await?;
        Ok(Claim::Owned { claimed: false })
    }
}

fn discard(agent_id: &str, msg: &InboundMessage, reason: Discard) -> RouteOutcome {
    tracing::debug!(
        agent_id = %agent_id,
        from = %msg.from,
        message_id = %msg.id,
        reason = ?reason,
        "Discarding inbound message"
    );
    RouteOutcome::Discarded(reason)
}
