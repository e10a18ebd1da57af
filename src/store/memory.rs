//! In-memory persistence gateway for tests and development runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::DatabaseError;
use crate::store::{
    AssignmentRecord, DeliveryStatus, InstanceRecord, MessageRecord, PersistenceGateway,
};

/// Volatile store backed by hash maps.
#[derive(Default)]
pub struct MemoryStore {
    instances: RwLock<HashMap<String, InstanceRecord>>,
    assignments: RwLock<HashMap<String, AssignmentRecord>>,
    messages: RwLock<Vec<MessageRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All logged messages, oldest first.
    pub async fn messages(&self) -> Vec<MessageRecord> {
        self.messages.read().await.clone()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn get_instance(&self, agent_id: &str) -> Result<Option<InstanceRecord>, DatabaseError> {
        Ok(self.instances.read().await.get(agent_id).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, DatabaseError> {
        let mut records: Vec<InstanceRecord> =
            self.instances.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(records)
    }

    async fn save_instance(&self, record: &InstanceRecord) -> Result<(), DatabaseError> {
        self.instances
            .write()
            .await
            .insert(record.agent_id.clone(), record.clone());
        Ok(())
    }

    async fn get_assignment(
        &self,
        contact_id: &str,
    ) -> Result<Option<AssignmentRecord>, DatabaseError> {
        Ok(self.assignments.read().await.get(contact_id).cloned())
    }

    async fn insert_assignment(&self, record: &AssignmentRecord) -> Result<bool, DatabaseError> {
        let mut assignments = self.assignments.write().await;
        if assignments.contains_key(&record.contact_id) {
            return Ok(false);
        }
        assignments.insert(record.contact_id.clone(), record.clone());
        Ok(true)
    }

    async fn touch_assignment(
        &self,
        contact_id: &str,
        agent_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut assignments = self.assignments.write().await;
        match assignments.get_mut(contact_id) {
            Some(a) if a.agent_id == agent_id => {
                a.last_message_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reassign_assignment(
        &self,
        contact_id: &str,
        agent_id: &str,
        is_group: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<String>, DatabaseError> {
        let mut assignments = self.assignments.write().await;
        match assignments.get_mut(contact_id) {
            Some(current) => {
                let previous = std::mem::replace(&mut current.agent_id, agent_id.to_string());
                current.last_message_at = at;
                Ok(Some(previous))
            }
            None => {
                assignments.insert(
                    contact_id.to_string(),
                    AssignmentRecord {
                        contact_id: contact_id.to_string(),
                        agent_id: agent_id.to_string(),
                        is_group,
                        group_name: None,
                        last_message_at: at,
                    },
                );
                Ok(None)
            }
        }
    }

    async fn list_assignments_for_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<AssignmentRecord>, DatabaseError> {
        let mut records: Vec<AssignmentRecord> = self
            .assignments
            .read()
            .await
            .values()
            .filter(|a| a.agent_id == agent_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(records)
    }

    async fn insert_message(&self, record: &MessageRecord) -> Result<(), DatabaseError> {
        self.messages.write().await.push(record.clone());
        Ok(())
    }

    async fn update_message_status(
        &self,
        agent_id: &str,
        message_id: &str,
        status: DeliveryStatus,
    ) -> Result<bool, DatabaseError> {
        let mut messages = self.messages.write().await;
        let mut found = false;
        // Inbound messages carry no delivery status and are never updated.
        for message in messages
            .iter_mut()
            .filter(|m| m.id == message_id && m.agent_id == agent_id && m.status.is_some())
        {
            message.status = Some(status);
            found = true;
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MessageRole;

    fn assignment(contact: &str, agent: &str) -> AssignmentRecord {
        AssignmentRecord {
            contact_id: contact.to_string(),
            agent_id: agent.to_string(),
            is_group: false,
            group_name: None,
            last_message_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_first_insert_wins() {
        let store = MemoryStore::new();
        assert!(store.insert_assignment(&assignment("5551", "a")).await.unwrap());
        assert!(!store.insert_assignment(&assignment("5551", "b")).await.unwrap());
        let current = store.get_assignment("5551").await.unwrap().unwrap();
        assert_eq!(current.agent_id, "a");
    }

    #[tokio::test]
    async fn test_touch_only_for_owner() {
        let store = MemoryStore::new();
        store.insert_assignment(&assignment("5551", "a")).await.unwrap();
        let later = Utc::now() + chrono::TimeDelta::seconds(30);

        assert!(!store.touch_assignment("5551", "b", later).await.unwrap());
        assert!(store.touch_assignment("5551", "a", later).await.unwrap());
        let current = store.get_assignment("5551").await.unwrap().unwrap();
        assert_eq!(current.last_message_at, later);
    }

    #[tokio::test]
    async fn test_update_message_status() {
        let store = MemoryStore::new();
        store
            .insert_message(&MessageRecord {
                id: "m1".to_string(),
                agent_id: "a".to_string(),
                contact_id: "5551".to_string(),
                role: MessageRole::Agent,
                text: "hi".to_string(),
                display_name: "5551".to_string(),
                is_group: false,
                status: Some(DeliveryStatus::Pending),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(store.update_message_status("a", "m1", DeliveryStatus::Read).await.unwrap());
        assert!(!store.update_message_status("a", "nope", DeliveryStatus::Read).await.unwrap());
        assert_eq!(store.messages().await[0].status, Some(DeliveryStatus::Read));
    }

    #[tokio::test]
    async fn test_update_message_status_is_per_agent() {
        let store = MemoryStore::new();
        for agent in ["a", "b"] {
            store
                .insert_message(&MessageRecord {
                    id: "m1".to_string(),
                    agent_id: agent.to_string(),
                    contact_id: "5551".to_string(),
                    role: MessageRole::Agent,
                    text: "hi".to_string(),
                    display_name: "5551".to_string(),
                    is_group: false,
                    status: Some(DeliveryStatus::Pending),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        assert!(store.update_message_status("b", "m1", DeliveryStatus::Delivered).await.unwrap());

        let statuses: Vec<(String, Option<DeliveryStatus>)> = store
            .messages()
            .await
            .into_iter()
            .map(|m| (m.agent_id, m.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("a".to_string(), Some(DeliveryStatus::Pending)),
                ("b".to_string(), Some(DeliveryStatus::Delivered)),
            ]
        );
    }

    #[tokio::test]
    async fn test_reassign_replaces_owner_in_place() {
        let store = MemoryStore::new();
        let mut group = assignment("1203@g.us", "a");
        group.is_group = true;
        group.group_name = Some("Support".to_string());
        store.insert_assignment(&group).await.unwrap();

        let previous = store
            .reassign_assignment("1203@g.us", "b", true, Utc::now())
            .await
            .unwrap();

        assert_eq!(previous.as_deref(), Some("a"));
        let current = store.get_assignment("1203@g.us").await.unwrap().unwrap();
        assert_eq!(current.agent_id, "b");
        assert_eq!(current.group_name.as_deref(), Some("Support"));
    }

    #[tokio::test]
    async fn test_reassign_unassigned_contact() {
        let store = MemoryStore::new();

        let previous = store
            .reassign_assignment("5551", "b", false, Utc::now())
            .await
            .unwrap();

        assert_eq!(previous, None);
        assert_eq!(store.get_assignment("5551").await.unwrap().unwrap().agent_id, "b");
        assert!(!store.insert_assignment(&assignment("5551", "c")).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_assignments_for_agent() {
        let store = MemoryStore::new();
        let mut older = assignment("5551", "a");
        older.last_message_at = Utc::now() - chrono::TimeDelta::minutes(5);
        store.insert_assignment(&older).await.unwrap();
        store.insert_assignment(&assignment("5552", "a")).await.unwrap();
        store.insert_assignment(&assignment("5553", "b")).await.unwrap();

        let contacts: Vec<String> = store
            .list_assignments_for_agent("a")
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.contact_id)
            .collect();
        assert_eq!(contacts, vec!["5552", "5551"]);
    }
}
