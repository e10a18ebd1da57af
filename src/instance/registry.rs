//! In-memory registry of agent instances.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::instance::{Instance, InstanceStatus};

/// Partial update applied by [`InstanceRegistry::upsert`].
///
/// `None` leaves the field untouched. Nullable fields use a nested option:
/// `Some(None)` clears them.
#[derive(Debug, Clone, Default)]
pub struct InstancePatch {
    pub status: Option<InstanceStatus>,
    pub qr_payload: Option<Option<String>>,
    pub phone_number: Option<Option<String>>,
    pub reconnect_attempts: Option<u32>,
    pub qr_regeneration_attempts: Option<u32>,
    pub is_reconnecting: Option<bool>,
    pub has_been_connected: Option<bool>,
    pub first_qr_generated: Option<bool>,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl InstancePatch {
    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn qr_payload(mut self, qr: Option<String>) -> Self {
        self.qr_payload = Some(qr);
        self
    }

    pub fn phone_number(mut self, phone: Option<String>) -> Self {
        self.phone_number = Some(phone);
        self
    }

    pub fn reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = Some(attempts);
        self
    }

    pub fn reconnecting(mut self, reconnecting: bool) -> Self {
        self.is_reconnecting = Some(reconnecting);
        self
    }

    fn apply(self, instance: &mut Instance) {
        if let Some(v) = self.status {
            instance.status = v;
        }
        if let Some(v) = self.qr_payload {
            instance.qr_payload = v;
        }
        if let Some(v) = self.phone_number {
            instance.phone_number = v;
        }
        if let Some(v) = self.reconnect_attempts {
            instance.reconnect_attempts = v;
        }
        if let Some(v) = self.qr_regeneration_attempts {
            instance.qr_regeneration_attempts = v;
        }
        if let Some(v) = self.is_reconnecting {
            instance.is_reconnecting = v;
        }
        if let Some(v) = self.has_been_connected {
            instance.has_been_connected = v;
        }
        if let Some(v) = self.first_qr_generated {
            instance.first_qr_generated = v;
        }
        if let Some(v) = self.last_connected_at {
            instance.last_connected_at = Some(v);
        }
    }
}

/// Which agents have a live or attempted session right now.
///
/// Pure in-memory structure; callers serialize access.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: HashMap<String, Instance>,
    order: Vec<String>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, agent_id: &str) -> Option<&Instance> {
        self.instances.get(agent_id)
    }

    pub fn get_mut(&mut self, agent_id: &str) -> Option<&mut Instance> {
        self.instances.get_mut(agent_id)
    }

    /// Snapshot of all instances in insertion order.
    pub fn list(&self) -> Vec<Instance> {
        self.order
            .iter()
            .filter_map(|id| self.instances.get(id))
            .cloned()
            .collect()
    }

    /// Insert a whole instance, replacing any entry for the same agent.
    pub fn insert(&mut self, instance: Instance) {
        let agent_id = instance.agent_id.clone();
        if self.instances.insert(agent_id.clone(), instance).is_none() {
            self.order.push(agent_id);
        }
    }

    /// Merge `patch` into the agent's entry, creating a default entry first
    /// if none exists. Returns the updated instance.
    pub fn upsert(&mut self, agent_id: &str, patch: InstancePatch) -> &Instance {
        let order = &mut self.order;
        let instance = self
            .instances
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                order.push(agent_id.to_string());
                Instance::new(agent_id, String::new())
            });
        patch.apply(instance);
        instance
    }

    pub fn remove(&mut self, agent_id: &str) -> Option<Instance> {
        let removed = self.instances.remove(agent_id);
        if removed.is_some() {
            self.order.retain(|id| id != agent_id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
