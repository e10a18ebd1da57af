//! Reconnection policy for dropped sessions.
//!
//! The manager reports every dropped session, and every reconnection the
//! start rate limit turned away, as a [`ReconnectEvent`]. The coordinator
//! decides whether the agent gets another attempt and, if so, has the
//! manager schedule it with backoff.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::instance::{Instance, SessionManager};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectEvent {
    /// A session client reported its session gone.
    Disconnected {
        agent_id: String,
        reason: Option<String>,
    },
    /// A scheduled attempt found the start window full. The attempt is
    /// retried, not spent.
    RateLimited { agent_id: String },
}

/// Consumes reconnection events and schedules the attempts.
pub struct ReconnectCoordinator {
    manager: SessionManager,
    events: mpsc::UnboundedReceiver<ReconnectEvent>,
}

impl ReconnectCoordinator {
    /// Attach to the manager's event stream. Returns `None` if another
    /// coordinator already took it.
    pub async fn new(manager: SessionManager) -> Option<Self> {
        let events = manager.take_reconnect_events().await?;
        Some(Self { manager, events })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.handle(event).await;
        }
    }

    /// Returns whether a reconnection was scheduled.
    pub async fn handle(&self, event: ReconnectEvent) -> bool {
        match event {
            ReconnectEvent::Disconnected { agent_id, reason } => {
                let scheduled = self.manager.begin_reconnect(&agent_id).await;
                if !scheduled {
                    tracing::debug!(
                        agent_id = %agent_id,
                        reason = ?reason,
                        "No reconnection scheduled"
                    );
                }
                scheduled
            }
            ReconnectEvent::RateLimited { agent_id } => {
                let scheduled = self.manager.defer_reconnect(&agent_id).await;
                if !scheduled {
                    tracing::debug!(agent_id = %agent_id, "Deferred reconnection dropped");
                }
                scheduled
            }
        }
    }
}

/// Next attempt number for an instance, or `None` if it should stay down.
///
/// Only sessions that have connected at least once are retried, and never
/// more than `max_reconnect_attempts` times in a row.
pub(crate) fn plan_reconnect(instance: &Instance) -> Option<u32> {
    if !instance.has_been_connected {
        tracing::debug!(agent_id = %instance.agent_id, "Session never connected, not reconnecting");
        return None;
    }
    if instance.is_connected() || instance.is_reconnecting || instance.is_starting {
        return None;
    }
    if !instance.reconnect_attempts_left() {
        tracing::warn!(
            agent_id = %instance.agent_id,
            attempts = instance.reconnect_attempts,
            "Reconnection attempts exhausted"
        );
        return None;
    }
    Some(instance.reconnect_attempts + 1)
}

/// Body of a scheduled reconnection.
pub(crate) async fn run_reconnect(manager: SessionManager, agent_id: String, attempt: u32) {
    tracing::info!(agent_id = %agent_id, attempt, "Attempting reconnection");
    match manager.reconnect(&agent_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            tracing::info!(agent_id = %agent_id, attempt, "Reconnection deferred by start rate limit");
            manager.notify(ReconnectEvent::RateLimited { agent_id });
        }
        Err(e) => {
            tracing::warn!(agent_id = %agent_id, attempt, error = %e, "Reconnection abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dropped(attempts: u32) -> Instance {
        let mut instance = Instance::new("a1", "Ana");
        instance.has_been_connected = true;
        instance.reconnect_attempts = attempts;
        instance
    }

    #[test]
    fn test_plan_next_attempt() {
        assert_eq!(plan_reconnect(&dropped(0)), Some(1));
        assert_eq!(plan_reconnect(&dropped(2)), Some(3));
    }

    #[test]
    fn test_plan_stops_at_max_attempts() {
        assert_eq!(plan_reconnect(&dropped(3)), None);
    }

    #[test]
    fn test_plan_skips_never_connected() {
        let mut instance = dropped(0);
        instance.has_been_connected = false;
        assert_eq!(plan_reconnect(&instance), None);
    }

    #[test]
    fn test_plan_skips_in_flight() {
        let mut instance = dropped(1);
        instance.is_reconnecting = true;
        assert_eq!(plan_reconnect(&instance), None);

        let mut instance = dropped(1);
        instance.is_starting = true;
        assert_eq!(plan_reconnect(&instance), None);
    }
}
