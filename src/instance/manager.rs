//! Instance lifecycle controller.
//!
//! [`SessionManager`] is the only owner of session clients. All registry
//! mutations, the rate window and the client table sit behind one async
//! mutex; client creation and teardown happen outside it, guarded by the
//! entry's `is_starting` flag and a per-client generation number so events
//! from a replaced client are never applied to its successor.
//!
//! Lock order: manager state, then the scheduler's task table.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::client::{
    ClientStatus, InboundMessage, OutboundMedia, SessionClient, SessionClientFactory, SessionEvent,
};
use crate::config::ManagerConfig;
use crate::error::{DatabaseError, InstanceError};
use crate::instance::coordinator::{self, ReconnectEvent};
use crate::instance::{
    Instance, InstancePatch, InstanceRegistry, InstanceStatus, PendingReconnect, RateWindow,
    ReconnectScheduler,
};
use crate::router::{MessageRouter, address};
use crate::store::{InstanceRecord, PersistenceGateway};

const EVENT_BUFFER: usize = 256;

/// Credential namespace for an agent's session.
pub fn session_name(agent_id: &str) -> String {
    format!("user_{}", agent_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
    /// User or restore initiated.
    Fresh,
    /// Fired by a scheduled reconnection; carries counters over.
    Reconnect,
}

struct ClientSlot {
    generation: u64,
    client: Arc<dyn SessionClient>,
    /// Whether this client has reported a connected session.
    connected: bool,
}

struct ManagerState {
    registry: InstanceRegistry,
    rate: RateWindow,
    clients: HashMap<String, ClientSlot>,
    next_generation: u64,
}

impl ManagerState {
    /// The agent's entry, if it still belongs to `generation`.
    fn current(&self, agent_id: &str, generation: u64) -> Option<&Instance> {
        self.registry
            .get(agent_id)
            .filter(|i| i.generation == generation)
    }
}

enum PersistOp {
    Save(InstanceRecord),
    Flush(oneshot::Sender<()>),
}

struct Inner {
    config: ManagerConfig,
    state: Mutex<ManagerState>,
    scheduler: ReconnectScheduler,
    factory: Arc<dyn SessionClientFactory>,
    store: Arc<dyn PersistenceGateway>,
    router: MessageRouter,
    persist_tx: mpsc::UnboundedSender<PersistOp>,
    events_tx: mpsc::UnboundedSender<ReconnectEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ReconnectEvent>>>,
}

/// Owns every agent's session client and drives its lifecycle.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create the manager and its persistence writer. Must be called inside
    /// a Tokio runtime.
    pub fn new(
        config: ManagerConfig,
        factory: Arc<dyn SessionClientFactory>,
        store: Arc<dyn PersistenceGateway>,
        router: MessageRouter,
    ) -> Self {
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_persistence(Arc::clone(&store), persist_rx));

        let state = ManagerState {
            registry: InstanceRegistry::new(),
            rate: RateWindow::new(config.max_starts_per_window, config.rate_window),
            clients: HashMap::new(),
            next_generation: 1,
        };

        Self {
            inner: Arc::new(Inner {
                scheduler: ReconnectScheduler::new(&config),
                config,
                state: Mutex::new(state),
                factory,
                store,
                router,
                persist_tx,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    /// Start (or return) the agent's instance.
    ///
    /// Returns `Ok(None)` when the global start rate is exhausted; nothing is
    /// created in that case.
    pub async fn start_instance(
        &self,
        agent_id: &str,
        display_name: &str,
    ) -> Result<Option<Instance>, InstanceError> {
        self.start_with(agent_id, display_name, StartMode::Fresh).await
    }

    /// Restart a dropped session on behalf of a scheduled reconnection.
    pub(crate) async fn reconnect(&self, agent_id: &str) -> Result<Option<Instance>, InstanceError> {
        self.start_with(agent_id, "", StartMode::Reconnect).await
    }

    async fn start_with(
        &self,
        agent_id: &str,
        display_name: &str,
        mode: StartMode,
    ) -> Result<Option<Instance>, InstanceError> {
        let (instance, stale) = {
            let mut state = self.inner.state.lock().await;

            if mode == StartMode::Reconnect {
                match state.registry.get(agent_id) {
                    Some(i) if i.is_reconnecting && !i.is_starting => {}
                    _ => {
                        return Err(InstanceError::NotFound {
                            agent_id: agent_id.to_string(),
                        });
                    }
                }
            }

            if !state.rate.try_acquire() {
                let retry_after = state.rate.retry_after();
                tracing::warn!(
                    agent_id = %agent_id,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Instance start rate limit reached"
                );
                if mode == StartMode::Reconnect {
                    state
                        .registry
                        .upsert(agent_id, InstancePatch::default().reconnecting(false));
                }
                return Ok(None);
            }

            let existing = state.registry.get(agent_id).cloned();
            if mode == StartMode::Fresh {
                if let Some(existing) = &existing {
                    if existing.is_connected() || existing.is_starting || existing.is_reconnecting {
                        tracing::debug!(
                            agent_id = %agent_id,
                            status = %existing.status,
                            "Instance already active"
                        );
                        return Ok(Some(existing.clone()));
                    }
                }
                if self.inner.scheduler.is_scheduled(agent_id).await {
                    if let Some(existing) = &existing {
                        return Ok(Some(existing.clone()));
                    }
                    // Pending restart after logout; this start supersedes it.
                    self.inner.scheduler.cancel(agent_id).await;
                }
            }

            let generation = state.next_generation;
            state.next_generation += 1;

            let mut instance = Instance::new(agent_id, display_name);
            instance.max_reconnect_attempts = self.inner.config.max_reconnect_attempts;
            instance.max_qr_regenerations = self.inner.config.max_qr_regenerations;
            instance.is_starting = true;
            instance.generation = generation;
            if let (StartMode::Reconnect, Some(previous)) = (mode, &existing) {
                instance.display_name = previous.display_name.clone();
                instance.phone_number = previous.phone_number.clone();
                instance.last_connected_at = previous.last_connected_at;
                instance.reconnect_attempts = previous.reconnect_attempts;
                instance.has_been_connected = previous.has_been_connected;
                instance.is_reconnecting = true;
            }

            state.registry.insert(instance.clone());
            self.persist(record_of(&instance));
            (instance, state.clients.remove(agent_id))
        };

        if let Some(slot) = stale {
            tracing::debug!(agent_id = %agent_id, "Closing stale session client");
            close_quietly(agent_id, slot.client.as_ref()).await;
        }

        let generation = instance.generation;
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let created = self
            .inner
            .factory
            .create(&session_name(agent_id), events_tx)
            .await;

        let mut state = self.inner.state.lock().await;
        let still_ours = state.current(agent_id, generation).is_some();

        match created {
            Ok(client) if still_ours => {
                state.clients.insert(
                    agent_id.to_string(),
                    ClientSlot {
                        generation,
                        client,
                        connected: false,
                    },
                );
                let snapshot = state.registry.get_mut(agent_id).map(|i| {
                    i.is_starting = false;
                    i.clone()
                });
                drop(state);

                tokio::spawn(self.clone().pump_events(agent_id.to_string(), generation, events_rx));
                self.spawn_connect_watchdog(agent_id.to_string(), generation);

                tracing::info!(
                    agent_id = %agent_id,
                    session = %session_name(agent_id),
                    reconnect = mode == StartMode::Reconnect,
                    "Instance started"
                );
                Ok(snapshot)
            }
            Ok(client) => {
                drop(state);
                tracing::warn!(agent_id = %agent_id, "Instance removed while its client was starting");
                close_quietly(agent_id, client.as_ref()).await;
                Err(InstanceError::NotFound {
                    agent_id: agent_id.to_string(),
                })
            }
            Err(e) => {
                if still_ours {
                    if let Some(instance) = state.registry.remove(agent_id) {
                        self.persist(disconnected_record(&instance));
                    }
                }
                drop(state);

                tracing::error!(agent_id = %agent_id, error = %e, "Failed to create session client");
                Err(e.into())
            }
        }
    }

    /// Stop the agent's instance. Returns whether one was running.
    pub async fn stop_instance(&self, agent_id: &str) -> bool {
        // Cancel first so no reconnection fires against the removed entry.
        self.inner.scheduler.cancel(agent_id).await;

        let (removed, slot) = {
            let mut state = self.inner.state.lock().await;
            let removed = state.registry.remove(agent_id);
            if let Some(instance) = &removed {
                self.persist(disconnected_record(instance));
            }
            (removed.is_some(), state.clients.remove(agent_id))
        };

        if let Some(slot) = &slot {
            close_quietly(agent_id, slot.client.as_ref()).await;
        }
        if !removed {
            return slot.is_some();
        }

        tracing::info!(agent_id = %agent_id, "Instance stopped");
        true
    }

    /// Log the agent's device out, wipe its credentials and restart the
    /// instance shortly after so a fresh QR is shown.
    pub async fn logout_instance(&self, agent_id: &str) -> Result<(), InstanceError> {
        self.inner.scheduler.cancel(agent_id).await;

        let (instance, slot) = {
            let mut state = self.inner.state.lock().await;
            (
                state.registry.remove(agent_id),
                state.clients.remove(agent_id),
            )
        };

        let stored = match &instance {
            Some(_) => None,
            None => self.inner.store.get_instance(agent_id).await?,
        };
        let (display_name, last_connected_at) = match (&instance, &stored) {
            (Some(i), _) => (i.display_name.clone(), i.last_connected_at),
            (None, Some(r)) => (r.display_name.clone(), r.last_connected_at),
            (None, None) => {
                return Err(InstanceError::NotFound {
                    agent_id: agent_id.to_string(),
                });
            }
        };

        if let Some(slot) = &slot {
            if let Err(e) = slot.client.logout().await {
                tracing::warn!(agent_id = %agent_id, error = %e, "Logout request failed");
            }
            close_quietly(agent_id, slot.client.as_ref()).await;
        }

        self.inner
            .factory
            .clear_credentials(&session_name(agent_id))
            .await
            .map_err(|source| InstanceError::CredentialsNotCleared {
                agent_id: agent_id.to_string(),
                source,
            })?;

        {
            let state = self.inner.state.lock().await;
            // A start that raced in owns the row now.
            if state.registry.get(agent_id).is_none() {
                self.persist(InstanceRecord {
                    agent_id: agent_id.to_string(),
                    display_name: display_name.clone(),
                    status: InstanceStatus::Disconnected,
                    qr_payload: None,
                    phone_number: None,
                    last_connected_at,
                    updated_at: Utc::now(),
                });
            }
        }

        let manager = self.clone();
        let agent = agent_id.to_string();
        self.inner
            .scheduler
            .schedule_after(
                agent_id,
                0,
                self.inner.config.logout_restart_delay,
                move || async move {
                    match manager.start_instance(&agent, &display_name).await {
                        Ok(Some(_)) => {
                            tracing::info!(agent_id = %agent, "Instance restarted after logout")
                        }
                        Ok(None) => {
                            tracing::warn!(agent_id = %agent, "Restart after logout was rate limited")
                        }
                        Err(e) => {
                            tracing::warn!(agent_id = %agent, error = %e, "Restart after logout failed")
                        }
                    }
                },
            )
            .await;

        tracing::info!(agent_id = %agent_id, "Instance logged out");
        Ok(())
    }

    pub async fn get_instance(&self, agent_id: &str) -> Option<Instance> {
        self.inner.state.lock().await.registry.get(agent_id).cloned()
    }

    /// Snapshot of every instance, in the order they were first started.
    pub async fn list_instances(&self) -> Vec<Instance> {
        self.inner.state.lock().await.registry.list()
    }

    pub async fn pending_reconnect(&self, agent_id: &str) -> Option<PendingReconnect> {
        self.inner.scheduler.pending(agent_id).await
    }

    /// Send a text message from the agent's session. Returns the transport id.
    pub async fn send_message(
        &self,
        agent_id: &str,
        contact: &str,
        text: &str,
    ) -> Result<String, InstanceError> {
        let client = self.connected_client(agent_id).await?;
        let chat_id = address::chat_id(contact);
        let contact_id = address::contact_id(&chat_id);
        let is_group = address::classify(&chat_id) == address::AddressKind::Group;

        self.inner
            .router
            .claim_for_outbound(agent_id, &contact_id, is_group)
            .await?;
        let message_id = client.send_text(&chat_id, text).await?;
        self.inner
            .router
            .log_outbound(agent_id, &contact_id, is_group, &message_id, text)
            .await;

        tracing::debug!(agent_id = %agent_id, contact_id = %contact_id, message_id = %message_id, "Message sent");
        Ok(message_id)
    }

    /// Send a file from the agent's session. The MIME type is guessed from
    /// the file name when not given.
    pub async fn send_media(
        &self,
        agent_id: &str,
        contact: &str,
        path: &Path,
        caption: Option<&str>,
        mime_type: Option<&str>,
    ) -> Result<String, InstanceError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| InstanceError::Media {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if !metadata.is_file() {
            return Err(InstanceError::Media {
                path: path.to_path_buf(),
                reason: "not a regular file".to_string(),
            });
        }

        let client = self.connected_client(agent_id).await?;
        let chat_id = address::chat_id(contact);
        let contact_id = address::contact_id(&chat_id);
        let is_group = address::classify(&chat_id) == address::AddressKind::Group;

        let media = OutboundMedia {
            path: path.to_path_buf(),
            caption: caption.map(String::from),
            mime_type: match mime_type {
                Some(m) => m.to_string(),
                None => mime_guess::from_path(path)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string(),
            },
        };

        self.inner
            .router
            .claim_for_outbound(agent_id, &contact_id, is_group)
            .await?;
        let message_id = client.send_media(&chat_id, &media).await?;

        let text = match caption.map(str::trim).filter(|c| !c.is_empty()) {
            Some(c) => c.to_string(),
            None => format!(
                "[{}]",
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| media.mime_type.clone())
            ),
        };
        self.inner
            .router
            .log_outbound(agent_id, &contact_id, is_group, &message_id, &text)
            .await;

        tracing::debug!(
            agent_id = %agent_id,
            contact_id = %contact_id,
            mime_type = %media.mime_type,
            "Media sent"
        );
        Ok(message_id)
    }

    async fn connected_client(&self, agent_id: &str) -> Result<Arc<dyn SessionClient>, InstanceError> {
        let state = self.inner.state.lock().await;
        let instance = state
            .registry
            .get(agent_id)
            .ok_or_else(|| InstanceError::NotFound {
                agent_id: agent_id.to_string(),
            })?;
        if !instance.is_connected() {
            return Err(InstanceError::NotConnected {
                agent_id: agent_id.to_string(),
            });
        }
        state
            .clients
            .get(agent_id)
            .map(|slot| Arc::clone(&slot.client))
            .ok_or_else(|| InstanceError::NotConnected {
                agent_id: agent_id.to_string(),
            })
    }

    /// Bring back the sessions that were connected when the process last ran.
    ///
    /// Rows stuck in `qr_ready` are reset, since their QR died with the old
    /// process. Rate-limited restarts wait for the window to reopen.
    pub async fn restore_from_store(&self) -> Result<usize, DatabaseError> {
        let records = self.inner.store.list_instances().await?;
        let mut to_restore = Vec::new();

        for record in records {
            match record.status {
                InstanceStatus::Connected => to_restore.push(record),
                InstanceStatus::QrReady => {
                    let state = self.inner.state.lock().await;
                    if state.registry.get(&record.agent_id).is_none() {
                        tracing::debug!(agent_id = %record.agent_id, "Resetting stale QR state");
                        self.persist(InstanceRecord {
                            status: InstanceStatus::Disconnected,
                            qr_payload: None,
                            updated_at: Utc::now(),
                            ..record
                        });
                    }
                }
                InstanceStatus::Disconnected => {}
            }
        }

        let mut restored = 0;
        for record in to_restore {
            loop {
                match self
                    .start_instance(&record.agent_id, &record.display_name)
                    .await
                {
                    Ok(Some(_)) => {
                        restored += 1;
                        break;
                    }
                    Ok(None) => {
                        let wait = self.inner.state.lock().await.rate.retry_after();
                        tracing::info!(
                            agent_id = %record.agent_id,
                            wait_ms = wait.as_millis() as u64,
                            "Restore paused by start rate limit"
                        );
                        tokio::time::sleep(wait).await;
                    }
                    Err(e) => {
                        tracing::warn!(agent_id = %record.agent_id, error = %e, "Failed to restore instance");
                        break;
                    }
                }
            }
        }

        tracing::info!(restored, "Restored instances from store");
        Ok(restored)
    }

    /// Cancel all timers and close every client. Stored statuses are left as
    /// they are so the next process restores the same sessions.
    pub async fn shutdown(&self) {
        let cancelled = self.inner.scheduler.cancel_all().await;
        let slots: Vec<(String, ClientSlot)> = {
            let mut state = self.inner.state.lock().await;
            state.registry = InstanceRegistry::new();
            state.clients.drain().collect()
        };

        let closed = slots.len();
        for (agent_id, slot) in slots {
            close_quietly(&agent_id, slot.client.as_ref()).await;
        }
        self.flush().await;

        tracing::info!(closed, cancelled, "Session manager shut down");
    }

    /// Wait until every queued state write has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.persist_tx.send(PersistOp::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Hand out the reconnection event stream. Only the first caller gets it.
    pub async fn take_reconnect_events(&self) -> Option<mpsc::UnboundedReceiver<ReconnectEvent>> {
        self.inner.events_rx.lock().await.take()
    }

    pub(crate) fn notify(&self, event: ReconnectEvent) {
        if self.inner.events_tx.send(event).is_err() {
            tracing::debug!("No reconnect coordinator listening");
        }
    }

    /// Mark the agent as reconnecting and schedule the next attempt, if the
    /// reconnection policy allows one. Returns whether a task was scheduled.
    pub(crate) async fn begin_reconnect(&self, agent_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(instance) = state.registry.get(agent_id) else {
            return false;
        };
        let Some(attempt) = coordinator::plan_reconnect(instance) else {
            return false;
        };
        if self.inner.scheduler.is_scheduled(agent_id).await {
            return false;
        }

        state.registry.upsert(
            agent_id,
            InstancePatch::default()
                .reconnect_attempts(attempt)
                .reconnecting(true),
        );

        let manager = self.clone();
        let agent = agent_id.to_string();
        self.inner
            .scheduler
            .schedule(agent_id, attempt, move || {
                coordinator::run_reconnect(manager, agent, attempt)
            })
            .await
    }

    /// Re-arm a reconnection that the start rate limit turned away. The
    /// attempt number is kept and the task fires no earlier than the window
    /// reopens. Returns whether a task was scheduled.
    pub(crate) async fn defer_reconnect(&self, agent_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        let attempt = match state.registry.get(agent_id) {
            Some(i) if !(i.is_connected() || i.is_starting || i.is_reconnecting) => {
                i.reconnect_attempts.max(1)
            }
            _ => return false,
        };
        if self.inner.scheduler.is_scheduled(agent_id).await {
            return false;
        }

        let delay = self
            .inner
            .scheduler
            .backoff_delay(attempt)
            .max(state.rate.retry_after());
        state
            .registry
            .upsert(agent_id, InstancePatch::default().reconnecting(true));

        let manager = self.clone();
        let agent = agent_id.to_string();
        self.inner
            .scheduler
            .schedule_after(agent_id, attempt, delay, move || {
                coordinator::run_reconnect(manager, agent, attempt)
            })
            .await
    }

    /// Queue a write. Call with the state lock held so queue order matches
    /// transition order.
    fn persist(&self, record: InstanceRecord) {
        if self.inner.persist_tx.send(PersistOp::Save(record)).is_err() {
            tracing::warn!("Persistence writer stopped, dropping instance update");
        }
    }

    fn spawn_connect_watchdog(&self, agent_id: String, generation: u64) {
        let manager = self.clone();
        let timeout = self.inner.config.connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            manager.expire_unconnected(&agent_id, generation).await;
        });
    }

    async fn expire_unconnected(&self, agent_id: &str, generation: u64) {
        let slot = {
            let mut state = self.inner.state.lock().await;
            match state.clients.get(agent_id) {
                Some(slot) if slot.generation == generation && !slot.connected => {}
                _ => return,
            }
            self.detach(&mut state, agent_id)
        };

        tracing::warn!(
            agent_id = %agent_id,
            timeout_secs = self.inner.config.connect_timeout.as_secs(),
            "Session did not connect in time, closing"
        );
        if let Some(slot) = slot {
            close_quietly(agent_id, slot.client.as_ref()).await;
        }
    }

    /// Unbind the agent's client, mark the entry disconnected and queue the
    /// write. The caller closes the returned client after releasing the lock.
    fn detach(&self, state: &mut ManagerState, agent_id: &str) -> Option<ClientSlot> {
        let slot = state.clients.remove(agent_id);
        if state.registry.get(agent_id).is_some() {
            let patch = InstancePatch::default()
                .status(InstanceStatus::Disconnected)
                .qr_payload(None)
                .reconnecting(false);
            self.persist(record_of(state.registry.upsert(agent_id, patch)));
        }
        slot
    }

    async fn pump_events(
        self,
        agent_id: String,
        generation: u64,
        mut events: mpsc::Receiver<SessionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Qr { qr } => self.on_qr(&agent_id, generation, qr).await,
                SessionEvent::Status(status) => self.on_status(&agent_id, generation, status).await,
                SessionEvent::Message(msg) => self.on_message(&agent_id, generation, msg).await,
                SessionEvent::Ack { message_id, ack } => {
                    self.on_ack(&agent_id, generation, &message_id, ack).await
                }
            }
        }
        tracing::debug!(agent_id = %agent_id, generation, "Session event stream ended");
    }

    async fn on_qr(&self, agent_id: &str, generation: u64, qr: String) {
        let mut state = self.inner.state.lock().await;
        let Some(instance) = state.current(agent_id, generation) else {
            tracing::debug!(agent_id = %agent_id, generation, "Ignoring QR from replaced client");
            return;
        };

        let mut patch = InstancePatch::default();
        if instance.first_qr_generated {
            let regenerations = instance.qr_regeneration_attempts + 1;
            if regenerations > instance.max_qr_regenerations {
                let slot = self.detach(&mut state, agent_id);
                drop(state);
                tracing::warn!(
                    agent_id = %agent_id,
                    regenerations,
                    "QR regeneration limit reached, closing session"
                );
                if let Some(slot) = slot {
                    close_quietly(agent_id, slot.client.as_ref()).await;
                }
                return;
            }
            patch.qr_regeneration_attempts = Some(regenerations);
        } else {
            patch.first_qr_generated = Some(true);
        }

        self.persist(record_of(state.registry.upsert(
            agent_id,
            patch.status(InstanceStatus::QrReady).qr_payload(Some(qr)),
        )));
        drop(state);

        tracing::info!(agent_id = %agent_id, "QR code ready");
    }

    async fn on_status(&self, agent_id: &str, generation: u64, status: ClientStatus) {
        match status {
            ClientStatus::LoggedIn { phone_number } | ClientStatus::QrConfirmed { phone_number } => {
                self.on_connected(agent_id, generation, phone_number).await
            }
            ClientStatus::SessionClosed { reason } | ClientStatus::DeviceDisconnected { reason } => {
                self.on_disconnected(agent_id, generation, reason).await
            }
            ClientStatus::Unknown => {
                tracing::debug!(agent_id = %agent_id, "Ignoring unknown client status");
            }
        }
    }

    async fn on_connected(&self, agent_id: &str, generation: u64, phone_number: Option<String>) {
        let record = {
            let mut state = self.inner.state.lock().await;
            let Some(instance) = state.current(agent_id, generation) else {
                tracing::debug!(agent_id = %agent_id, generation, "Ignoring status from replaced client");
                return;
            };
            let phone_number = phone_number.or_else(|| instance.phone_number.clone());

            if let Some(slot) = state.clients.get_mut(agent_id) {
                slot.connected = true;
            }
            let patch = InstancePatch {
                has_been_connected: Some(true),
                last_connected_at: Some(Utc::now()),
                qr_regeneration_attempts: Some(0),
                ..InstancePatch::default()
                    .status(InstanceStatus::Connected)
                    .qr_payload(None)
                    .phone_number(phone_number)
                    .reconnect_attempts(0)
                    .reconnecting(false)
            };
            let record = record_of(state.registry.upsert(agent_id, patch));
            self.persist(record.clone());
            record
        };

        tracing::info!(
            agent_id = %agent_id,
            phone_number = ?record.phone_number,
            "Instance connected"
        );
    }

    async fn on_disconnected(&self, agent_id: &str, generation: u64, reason: Option<String>) {
        {
            let mut state = self.inner.state.lock().await;
            if state.current(agent_id, generation).is_none() {
                tracing::debug!(agent_id = %agent_id, generation, "Ignoring status from replaced client");
                return;
            }
            let patch = InstancePatch::default()
                .status(InstanceStatus::Disconnected)
                .qr_payload(None)
                .reconnecting(false);
            self.persist(record_of(state.registry.upsert(agent_id, patch)));
        }

        tracing::warn!(agent_id = %agent_id, reason = ?reason, "Instance disconnected");
        self.notify(ReconnectEvent::Disconnected {
            agent_id: agent_id.to_string(),
            reason,
        });
    }

    async fn on_message(&self, agent_id: &str, generation: u64, msg: InboundMessage) {
        if self
            .inner
            .state
            .lock()
            .await
            .current(agent_id, generation)
            .is_none()
        {
            tracing::debug!(agent_id = %agent_id, message_id = %msg.id, "Ignoring message from replaced client");
            return;
        }
        self.inner.router.route_message(agent_id, &msg).await;
    }

    async fn on_ack(&self, agent_id: &str, generation: u64, message_id: &str, code: i32) {
        if self
            .inner
            .state
            .lock()
            .await
            .current(agent_id, generation)
            .is_none()
        {
            return;
        }
        self.inner.router.route_ack(agent_id, message_id, code).await;
    }
}

fn record_of(instance: &Instance) -> InstanceRecord {
    InstanceRecord {
        agent_id: instance.agent_id.clone(),
        display_name: instance.display_name.clone(),
        status: instance.status,
        qr_payload: instance.qr_payload.clone(),
        phone_number: instance.phone_number.clone(),
        last_connected_at: instance.last_connected_at,
        updated_at: Utc::now(),
    }
}

fn disconnected_record(instance: &Instance) -> InstanceRecord {
    InstanceRecord {
        status: InstanceStatus::Disconnected,
        qr_payload: None,
        ..record_of(instance)
    }
}

async fn close_quietly(agent_id: &str, client: &dyn SessionClient) {
    if let Err(e) = client.close().await {
        tracing::warn!(agent_id = %agent_id, error = %e, "Failed to close session client");
    }
}

/// Applies instance writes one at a time, in submission order.
async fn run_persistence(
    store: Arc<dyn PersistenceGateway>,
    mut ops: mpsc::UnboundedReceiver<PersistOp>,
) {
    while let Some(op) = ops.recv().await {
        match op {
            PersistOp::Save(record) => {
                if let Err(e) = store.save_instance(&record).await {
                    tracing::warn!(
                        agent_id = %record.agent_id,
                        status = %record.status,
                        error = %e,
                        "Failed to persist instance state"
                    );
                }
            }
            PersistOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
