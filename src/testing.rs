//! Test doubles for the session client and the downstream collaborators.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use crate::client::{
    EventSender, OutboundMedia, SessionClient, SessionClientFactory, SessionEvent,
};
use crate::config::{ManagerConfig, RouterConfig};
use crate::conversation::{ConversationLog, FollowUpScheduler, LogEntry};
use crate::error::{ClientError, DatabaseError};
use crate::instance::SessionManager;
use crate::router::MessageRouter;
use crate::store::MemoryStore;

/// Client that records what it was asked to do.
pub struct MockClient {
    session_name: String,
    sent: Mutex<Vec<(String, String)>>,
    sent_media: Mutex<Vec<OutboundMedia>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    logged_out: AtomicBool,
    fail_close: AtomicBool,
}

impl MockClient {
    fn new(session_name: &str) -> Self {
        Self {
            session_name: session_name.to_string(),
            sent: Mutex::new(Vec::new()),
            sent_media: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            logged_out: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
        }
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_media(&self) -> Vec<OutboundMedia> {
        self.sent_media.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    /// Make `close` fail from now on.
    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    fn message_id(&self) -> String {
        format!(
            "{}-out-{}",
            self.session_name,
            self.next_id.fetch_add(1, Ordering::SeqCst)
        )
    }
}

#[async_trait]
impl SessionClient for MockClient {
    fn session_name(&self) -> &str {
        &self.session_name
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<String, ClientError> {
        self.sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), text.to_string()));
        Ok(self.message_id())
    }

    async fn send_media(
        &self,
        _chat_id: &str,
        media: &OutboundMedia,
    ) -> Result<String, ClientError> {
        self.sent_media.lock().unwrap().push(media.clone());
        Ok(self.message_id())
    }

    async fn logout(&self) -> Result<(), ClientError> {
        self.logged_out.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(ClientError::RequestFailed {
                session: self.session_name.clone(),
                reason: "browser already gone".to_string(),
            });
        }
        Ok(())
    }
}

struct Created {
    session_name: String,
    client: Arc<MockClient>,
    events: EventSender,
}

/// Factory handing out [`MockClient`]s. Clients are indexed in creation order.
#[derive(Default)]
pub struct MockFactory {
    created: Mutex<Vec<Created>>,
    cleared: Mutex<Vec<String>>,
    creation_delay: Mutex<Option<Duration>>,
    failures_left: AtomicUsize,
    fail_clear: AtomicBool,
}

impl MockFactory {
    pub fn creation_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn created_sessions(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.session_name.clone())
            .collect()
    }

    pub fn client(&self, index: usize) -> Arc<MockClient> {
        Arc::clone(&self.created.lock().unwrap()[index].client)
    }

    pub fn cleared_sessions(&self) -> Vec<String> {
        self.cleared.lock().unwrap().clone()
    }

    pub fn set_creation_delay(&self, delay: Duration) {
        *self.creation_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_next_creations(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn fail_clear_credentials(&self) {
        self.fail_clear.store(true, Ordering::SeqCst);
    }

    /// Push an event as if the `index`th client had emitted it.
    pub async fn emit(&self, index: usize, event: SessionEvent) {
        let events = self.created.lock().unwrap()[index].events.clone();
        events.send(event).await.unwrap();
    }
}

#[async_trait]
impl SessionClientFactory for MockFactory {
    async fn create(
        &self,
        session_name: &str,
        events: EventSender,
    ) -> Result<Arc<dyn SessionClient>, ClientError> {
        let delay = *self.creation_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ClientError::CreationFailed {
                session: session_name.to_string(),
                reason: "browser failed to launch".to_string(),
            });
        }

        let client = Arc::new(MockClient::new(session_name));
        self.created.lock().unwrap().push(Created {
            session_name: session_name.to_string(),
            client: Arc::clone(&client),
            events,
        });
        Ok(client)
    }

    async fn clear_credentials(&self, session_name: &str) -> Result<(), ClientError> {
        if self.fail_clear.load(Ordering::SeqCst) {
            return Err(ClientError::CredentialClear {
                path: format!("/auth/session-{}", session_name).into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            });
        }
        self.cleared.lock().unwrap().push(session_name.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingLog {
    entries: AsyncMutex<Vec<LogEntry>>,
}

impl RecordingLog {
    pub async fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl ConversationLog for RecordingLog {
    async fn record(&self, entry: LogEntry) -> Result<(), DatabaseError> {
        self.entries.lock().await.push(entry);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingFollowUps {
    cancelled: AsyncMutex<Vec<String>>,
}

impl RecordingFollowUps {
    pub async fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().await.clone()
    }
}

#[async_trait]
impl FollowUpScheduler for RecordingFollowUps {
    async fn cancel_for_contact(&self, contact_id: &str) {
        self.cancelled.lock().await.push(contact_id.to_string());
    }
}

/// A manager wired to mocks and an in-memory store.
pub struct Harness {
    pub manager: SessionManager,
    pub factory: Arc<MockFactory>,
    pub store: Arc<MemoryStore>,
    pub log: Arc<RecordingLog>,
    pub follow_ups: Arc<RecordingFollowUps>,
}

pub fn harness(config: ManagerConfig) -> Harness {
    let factory = Arc::new(MockFactory::default());
    let store = Arc::new(MemoryStore::new());
    let log = Arc::new(RecordingLog::default());
    let follow_ups = Arc::new(RecordingFollowUps::default());
    let router = MessageRouter::new(
        RouterConfig::default(),
        store.clone(),
        log.clone(),
        follow_ups.clone(),
    );
    let manager = SessionManager::new(config, factory.clone(), store.clone(), router);
    Harness {
        manager,
        factory,
        store,
        log,
        follow_ups,
    }
}

/// Let spawned tasks drain their queues.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
