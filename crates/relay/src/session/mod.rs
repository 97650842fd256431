// Page sessions: one coordinator task per live page, plus the registry that
// finds or starts it.
//
// The registry is the only way in. It checks the caller against the page
// access policy, then forwards the request to the page's coordinator and
// waits for the reply. A coordinator that stops (idle, torn down) answers
// anything still queued with `Unavailable`; the registry then starts a
// fresh coordinator from durable state and retries.

mod coordinator;
mod error;
mod flush;

pub use error::{DenyReason, SessionError};
pub use flush::backoff_delay;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use onezone_common::mutation::PageMutation;
use onezone_common::protocol::ws::ServerMessage;
use onezone_common::types::{
    CollaborationSession, LockInfo, PageContent, PageVersion, PresenceEntry, SelectionRange,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::debug;
use uuid::Uuid;

use self::coordinator::{Command, Reply, SessionContext};
use crate::auth::policy::{PageAccessPolicy, PageAction};
use crate::lock::DEFAULT_LOCK_TTL;
use crate::ownership::PageOwnership;
use crate::presence::DEFAULT_PRESENCE_TIMEOUT;
use crate::store::PageStore;
use crate::versions::{normalize_page_size, HistoryPage, VersionCursor, VersionStore};

/// How many times a request is re-sent after its coordinator went away.
const SESSION_RETRY_ATTEMPTS: usize = 3;

/// Timing and sizing knobs for page sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub lock_ttl: Duration,
    pub presence_timeout: Duration,
    /// Delay between the first unsaved change and the flush that saves it.
    pub flush_debounce: Duration,
    /// How long a session with no connections lingers before stopping.
    pub idle_grace: Duration,
    /// Presence sweep, lock expiry and ownership renewal period.
    pub sweep_interval: Duration,
    pub release_lock_on_disconnect: bool,
    pub flush_retry_base: Duration,
    pub flush_retry_max: Duration,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            presence_timeout: DEFAULT_PRESENCE_TIMEOUT,
            flush_debounce: Duration::from_secs(2),
            idle_grace: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            release_lock_on_disconnect: false,
            flush_retry_base: Duration::from_millis(250),
            flush_retry_max: Duration::from_secs(30),
            command_buffer: 256,
            event_buffer: 256,
        }
    }
}

/// Live state of a page as seen by its coordinator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    pub page_id: Uuid,
    /// Sequence number of the last accepted mutation.
    pub seq: u64,
    pub page: PageContent,
    pub lock: Option<LockInfo>,
    pub latest_version: Option<i32>,
    pub active_users: Vec<PresenceEntry>,
}

impl SessionState {
    pub fn collaboration(&self) -> CollaborationSession {
        CollaborationSession {
            page_id: self.page_id,
            active_users: self.active_users.clone(),
            locked: self.lock.is_some(),
            locked_by: self.lock.as_ref().map(|lock| lock.holder_id),
        }
    }

    pub fn into_message(self) -> ServerMessage {
        ServerMessage::PageState {
            page_id: self.page_id,
            seq: self.seq,
            page: self.page,
            lock: self.lock,
            latest_version: self.latest_version,
            active_users: self.active_users,
        }
    }
}

/// Reply to a join: the state at join time plus every event after it.
pub struct JoinedPage {
    pub state: SessionState,
    pub events: broadcast::Receiver<ServerMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationAck {
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoredVersion {
    /// The new version carrying the restored content.
    pub version: PageVersion,
    /// Snapshot of live content taken first, when it had unsaved changes.
    pub before: Option<PageVersion>,
    pub seq: u64,
}

#[derive(Clone)]
struct SessionSlot {
    generation: u64,
    commands: mpsc::Sender<Command>,
}

pub(crate) struct RegistryInner {
    config: SessionConfig,
    store: PageStore,
    versions: VersionStore,
    policy: PageAccessPolicy,
    ownership: PageOwnership,
    sessions: RwLock<HashMap<Uuid, SessionSlot>>,
    next_generation: AtomicU64,
}

impl RegistryInner {
    /// Remove the page's slot if it still belongs to `generation`.
    pub(crate) async fn deregister(&self, page_id: Uuid, generation: u64) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(&page_id).is_some_and(|slot| slot.generation == generation) {
            sessions.remove(&page_id);
        }
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        config: SessionConfig,
        store: PageStore,
        policy: PageAccessPolicy,
        ownership: PageOwnership,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                versions: VersionStore::new(store.clone()),
                store,
                policy,
                ownership,
                sessions: RwLock::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &PageStore {
        &self.inner.store
    }

    pub fn policy(&self) -> &PageAccessPolicy {
        &self.inner.policy
    }

    /// Number of pages with a running coordinator.
    pub async fn active_sessions(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    // ── Connections ────────────────────────────────────────────────────

    /// Attach a connection to the page, starting its session if needed.
    pub async fn join(
        &self,
        page_id: Uuid,
        user_id: Uuid,
        connection_id: Uuid,
    ) -> Result<JoinedPage, SessionError> {
        self.authorize(user_id, page_id, PageAction::View).await?;
        self.call(page_id, |reply| Command::Join { connection_id, user_id, reply }).await
    }

    /// Detach a connection. Unknown pages and connections are ignored.
    pub async fn leave(&self, page_id: Uuid, connection_id: Uuid) {
        self.notify(page_id, Command::Leave { connection_id }).await;
    }

    /// Move a cursor. Dropped when the queue is full or nobody joined.
    pub async fn update_cursor(
        &self,
        page_id: Uuid,
        user_id: Uuid,
        position: u32,
        selection: Option<SelectionRange>,
    ) {
        let Some(slot) = self.existing_slot(page_id).await else {
            debug!(
                page_id = %page_id,
                user_id = %user_id,
                "cursor update for page without session"
            );
            return;
        };
        if slot
            .commands
            .try_send(Command::CursorUpdate { user_id, position, selection })
            .is_err()
        {
            debug!(page_id = %page_id, user_id = %user_id, "cursor update dropped");
        }
    }

    /// Keep a connected viewer in the roster. Dropped like cursor updates.
    pub async fn touch_presence(&self, page_id: Uuid, user_id: Uuid) {
        let Some(slot) = self.existing_slot(page_id).await else {
            return;
        };
        if slot.commands.try_send(Command::Touch { user_id }).is_err() {
            debug!(page_id = %page_id, user_id = %user_id, "presence touch dropped");
        }
    }

    /// Fan a new comment out to everyone on the page. A page nobody has
    /// open has no audience, so nothing happens.
    pub async fn publish_comment(&self, page_id: Uuid, comment: Value) {
        self.notify(page_id, Command::PublishComment { comment }).await;
    }

    // ── Content ────────────────────────────────────────────────────────

    pub async fn state(&self, page_id: Uuid, user_id: Uuid) -> Result<SessionState, SessionError> {
        self.authorize(user_id, page_id, PageAction::View).await?;
        self.call(page_id, |reply| Command::State { reply }).await
    }

    pub async fn mutate(
        &self,
        page_id: Uuid,
        user_id: Uuid,
        op: PageMutation,
    ) -> Result<MutationAck, SessionError> {
        self.authorize(user_id, page_id, PageAction::Edit).await?;
        self.call(page_id, |reply| Command::Mutate { user_id, op: op.clone(), reply }).await
    }

    // ── Locks ──────────────────────────────────────────────────────────

    pub async fn acquire_lock(
        &self,
        page_id: Uuid,
        user_id: Uuid,
    ) -> Result<LockInfo, SessionError> {
        self.authorize(user_id, page_id, PageAction::Edit).await?;
        self.call(page_id, |reply| Command::AcquireLock { user_id, reply }).await
    }

    pub async fn release_lock(&self, page_id: Uuid, user_id: Uuid) -> Result<(), SessionError> {
        self.authorize(user_id, page_id, PageAction::Edit).await?;
        self.call(page_id, |reply| Command::ReleaseLock { user_id, reply }).await
    }

    pub async fn heartbeat(&self, page_id: Uuid, user_id: Uuid) -> Result<LockInfo, SessionError> {
        self.authorize(user_id, page_id, PageAction::Edit).await?;
        self.call(page_id, |reply| Command::Heartbeat { user_id, reply }).await
    }

    /// Force-release the page lock. Returns the lock that was broken.
    pub async fn break_lock(
        &self,
        page_id: Uuid,
        actor_id: Uuid,
    ) -> Result<Option<LockInfo>, SessionError> {
        self.authorize(actor_id, page_id, PageAction::BreakLock).await?;
        self.call(page_id, |reply| Command::BreakLock { actor_id, reply }).await
    }

    // ── Versions ───────────────────────────────────────────────────────

    /// Snapshot the live content as a new version, changed or not.
    pub async fn snapshot(
        &self,
        page_id: Uuid,
        actor_id: Uuid,
        change_summary: Option<String>,
    ) -> Result<PageVersion, SessionError> {
        self.authorize(actor_id, page_id, PageAction::Edit).await?;
        self.call(page_id, |reply| Command::Snapshot {
            actor_id,
            change_summary: change_summary.clone(),
            reply,
        })
        .await
    }

    pub async fn restore(
        &self,
        page_id: Uuid,
        actor_id: Uuid,
        version_number: i32,
    ) -> Result<RestoredVersion, SessionError> {
        self.authorize(actor_id, page_id, PageAction::Edit).await?;
        self.call(page_id, |reply| Command::Restore { actor_id, version_number, reply }).await
    }

    /// One page of version history, newest first. Versions are immutable,
    /// so this reads the ledger directly instead of going through the
    /// coordinator.
    pub async fn history(
        &self,
        page_id: Uuid,
        user_id: Uuid,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<HistoryPage, SessionError> {
        self.authorize(user_id, page_id, PageAction::View).await?;
        let cursor = cursor.map(|raw| VersionCursor::decode(raw, page_id)).transpose()?;
        Ok(self.inner.versions.page(page_id, cursor, normalize_page_size(limit)).await?)
    }

    /// Flush and stop every running session.
    pub async fn shutdown(&self) {
        let slots: Vec<SessionSlot> = self.inner.sessions.read().await.values().cloned().collect();
        for slot in slots {
            let (reply, done) = oneshot::channel();
            if slot.commands.send(Command::Shutdown { reply }).await.is_ok() {
                let _ = done.await;
            }
        }
    }

    // ── Plumbing ───────────────────────────────────────────────────────

    async fn authorize(
        &self,
        user_id: Uuid,
        page_id: Uuid,
        action: PageAction,
    ) -> Result<(), SessionError> {
        if self.inner.policy.authorize(user_id, page_id, action).await? {
            return Ok(());
        }
        debug!(
            page_id = %page_id,
            user_id = %user_id,
            action = action.as_str(),
            "page access denied"
        );
        Err(SessionError::Denied(DenyReason::Unauthorized))
    }

    async fn call<T>(
        &self,
        page_id: Uuid,
        make: impl Fn(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        for _ in 0..SESSION_RETRY_ATTEMPTS {
            let slot = self.slot(page_id).await;
            let (reply, response) = oneshot::channel();
            if slot.commands.send(make(reply)).await.is_err() {
                self.inner.deregister(page_id, slot.generation).await;
                continue;
            }
            match response.await {
                Ok(Err(SessionError::Unavailable)) | Err(_) => continue,
                Ok(result) => return result,
            }
        }
        Err(SessionError::Unavailable)
    }

    async fn notify(&self, page_id: Uuid, command: Command) {
        if let Some(slot) = self.existing_slot(page_id).await {
            let _ = slot.commands.send(command).await;
        }
    }

    async fn existing_slot(&self, page_id: Uuid) -> Option<SessionSlot> {
        self.inner.sessions.read().await.get(&page_id).cloned()
    }

    /// The page's slot, starting a coordinator if none is running.
    async fn slot(&self, page_id: Uuid) -> SessionSlot {
        if let Some(slot) = self.existing_slot(page_id).await {
            return slot;
        }

        let mut sessions = self.inner.sessions.write().await;
        if let Some(slot) = sessions.get(&page_id) {
            return slot.clone();
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (commands, receiver) = mpsc::channel(self.inner.config.command_buffer.max(1));
        // Spawned while the write lock is held, so the task cannot
        // deregister before its slot exists.
        coordinator::spawn(SessionContext {
            page_id,
            generation,
            config: self.inner.config.clone(),
            store: self.inner.store.clone(),
            versions: self.inner.versions.clone(),
            ownership: self.inner.ownership.clone(),
            registry: Arc::downgrade(&self.inner),
            commands: receiver,
        });

        let slot = SessionSlot { generation, commands };
        sessions.insert(page_id, slot.clone());
        slot
    }
}
