// Per-page session actor.
//
// One task per live page owns the authoritative content, the lock table,
// presence and the version ledger. Commands arrive over an mpsc queue and are
// handled strictly in arrival order; events fan out over a broadcast
// channel. Persistence is awaited inline, but the queue keeps accepting
// while a write is in flight, and queued mutations are applied right before
// each flush so the write carries the newest state.

use std::collections::{HashMap, VecDeque};
use std::sync::Weak;

use chrono::{DateTime, Utc};
use onezone_common::mutation::PageMutation;
use onezone_common::protocol::ws::ServerMessage;
use onezone_common::types::{LockInfo, PageContent, PageVersion, SelectionRange};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::flush::{backoff_delay, FlushSchedule};
use super::{
    DenyReason, JoinedPage, MutationAck, RegistryInner, RestoredVersion, SessionConfig,
    SessionError, SessionState,
};
use crate::lock::{
    AcquireResult, HeartbeatDenial, HeartbeatResult, LockEvent, LockManager, ReleaseResult,
};
use crate::metrics;
use crate::ownership::{ClaimResult, PageOwnership, RenewResult};
use crate::presence::PresenceTracker;
use crate::store::{PageMetadata, PageStore};
use crate::versions::{VersionLedger, VersionStore};

const AUTO_SAVE_SUMMARY: &str = "Auto-save";
const FINAL_FLUSH_ATTEMPTS: u32 = 3;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub(crate) enum Command {
    Join { connection_id: Uuid, user_id: Uuid, reply: Reply<JoinedPage> },
    Leave { connection_id: Uuid },
    Mutate { user_id: Uuid, op: PageMutation, reply: Reply<MutationAck> },
    AcquireLock { user_id: Uuid, reply: Reply<LockInfo> },
    ReleaseLock { user_id: Uuid, reply: Reply<()> },
    Heartbeat { user_id: Uuid, reply: Reply<LockInfo> },
    BreakLock { actor_id: Uuid, reply: Reply<Option<LockInfo>> },
    CursorUpdate { user_id: Uuid, position: u32, selection: Option<SelectionRange> },
    Touch { user_id: Uuid },
    Snapshot { actor_id: Uuid, change_summary: Option<String>, reply: Reply<PageVersion> },
    Restore { actor_id: Uuid, version_number: i32, reply: Reply<RestoredVersion> },
    State { reply: Reply<SessionState> },
    PublishComment { comment: Value },
    Shutdown { reply: oneshot::Sender<()> },
}

impl Command {
    fn reject(self, error: SessionError) {
        match self {
            Self::Join { reply, .. } => drop(reply.send(Err(error))),
            Self::Mutate { reply, .. } => drop(reply.send(Err(error))),
            Self::AcquireLock { reply, .. } | Self::Heartbeat { reply, .. } => {
                drop(reply.send(Err(error)))
            }
            Self::ReleaseLock { reply, .. } => drop(reply.send(Err(error))),
            Self::BreakLock { reply, .. } => drop(reply.send(Err(error))),
            Self::Snapshot { reply, .. } => drop(reply.send(Err(error))),
            Self::Restore { reply, .. } => drop(reply.send(Err(error))),
            Self::State { reply } => drop(reply.send(Err(error))),
            Self::Shutdown { reply } => drop(reply.send(())),
            Self::Leave { .. }
            | Self::CursorUpdate { .. }
            | Self::Touch { .. }
            | Self::PublishComment { .. } => {}
        }
    }
}

/// Plumbing handed to a session task by the registry.
pub(crate) struct SessionContext {
    pub(crate) page_id: Uuid,
    pub(crate) generation: u64,
    pub(crate) config: SessionConfig,
    pub(crate) store: PageStore,
    pub(crate) versions: VersionStore,
    pub(crate) ownership: PageOwnership,
    pub(crate) registry: Weak<RegistryInner>,
    pub(crate) commands: mpsc::Receiver<Command>,
}

impl SessionContext {
    /// Leave the registry, stop the queue and answer whatever is still in it.
    async fn close(&mut self, deferred: &mut VecDeque<Command>, reject_with: &SessionError) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.page_id, self.generation).await;
        }
        self.commands.close();
        for command in deferred.drain(..) {
            command.reject(reject_with.clone());
        }
        while let Ok(command) = self.commands.try_recv() {
            command.reject(reject_with.clone());
        }
    }
}

enum Exit {
    Idle,
    Shutdown(oneshot::Sender<()>),
    /// Every sender is gone; the registry was dropped.
    Closed,
    Fatal(SessionError),
}

enum Control {
    Continue,
    Shutdown(oneshot::Sender<()>),
}

pub(crate) fn spawn(ctx: SessionContext) {
    let span = info_span!("relay.session", page_id = %ctx.page_id, generation = ctx.generation);
    tokio::spawn(run(ctx).instrument(span));
}

async fn run(mut ctx: SessionContext) {
    metrics::session_started();
    match PageSession::load(&ctx).await {
        Ok(session) => session.run(ctx).await,
        Err(error) => {
            warn!(error = %error, "page session failed to start");
            ctx.close(&mut VecDeque::new(), &error).await;
        }
    }
    metrics::session_stopped();
}

struct PageSession {
    page_id: Uuid,
    config: SessionConfig,
    lease_id: Uuid,
    content: PageContent,
    ledger: VersionLedger,
    locks: LockManager,
    presence: PresenceTracker,
    seq: u64,
    /// connection id -> user id
    connections: HashMap<Uuid, Uuid>,
    /// Last user whose edit has not been snapshotted yet.
    last_editor: Option<Uuid>,
    schedule: FlushSchedule,
    idle_deadline: Option<Instant>,
    events: broadcast::Sender<ServerMessage>,
    deferred: VecDeque<Command>,
}

impl PageSession {
    async fn load(ctx: &SessionContext) -> Result<Self, SessionError> {
        let page_id = ctx.page_id;
        let lease_id = match ctx.ownership.claim(page_id).await {
            Ok(ClaimResult::Granted { lease_id } | ClaimResult::Renewed { lease_id }) => lease_id,
            Ok(ClaimResult::Denied { current_owner }) => {
                return Err(SessionError::OwnedElsewhere { owner: current_owner })
            }
            Err(error) => return Err(SessionError::Transient(error.to_string())),
        };

        let loaded = async {
            let stored = ctx.store.load_page(page_id).await?;
            let ledger = ctx.versions.load_ledger(page_id).await?;
            Ok::<_, SessionError>((stored, ledger))
        }
        .await;
        let (stored, ledger) = match loaded {
            Ok(loaded) => loaded,
            Err(error) => {
                if let Err(release_error) = ctx.ownership.release(page_id).await {
                    warn!(error = %release_error, "failed to release page ownership");
                }
                return Err(error);
            }
        };

        let now = Utc::now();
        let mut locks = LockManager::new();
        if let Some(lock) = stored.lock {
            locks.restore(lock, ctx.config.lock_ttl, now);
        }
        let (events, _) = broadcast::channel(ctx.config.event_buffer.max(1));

        info!(latest_version = ?ledger.latest(), "page session started");

        Ok(Self {
            page_id,
            config: ctx.config.clone(),
            lease_id,
            content: stored.content,
            ledger,
            locks,
            presence: PresenceTracker::new(ctx.config.presence_timeout),
            seq: 0,
            connections: HashMap::new(),
            last_editor: None,
            schedule: FlushSchedule::new(
                ctx.config.flush_debounce,
                ctx.config.flush_retry_base,
                ctx.config.flush_retry_max,
            ),
            idle_deadline: Some(Instant::now() + ctx.config.idle_grace),
            events,
            deferred: VecDeque::new(),
        })
    }

    async fn run(mut self, mut ctx: SessionContext) {
        let exit = self.serve(&mut ctx).await;
        let reject_with = SessionError::Unavailable;

        match &exit {
            Exit::Fatal(error) => {
                error!(error = %error, "page session torn down");
                metrics::record_session_teardown();
                self.broadcast(reject_with.to_message(Some(self.page_id)));
                ctx.close(&mut self.deferred, &reject_with).await;
            }
            Exit::Idle => {
                ctx.close(&mut self.deferred, &reject_with).await;
                info!("page session idle");
            }
            Exit::Shutdown(_) | Exit::Closed => {
                ctx.close(&mut self.deferred, &reject_with).await;
                self.final_flush(&ctx).await;
                info!("page session stopped");
            }
        }

        if let Err(error) = ctx.ownership.release(self.page_id).await {
            warn!(error = %error, "failed to release page ownership");
        }
        if let Exit::Shutdown(reply) = exit {
            let _ = reply.send(());
        }
    }

    async fn serve(&mut self, ctx: &mut SessionContext) -> Exit {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            let command = match self.deferred.pop_front() {
                Some(command) => command,
                None => {
                    let flush_at = self.schedule.deadline();
                    let idle_at = self.idle_deadline;
                    tokio::select! {
                        biased;
                        _ = sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                            if let Err(error) = self.flush(ctx).await {
                                return Exit::Fatal(error);
                            }
                            continue;
                        }
                        _ = sweep.tick() => {
                            if let Err(error) = self.sweep(ctx).await {
                                return Exit::Fatal(error);
                            }
                            continue;
                        }
                        _ = sleep_until(idle_at.unwrap_or_else(Instant::now)), if idle_at.is_some() => {
                            match self.try_go_idle(ctx).await {
                                Ok(true) => return Exit::Idle,
                                Ok(false) => continue,
                                Err(error) => return Exit::Fatal(error),
                            }
                        }
                        received = ctx.commands.recv() => match received {
                            Some(command) => command,
                            None => return Exit::Closed,
                        },
                    }
                }
            };

            match self.handle(ctx, command).await {
                Ok(Control::Continue) => {}
                Ok(Control::Shutdown(reply)) => return Exit::Shutdown(reply),
                Err(error) => return Exit::Fatal(error),
            }
        }
    }

    /// Handle one command. An `Err` is an invariant violation: the caller
    /// has already been answered and the session must be torn down.
    async fn handle(
        &mut self,
        ctx: &SessionContext,
        command: Command,
    ) -> Result<Control, SessionError> {
        let now = Utc::now();
        if self.connections.is_empty() {
            // REST-only traffic keeps an unjoined session warm.
            self.idle_deadline = Some(Instant::now() + self.config.idle_grace);
        }
        let fatal = match command {
            Command::Join { connection_id, user_id, reply } => {
                let joined = self.join(connection_id, user_id, now);
                let _ = reply.send(Ok(joined));
                None
            }
            Command::Leave { connection_id } => {
                self.leave(connection_id, now);
                None
            }
            Command::Mutate { user_id, op, reply } => {
                let _ = reply.send(self.mutate(user_id, op, now));
                None
            }
            Command::AcquireLock { user_id, reply } => {
                let _ = reply.send(self.acquire(user_id, now));
                None
            }
            Command::ReleaseLock { user_id, reply } => {
                let _ = reply.send(self.release(user_id, now));
                None
            }
            Command::Heartbeat { user_id, reply } => {
                let _ = reply.send(self.heartbeat(user_id, now));
                None
            }
            Command::BreakLock { actor_id, reply } => {
                let _ = reply.send(Ok(self.locks.break_lock(self.page_id, actor_id, now)));
                None
            }
            Command::CursorUpdate { user_id, position, selection } => {
                self.update_cursor(user_id, position, selection, now);
                None
            }
            Command::Touch { user_id } => {
                self.presence.touch(self.page_id, user_id, now);
                None
            }
            Command::Snapshot { actor_id, change_summary, reply } => {
                let result = self.snapshot(ctx, actor_id, change_summary).await;
                answer(reply, result)
            }
            Command::Restore { actor_id, version_number, reply } => {
                let result = self.restore(ctx, actor_id, version_number, now).await;
                answer(reply, result)
            }
            Command::State { reply } => {
                let _ = reply.send(Ok(self.state_view(now)));
                None
            }
            Command::PublishComment { comment } => {
                self.broadcast(ServerMessage::NewComment { page_id: self.page_id, comment });
                None
            }
            Command::Shutdown { reply } => return Ok(Control::Shutdown(reply)),
        };

        self.publish_lock_events();
        match fatal {
            Some(error) => Err(error),
            None => Ok(Control::Continue),
        }
    }

    // ── Connections and presence ───────────────────────────────────────

    fn join(&mut self, connection_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> JoinedPage {
        let events = self.events.subscribe();
        self.connections.insert(connection_id, user_id);
        self.idle_deadline = None;

        let was_present = self.presence.is_present(self.page_id, user_id);
        self.presence.join(self.page_id, user_id, now);
        if !was_present {
            self.broadcast(ServerMessage::JoinPage { page_id: self.page_id, user_id });
        }
        self.broadcast_presence(now);

        debug!(user_id = %user_id, connection_id = %connection_id, "connection joined page");
        JoinedPage { state: self.state_view(now), events }
    }

    fn leave(&mut self, connection_id: Uuid, now: DateTime<Utc>) {
        let Some(user_id) = self.connections.remove(&connection_id) else {
            return;
        };

        if !self.connections.values().any(|other| *other == user_id) {
            if self.presence.leave(self.page_id, user_id) {
                self.broadcast(ServerMessage::LeavePage { page_id: self.page_id, user_id });
            }
            if self.config.release_lock_on_disconnect {
                self.locks.release_for_disconnect(self.page_id, user_id, now);
            }
            self.broadcast_presence(now);
        }

        if self.connections.is_empty() {
            self.idle_deadline = Some(Instant::now() + self.config.idle_grace);
        }
        debug!(user_id = %user_id, connection_id = %connection_id, "connection left page");
    }

    fn update_cursor(
        &mut self,
        user_id: Uuid,
        position: u32,
        selection: Option<SelectionRange>,
        now: DateTime<Utc>,
    ) {
        if self.presence.update_cursor(self.page_id, user_id, position, selection, now).is_some() {
            self.broadcast(ServerMessage::CursorUpdate {
                page_id: self.page_id,
                user_id,
                position,
                selection,
            });
        }
    }

    // ── Content ────────────────────────────────────────────────────────

    fn mutate(
        &mut self,
        user_id: Uuid,
        op: PageMutation,
        now: DateTime<Utc>,
    ) -> Result<MutationAck, SessionError> {
        if let Err(error) = self.ensure_editable_by(user_id, now) {
            metrics::record_mutation_denied("locked_by");
            return Err(error);
        }
        if let Err(error) = op.apply(&mut self.content) {
            metrics::record_mutation_denied("invalid");
            return Err(error.into());
        }

        self.seq += 1;
        self.last_editor = Some(user_id);
        self.presence.touch(self.page_id, user_id, now);
        self.schedule.mark_dirty(Instant::now());
        metrics::record_mutation_applied();

        self.broadcast(ServerMessage::PageUpdate {
            page_id: self.page_id,
            seq: self.seq,
            actor_id: user_id,
            op,
        });
        Ok(MutationAck { seq: self.seq })
    }

    fn ensure_editable_by(
        &mut self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        match self.locks.current(self.page_id, now) {
            Some(lock) if lock.holder_id != user_id => {
                Err(SessionError::Denied(DenyReason::LockedBy { holder: lock.holder_id }))
            }
            _ => Ok(()),
        }
    }

    /// Apply mutations already waiting in the queue. Stops at the first
    /// other command so nothing is reordered.
    fn drain_queued_mutations(&mut self, ctx: &mut SessionContext) {
        let now = Utc::now();
        while self.deferred.is_empty() {
            match ctx.commands.try_recv() {
                Ok(Command::Mutate { user_id, op, reply }) => {
                    let _ = reply.send(self.mutate(user_id, op, now));
                }
                Ok(other) => self.deferred.push_back(other),
                Err(_) => break,
            }
        }
        self.publish_lock_events();
    }

    // ── Locks ──────────────────────────────────────────────────────────

    fn acquire(&mut self, user_id: Uuid, now: DateTime<Utc>) -> Result<LockInfo, SessionError> {
        match self.locks.acquire(self.page_id, user_id, self.config.lock_ttl, now) {
            AcquireResult::Granted(lock) | AcquireResult::Renewed(lock) => {
                self.presence.touch(self.page_id, user_id, now);
                Ok(lock)
            }
            AcquireResult::Denied { current_holder } => {
                Err(SessionError::Denied(DenyReason::LockedBy { holder: current_holder }))
            }
        }
    }

    fn release(&mut self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), SessionError> {
        match self.locks.release(self.page_id, user_id, now) {
            ReleaseResult::Released => Ok(()),
            ReleaseResult::NotHolder => Err(SessionError::Denied(DenyReason::NotHolder)),
        }
    }

    fn heartbeat(&mut self, user_id: Uuid, now: DateTime<Utc>) -> Result<LockInfo, SessionError> {
        match self.locks.heartbeat(self.page_id, user_id, now) {
            HeartbeatResult::Renewed(lock) => {
                self.presence.touch(self.page_id, user_id, now);
                self.schedule.mark_dirty(Instant::now());
                Ok(lock)
            }
            HeartbeatResult::Denied(HeartbeatDenial::NotHolder) => {
                Err(SessionError::Denied(DenyReason::NotHolder))
            }
            HeartbeatResult::Denied(HeartbeatDenial::Expired) => {
                Err(SessionError::Denied(DenyReason::Expired))
            }
        }
    }

    fn publish_lock_events(&mut self) {
        let mut changed = false;
        loop {
            let events = self.locks.drain_events();
            if events.is_empty() {
                break;
            }
            changed = true;
            for event in events {
                let message = match event {
                    LockEvent::Locked(lock) => ServerMessage::LockPage {
                        page_id: lock.page_id,
                        locked_by: lock.holder_id,
                        expires_at: lock.expires_at,
                    },
                    LockEvent::Unlocked { page_id, previous_holder, reason } => {
                        ServerMessage::UnlockPage {
                            page_id,
                            previous_holder: Some(previous_holder),
                            reason,
                        }
                    }
                };
                self.broadcast(message);
            }
        }

        if changed {
            self.schedule.mark_dirty(Instant::now());
            self.broadcast_presence(Utc::now());
        }
    }

    // ── Versions ───────────────────────────────────────────────────────

    async fn snapshot(
        &mut self,
        ctx: &SessionContext,
        actor_id: Uuid,
        change_summary: Option<String>,
    ) -> Result<PageVersion, SessionError> {
        let version =
            ctx.versions.snapshot(&mut self.ledger, &self.content, change_summary, actor_id).await?;
        metrics::record_version_created();
        self.last_editor = None;
        Ok(version)
    }

    async fn restore(
        &mut self,
        ctx: &SessionContext,
        actor_id: Uuid,
        version_number: i32,
        now: DateTime<Utc>,
    ) -> Result<RestoredVersion, SessionError> {
        self.ensure_editable_by(actor_id, now)?;

        let outcome =
            ctx.versions.restore(&mut self.ledger, &self.content, version_number, actor_id).await?;
        if outcome.before.is_some() {
            metrics::record_version_created();
        }
        metrics::record_version_created();

        let restored = outcome.restored.page_content();
        let previous = std::mem::replace(&mut self.content, restored.clone());

        self.seq += 1;
        self.broadcast(ServerMessage::PageUpdate {
            page_id: self.page_id,
            seq: self.seq,
            actor_id,
            op: PageMutation::ReplaceContent {
                content: restored.content,
                content_html: Some(restored.content_html),
            },
        });
        if previous.name != restored.name {
            self.seq += 1;
            self.broadcast(ServerMessage::PageUpdate {
                page_id: self.page_id,
                seq: self.seq,
                actor_id,
                op: PageMutation::Rename { name: restored.name },
            });
        }

        self.last_editor = None;
        self.schedule.mark_dirty(Instant::now());
        info!(
            version_number,
            new_version = outcome.restored.version_number,
            actor_id = %actor_id,
            "page version restored"
        );

        Ok(RestoredVersion { version: outcome.restored, before: outcome.before, seq: self.seq })
    }

    // ── Persistence ────────────────────────────────────────────────────

    /// Save the page record and snapshot unsnapshotted edits. Transient
    /// failures re-arm the schedule; anything else is fatal.
    async fn flush(&mut self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        self.drain_queued_mutations(ctx);

        let metadata = PageMetadata { lock: self.locks.current(self.page_id, Utc::now()) };
        self.publish_lock_events();

        if let Err(error) = ctx.store.save_page(self.page_id, &self.content, &metadata).await {
            return self.flush_failed(error.into());
        }

        if let Some(actor_id) = self.last_editor {
            if !self.ledger.is_unchanged(&self.content) {
                match ctx
                    .versions
                    .snapshot(
                        &mut self.ledger,
                        &self.content,
                        Some(AUTO_SAVE_SUMMARY.to_string()),
                        actor_id,
                    )
                    .await
                {
                    Ok(_) => metrics::record_version_created(),
                    Err(error) => return self.flush_failed(error.into()),
                }
            }
            self.last_editor = None;
        }

        self.schedule.succeeded();
        debug!(seq = self.seq, "page flushed");
        Ok(())
    }

    fn flush_failed(&mut self, error: SessionError) -> Result<(), SessionError> {
        if !error.is_transient() {
            return Err(error);
        }
        metrics::record_flush_failure();
        let delay = self.schedule.failed(Instant::now());
        warn!(
            error = %error,
            attempt = self.schedule.failures(),
            retry_in_ms = delay.as_millis() as u64,
            "page flush failed; will retry"
        );
        Ok(())
    }

    async fn final_flush(&mut self, ctx: &SessionContext) {
        for attempt in 0..FINAL_FLUSH_ATTEMPTS {
            if !self.schedule.is_dirty() {
                return;
            }
            let result = async {
                let metadata = PageMetadata { lock: self.locks.current(self.page_id, Utc::now()) };
                ctx.store.save_page(self.page_id, &self.content, &metadata).await?;
                if let Some(actor_id) = self.last_editor {
                    if !self.ledger.is_unchanged(&self.content) {
                        ctx.versions
                            .snapshot(
                                &mut self.ledger,
                                &self.content,
                                Some(AUTO_SAVE_SUMMARY.to_string()),
                                actor_id,
                            )
                            .await?;
                        metrics::record_version_created();
                    }
                }
                Ok::<_, SessionError>(())
            }
            .await;

            match result {
                Ok(()) => {
                    self.last_editor = None;
                    self.schedule.succeeded();
                    return;
                }
                Err(error) if error.is_transient() => {
                    metrics::record_flush_failure();
                    warn!(error = %error, attempt, "final page flush failed");
                    let config = &self.config;
                    let delay =
                        backoff_delay(attempt, config.flush_retry_base, config.flush_retry_max);
                    sleep(delay).await;
                }
                Err(error) => {
                    error!(error = %error, "final page flush failed");
                    return;
                }
            }
        }
        error!("page session stopped with unsaved changes");
    }

    // ── Timers ─────────────────────────────────────────────────────────

    async fn sweep(&mut self, ctx: &SessionContext) -> Result<(), SessionError> {
        let now = Utc::now();

        let removed = self.presence.sweep(now);
        for (page_id, user_id) in &removed {
            self.broadcast(ServerMessage::LeavePage { page_id: *page_id, user_id: *user_id });
        }
        if !removed.is_empty() {
            debug!(removed = removed.len(), "inactive presence swept");
            self.broadcast_presence(now);
        }

        self.locks.expire_due(now);
        self.publish_lock_events();

        match ctx.ownership.renew(self.page_id, self.lease_id).await {
            Ok(RenewResult::Renewed) => Ok(()),
            Ok(lost) => Err(SessionError::Fatal(format!("page ownership lease lost: {lost:?}"))),
            Err(error) => {
                warn!(error = %error, "page ownership renewal failed");
                Ok(())
            }
        }
    }

    /// Returns true when the session may stop: nobody is connected, nothing
    /// is queued and everything is saved.
    async fn try_go_idle(&mut self, ctx: &mut SessionContext) -> Result<bool, SessionError> {
        self.idle_deadline = None;
        if !self.connections.is_empty() {
            return Ok(false);
        }

        if let Ok(command) = ctx.commands.try_recv() {
            self.deferred.push_back(command);
            self.idle_deadline = Some(Instant::now() + self.config.idle_grace);
            return Ok(false);
        }

        if self.schedule.is_dirty() {
            self.flush(ctx).await?;
            if self.schedule.is_dirty() || !self.deferred.is_empty() {
                self.idle_deadline = Some(Instant::now() + self.config.idle_grace);
                return Ok(false);
            }
        }

        Ok(true)
    }

    // ── Views ──────────────────────────────────────────────────────────

    fn state_view(&mut self, now: DateTime<Utc>) -> SessionState {
        SessionState {
            page_id: self.page_id,
            seq: self.seq,
            page: self.content.clone(),
            lock: self.locks.current(self.page_id, now),
            latest_version: self.ledger.latest(),
            active_users: self.presence.roster(self.page_id),
        }
    }

    fn broadcast_presence(&mut self, now: DateTime<Utc>) {
        let lock = self.locks.current(self.page_id, now);
        self.broadcast(ServerMessage::UserPresence {
            page_id: self.page_id,
            active_users: self.presence.roster(self.page_id),
            locked: lock.is_some(),
            locked_by: lock.map(|lock| lock.holder_id),
        });
    }

    fn broadcast(&self, message: ServerMessage) {
        // No receivers is fine: REST-only sessions have no subscribers.
        let _ = self.events.send(message);
    }
}

/// Send a result to the caller. Version conflicts and fatal errors are also
/// returned so the session tears itself down.
fn answer<T>(reply: Reply<T>, result: Result<T, SessionError>) -> Option<SessionError> {
    let fatal = match &result {
        Err(error @ (SessionError::Fatal(_) | SessionError::VersionConflict { .. })) => {
            Some(error.clone())
        }
        _ => None,
    };
    let _ = reply.send(result);
    fatal
}
