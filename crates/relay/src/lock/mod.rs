// Exclusive page edit locks.
//
// At most one live lock per page. Expiry is lazy: a lock whose `expires_at`
// has been reached is treated as absent by every operation and purged on
// the next touch. Every state change queues a `LockEvent` which the owning
// session drains and broadcasts.
//
// The manager holds no internal synchronization. It is owned by a single
// page session, which serializes all calls.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use onezone_common::protocol::ws::UnlockReason;
use onezone_common::types::LockInfo;
use tracing::debug;
use uuid::Uuid;

/// Default lock duration.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);
/// Shortest TTL a lock can be granted with.
const MIN_LOCK_TTL: Duration = Duration::from_secs(1);

/// A lock state change, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    Locked(LockInfo),
    Unlocked { page_id: Uuid, previous_holder: Uuid, reason: UnlockReason },
}

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireResult {
    /// Lock granted.
    Granted(LockInfo),
    /// Caller already held the lock; it was extended.
    Renewed(LockInfo),
    /// Another user holds a live lock.
    Denied { current_holder: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatDenial {
    NotHolder,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    Renewed(LockInfo),
    Denied(HeartbeatDenial),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseResult {
    Released,
    NotHolder,
}

#[derive(Debug, Clone)]
struct LockSlot {
    info: LockInfo,
    ttl: Duration,
}

#[derive(Debug, Default)]
pub struct LockManager {
    locks: HashMap<Uuid, LockSlot>,
    events: Vec<LockEvent>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant the lock if nobody holds a live one. The current holder
    /// re-acquiring gets its lock extended.
    pub fn acquire(
        &mut self,
        page_id: Uuid,
        user_id: Uuid,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> AcquireResult {
        self.purge_if_expired(page_id, now);
        let ttl = ttl.max(MIN_LOCK_TTL);

        if let Some(slot) = self.locks.get_mut(&page_id) {
            if slot.info.holder_id != user_id {
                return AcquireResult::Denied { current_holder: slot.info.holder_id };
            }
            slot.ttl = ttl;
            slot.info.expires_at = expires_at_with_ttl(now, ttl);
            let info = slot.info.clone();
            self.events.push(LockEvent::Locked(info.clone()));
            return AcquireResult::Renewed(info);
        }

        let info = LockInfo {
            page_id,
            holder_id: user_id,
            acquired_at: now,
            expires_at: expires_at_with_ttl(now, ttl),
        };
        self.locks.insert(page_id, LockSlot { info: info.clone(), ttl });
        self.events.push(LockEvent::Locked(info.clone()));
        AcquireResult::Granted(info)
    }

    /// Extend the caller's lock by its TTL, measured from `now`.
    pub fn heartbeat(
        &mut self,
        page_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> HeartbeatResult {
        let Some(slot) = self.locks.get(&page_id) else {
            return HeartbeatResult::Denied(HeartbeatDenial::NotHolder);
        };

        if slot.info.is_expired_at(now) {
            let was_holder = slot.info.holder_id == user_id;
            self.purge_if_expired(page_id, now);
            return HeartbeatResult::Denied(if was_holder {
                HeartbeatDenial::Expired
            } else {
                HeartbeatDenial::NotHolder
            });
        }

        if slot.info.holder_id != user_id {
            return HeartbeatResult::Denied(HeartbeatDenial::NotHolder);
        }

        let Some(slot) = self.locks.get_mut(&page_id) else {
            return HeartbeatResult::Denied(HeartbeatDenial::NotHolder);
        };
        slot.info.expires_at = expires_at_with_ttl(now, slot.ttl);
        HeartbeatResult::Renewed(slot.info.clone())
    }

    pub fn release(&mut self, page_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> ReleaseResult {
        self.purge_if_expired(page_id, now);

        match self.locks.get(&page_id) {
            Some(slot) if slot.info.holder_id == user_id => {
                self.locks.remove(&page_id);
                self.events.push(LockEvent::Unlocked {
                    page_id,
                    previous_holder: user_id,
                    reason: UnlockReason::Released,
                });
                ReleaseResult::Released
            }
            _ => ReleaseResult::NotHolder,
        }
    }

    /// Forced release. Authorization is the caller's job. Returns the lock
    /// that was removed, if a live one existed.
    pub fn break_lock(
        &mut self,
        page_id: Uuid,
        actor_id: Uuid,
        now: DateTime<Utc>,
    ) -> Option<LockInfo> {
        self.purge_if_expired(page_id, now);
        let slot = self.locks.remove(&page_id)?;
        debug!(
            page_id = %page_id,
            actor_id = %actor_id,
            holder_id = %slot.info.holder_id,
            "page lock broken"
        );
        self.events.push(LockEvent::Unlocked {
            page_id,
            previous_holder: slot.info.holder_id,
            reason: UnlockReason::Broken,
        });
        Some(slot.info)
    }

    /// Release on behalf of a disconnected holder. No-op for anyone else.
    pub fn release_for_disconnect(
        &mut self,
        page_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> bool {
        self.purge_if_expired(page_id, now);
        match self.locks.get(&page_id) {
            Some(slot) if slot.info.holder_id == user_id => {
                self.locks.remove(&page_id);
                self.events.push(LockEvent::Unlocked {
                    page_id,
                    previous_holder: user_id,
                    reason: UnlockReason::Disconnected,
                });
                true
            }
            _ => false,
        }
    }

    /// The live lock for a page, if any.
    pub fn current(&mut self, page_id: Uuid, now: DateTime<Utc>) -> Option<LockInfo> {
        self.purge_if_expired(page_id, now);
        self.locks.get(&page_id).map(|slot| slot.info.clone())
    }

    /// Reinstate a lock loaded from durable storage. Already-expired locks
    /// are dropped without an event.
    pub fn restore(&mut self, lock: LockInfo, ttl: Duration, now: DateTime<Utc>) {
        if lock.is_expired_at(now) {
            return;
        }
        self.locks.insert(lock.page_id, LockSlot { info: lock, ttl: ttl.max(MIN_LOCK_TTL) });
    }

    /// Purge every expired lock. Used by the periodic sweep so clients see
    /// `unlock_page` without waiting for the next touch.
    pub fn expire_due(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Uuid> = self
            .locks
            .iter()
            .filter(|(_, slot)| slot.info.is_expired_at(now))
            .map(|(page_id, _)| *page_id)
            .collect();

        for page_id in &expired {
            self.purge_if_expired(*page_id, now);
        }
        expired.len()
    }

    /// Take the queued lock events.
    pub fn drain_events(&mut self) -> Vec<LockEvent> {
        std::mem::take(&mut self.events)
    }

    fn purge_if_expired(&mut self, page_id: Uuid, now: DateTime<Utc>) {
        let expired = self.locks.get(&page_id).is_some_and(|slot| slot.info.is_expired_at(now));
        if !expired {
            return;
        }
        if let Some(slot) = self.locks.remove(&page_id) {
            debug!(page_id = %page_id, holder_id = %slot.info.holder_id, "page lock expired");
            self.events.push(LockEvent::Unlocked {
                page_id,
                previous_holder: slot.info.holder_id,
                reason: UnlockReason::Expired,
            });
        }
    }
}

fn expires_at_with_ttl(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl)
        .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)))
}
