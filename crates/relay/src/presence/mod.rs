// Presence aggregation (who is on a page, and where their cursor is).
//
// Entries are ephemeral and keyed by (page_id, user_id): several clients of
// one user on one page collapse into a single entry. Cursor updates for
// users that never joined are dropped and logged; they never fail a session.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use onezone_common::types::{PresenceEntry, SelectionRange};
use tracing::debug;
use uuid::Uuid;

/// Default inactivity threshold before an entry is swept.
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug)]
pub struct PresenceTracker {
    inactivity: chrono::Duration,
    entries: HashMap<Uuid, HashMap<Uuid, PresenceEntry>>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TIMEOUT)
    }
}

impl PresenceTracker {
    pub fn new(inactivity: Duration) -> Self {
        Self {
            inactivity: chrono::Duration::from_std(inactivity)
                .unwrap_or_else(|_| chrono::Duration::seconds(90)),
            entries: HashMap::new(),
        }
    }

    /// Add the user to the page, or refresh `last_active_at` if present.
    pub fn join(&mut self, page_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> PresenceEntry {
        let entry = self
            .entries
            .entry(page_id)
            .or_default()
            .entry(user_id)
            .or_insert_with(|| PresenceEntry {
                page_id,
                user_id,
                cursor_position: None,
                selection: None,
                last_active_at: now,
            });
        if now > entry.last_active_at {
            entry.last_active_at = now;
        }
        entry.clone()
    }

    /// Record a cursor move. Returns the updated entry, or `None` when the
    /// user has no entry on the page.
    pub fn update_cursor(
        &mut self,
        page_id: Uuid,
        user_id: Uuid,
        position: u32,
        selection: Option<SelectionRange>,
        now: DateTime<Utc>,
    ) -> Option<PresenceEntry> {
        let Some(entry) = self.entries.get_mut(&page_id).and_then(|page| page.get_mut(&user_id))
        else {
            debug!(page_id = %page_id, user_id = %user_id, "cursor update without presence entry");
            return None;
        };

        entry.cursor_position = Some(position);
        entry.selection = selection;
        if now > entry.last_active_at {
            entry.last_active_at = now;
        }
        Some(entry.clone())
    }

    /// Mark the user as active without moving the cursor.
    pub fn touch(&mut self, page_id: Uuid, user_id: Uuid, now: DateTime<Utc>) {
        let entry = self.entries.get_mut(&page_id).and_then(|page| page.get_mut(&user_id));
        if let Some(entry) = entry {
            if now > entry.last_active_at {
                entry.last_active_at = now;
            }
        }
    }

    /// Remove the user from the page. Returns whether an entry existed.
    pub fn leave(&mut self, page_id: Uuid, user_id: Uuid) -> bool {
        let Some(page) = self.entries.get_mut(&page_id) else {
            return false;
        };
        let removed = page.remove(&user_id).is_some();
        if page.is_empty() {
            self.entries.remove(&page_id);
        }
        removed
    }

    /// Drop entries idle for longer than the inactivity threshold.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> BTreeSet<(Uuid, Uuid)> {
        let cutoff = now - self.inactivity;
        let mut removed = BTreeSet::new();

        self.entries.retain(|page_id, page| {
            page.retain(|user_id, entry| {
                let keep = entry.last_active_at >= cutoff;
                if !keep {
                    removed.insert((*page_id, *user_id));
                }
                keep
            });
            !page.is_empty()
        });

        removed
    }

    /// Entries for a page, most recently active first.
    pub fn roster(&self, page_id: Uuid) -> Vec<PresenceEntry> {
        let mut roster: Vec<PresenceEntry> = self
            .entries
            .get(&page_id)
            .map(|page| page.values().cloned().collect())
            .unwrap_or_default();
        roster.sort_by(|a, b| {
            b.last_active_at.cmp(&a.last_active_at).then_with(|| a.user_id.cmp(&b.user_id))
        });
        roster
    }

    pub fn is_present(&self, page_id: Uuid, user_id: Uuid) -> bool {
        self.entries.get(&page_id).is_some_and(|page| page.contains_key(&user_id))
    }

    pub fn count(&self, page_id: Uuid) -> usize {
        self.entries.get(&page_id).map_or(0, HashMap::len)
    }
}
