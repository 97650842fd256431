// Append-only page version ledger.
//
// Version numbers are allocated from a `VersionLedger` that lives inside the
// page session, so allocation is serialized with every other write to the
// page. The store itself double-checks contiguity and rejects gaps or
// duplicates with a conflict.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use onezone_common::types::{PageContent, PageVersion};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{PageStore, StoreError};

pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 25;
pub const MAX_HISTORY_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("version {version_number} of page {page_id} not found")]
    NotFound { page_id: Uuid, version_number: i32 },
    #[error("version {version_number} of page {page_id} already exists or skips the head")]
    Conflict { page_id: Uuid, version_number: i32 },
    #[error("version ledger out of order: expected {expected}, got {actual}")]
    OutOfOrder { expected: i32, actual: i32 },
    #[error("invalid history cursor")]
    InvalidCursor,
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for VersionError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::VersionConflict { page_id, version_number } => {
                Self::Conflict { page_id, version_number }
            }
            other => Self::Store(other),
        }
    }
}

/// Clamp a requested page size to `1..=MAX_HISTORY_PAGE_SIZE`.
pub fn normalize_page_size(limit: Option<usize>) -> usize {
    match limit {
        Some(0) | None => DEFAULT_HISTORY_PAGE_SIZE,
        Some(value) => value.min(MAX_HISTORY_PAGE_SIZE),
    }
}

/// Stable fingerprint of a page's name and document tree.
pub fn content_digest(content: &PageContent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.name.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.content.to_string().as_bytes());
    hasher.finalize().iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Position in a page's history: everything older than `before`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionCursor {
    pub page_id: Uuid,
    pub before: i32,
}

impl VersionCursor {
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.page_id, self.before))
    }

    /// Decode a cursor, rejecting cursors minted for another page.
    pub fn decode(raw: &str, page_id: Uuid) -> Result<Self, VersionError> {
        let bytes = URL_SAFE_NO_PAD.decode(raw).map_err(|_| VersionError::InvalidCursor)?;
        let text = String::from_utf8(bytes).map_err(|_| VersionError::InvalidCursor)?;
        let (cursor_page, before) = text.split_once(':').ok_or(VersionError::InvalidCursor)?;
        let cursor_page = Uuid::parse_str(cursor_page).map_err(|_| VersionError::InvalidCursor)?;
        let before = before.parse::<i32>().map_err(|_| VersionError::InvalidCursor)?;
        if cursor_page != page_id || before < 1 {
            return Err(VersionError::InvalidCursor);
        }
        Ok(Self { page_id, before })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage {
    pub items: Vec<PageVersion>,
    pub next_cursor: Option<VersionCursor>,
}

/// Per-page numbering state, owned by the page session.
#[derive(Debug, Clone)]
pub struct VersionLedger {
    page_id: Uuid,
    head: i32,
    last_digest: Option<String>,
}

impl VersionLedger {
    pub fn new(page_id: Uuid, latest: Option<&PageVersion>) -> Self {
        Self {
            page_id,
            head: latest.map_or(0, |v| v.version_number),
            last_digest: latest.map(|v| content_digest(&v.page_content())),
        }
    }

    pub fn page_id(&self) -> Uuid {
        self.page_id
    }

    /// Latest committed version number, if any.
    pub fn latest(&self) -> Option<i32> {
        (self.head > 0).then_some(self.head)
    }

    /// True when `content` matches the latest snapshot.
    pub fn is_unchanged(&self, content: &PageContent) -> bool {
        self.last_digest.as_deref() == Some(content_digest(content).as_str())
    }

    fn next_number(&self) -> i32 {
        self.head + 1
    }

    fn record(&mut self, version: &PageVersion) -> Result<(), VersionError> {
        let expected = self.next_number();
        if version.version_number != expected {
            return Err(VersionError::OutOfOrder { expected, actual: version.version_number });
        }
        self.head = version.version_number;
        self.last_digest = Some(content_digest(&version.page_content()));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreOutcome {
    /// Snapshot of unsaved live content taken before restoring, if needed.
    pub before: Option<PageVersion>,
    pub restored: PageVersion,
}

#[derive(Clone)]
pub struct VersionStore {
    store: PageStore,
}

impl VersionStore {
    pub fn new(store: PageStore) -> Self {
        Self { store }
    }

    pub async fn load_ledger(&self, page_id: Uuid) -> Result<VersionLedger, VersionError> {
        let latest = self.store.latest_version(page_id).await?;
        Ok(VersionLedger::new(page_id, latest.as_ref()))
    }

    /// Append `content` as the next version. The ledger only advances when
    /// the store accepted the row.
    pub async fn snapshot(
        &self,
        ledger: &mut VersionLedger,
        content: &PageContent,
        change_summary: Option<String>,
        actor_id: Uuid,
    ) -> Result<PageVersion, VersionError> {
        let version = PageVersion {
            page_id: ledger.page_id,
            version_number: ledger.next_number(),
            name: content.name.clone(),
            content: content.content.clone(),
            content_html: content.content_html.clone(),
            change_summary,
            created_by: actor_id,
            created_at: Utc::now(),
        };

        self.store.append_version(&version).await?;
        ledger.record(&version)?;

        info!(
            page_id = %version.page_id,
            version_number = version.version_number,
            actor_id = %actor_id,
            "page version created"
        );
        Ok(version)
    }

    /// Append a new version carrying the content of `version_number`.
    /// Unsaved live content is snapshotted first so nothing is lost.
    ///
    /// The ledger is append-only, so if the second append fails the
    /// "Before restoring" version stays. It matches the live content, which
    /// makes a retried restore skip straight to the restored version.
    pub async fn restore(
        &self,
        ledger: &mut VersionLedger,
        current: &PageContent,
        version_number: i32,
        actor_id: Uuid,
    ) -> Result<RestoreOutcome, VersionError> {
        let page_id = ledger.page_id;
        let target = self
            .store
            .version(page_id, version_number)
            .await?
            .ok_or(VersionError::NotFound { page_id, version_number })?;

        let before = if ledger.is_unchanged(current) {
            None
        } else {
            Some(
                self.snapshot(
                    ledger,
                    current,
                    Some(format!("Before restoring version {version_number}")),
                    actor_id,
                )
                .await?,
            )
        };

        let restored = match self
            .snapshot(
                ledger,
                &target.page_content(),
                Some(format!("Restored version {version_number}")),
                actor_id,
            )
            .await
        {
            Ok(restored) => restored,
            Err(error) => {
                if let Some(before) = &before {
                    warn!(
                        page_id = %page_id,
                        restoring = version_number,
                        kept_version = before.version_number,
                        error = %error,
                        "restore failed after snapshotting live content"
                    );
                }
                return Err(error);
            }
        };

        Ok(RestoreOutcome { before, restored })
    }

    /// One page of history, newest first.
    pub async fn page(
        &self,
        page_id: Uuid,
        cursor: Option<VersionCursor>,
        page_size: usize,
    ) -> Result<HistoryPage, VersionError> {
        let page_size = page_size.clamp(1, MAX_HISTORY_PAGE_SIZE);
        let mut items = self
            .store
            .list_versions(page_id, cursor.map(|c| c.before), page_size + 1)
            .await?;

        let next_cursor = if items.len() > page_size {
            items.truncate(page_size);
            items.last().map(|v| VersionCursor { page_id, before: v.version_number })
        } else {
            None
        };

        Ok(HistoryPage { items, next_cursor })
    }

    /// Lazy newest-first walk over the whole history.
    pub fn history(&self, page_id: Uuid, cursor: Option<VersionCursor>) -> VersionHistory {
        VersionHistory {
            store: self.clone(),
            page_id,
            cursor,
            page_size: DEFAULT_HISTORY_PAGE_SIZE,
            exhausted: false,
        }
    }
}

/// Pull-based history iterator. Restart from any point with [`VersionHistory::cursor`].
pub struct VersionHistory {
    store: VersionStore,
    page_id: Uuid,
    cursor: Option<VersionCursor>,
    page_size: usize,
    exhausted: bool,
}

impl VersionHistory {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = normalize_page_size(Some(page_size));
        self
    }

    /// Next batch, or `None` once the oldest version has been returned.
    pub async fn next_page(&mut self) -> Result<Option<Vec<PageVersion>>, VersionError> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self.store.page(self.page_id, self.cursor, self.page_size).await?;
        self.cursor = page.next_cursor;
        self.exhausted = page.next_cursor.is_none();

        if page.items.is_empty() {
            return Ok(None);
        }
        Ok(Some(page.items))
    }

    /// Where the next batch starts; `None` at the start or once exhausted.
    pub fn cursor(&self) -> Option<VersionCursor> {
        self.cursor
    }
}
