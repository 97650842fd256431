// Durable page storage: page records (content + lock columns) and the
// append-only version ledger.
//
// Postgres in production; the in-memory variant backs single-process
// development runs and tests.

mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use onezone_common::types::{LockInfo, PageContent, PageVersion};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("page {0} not found")]
    PageNotFound(Uuid),
    #[error("version {version_number} conflicts with the ledger of page {page_id}")]
    VersionConflict { page_id: Uuid, version_number: i32 },
    #[error("stored page data is invalid: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// A live page record as loaded when a session starts.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPage {
    pub page_id: Uuid,
    pub workspace_id: Uuid,
    pub content: PageContent,
    pub lock: Option<LockInfo>,
}

/// Non-content columns written with every page save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageMetadata {
    pub lock: Option<LockInfo>,
}

/// Fields needed to create a page row.
#[derive(Debug, Clone)]
pub struct NewPage {
    pub page_id: Uuid,
    pub workspace_id: Uuid,
    pub created_by: Uuid,
    pub content: PageContent,
    pub is_private: bool,
}

#[derive(Clone)]
pub enum PageStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryPageStore>>),
}

#[derive(Debug, Default)]
pub struct MemoryPageStore {
    pages: HashMap<Uuid, MemoryPage>,
    versions: HashMap<Uuid, Vec<PageVersion>>,
    write_failures: usize,
    writes_before_failure: usize,
    saves: usize,
}

#[derive(Debug, Clone)]
struct MemoryPage {
    workspace_id: Uuid,
    content: PageContent,
    lock: Option<LockInfo>,
    archived_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

impl PageStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryPageStore::default())))
    }

    pub async fn create_page(&self, page: NewPage) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::create_page(pool, &page).await,
            Self::Memory(store) => {
                store.write().await.pages.insert(
                    page.page_id,
                    MemoryPage {
                        workspace_id: page.workspace_id,
                        content: page.content,
                        lock: None,
                        archived_at: None,
                        deleted_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    /// Load a live page. Archived and deleted pages are not found.
    pub async fn load_page(&self, page_id: Uuid) -> Result<StoredPage, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::load_page(pool, page_id).await,
            Self::Memory(store) => {
                let guard = store.read().await;
                let page = guard
                    .pages
                    .get(&page_id)
                    .filter(|page| page.archived_at.is_none() && page.deleted_at.is_none())
                    .ok_or(StoreError::PageNotFound(page_id))?;
                Ok(StoredPage {
                    page_id,
                    workspace_id: page.workspace_id,
                    content: page.content.clone(),
                    lock: page.lock.clone(),
                })
            }
        }
    }

    pub async fn save_page(
        &self,
        page_id: Uuid,
        content: &PageContent,
        metadata: &PageMetadata,
    ) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::save_page(pool, page_id, content, metadata).await,
            Self::Memory(store) => {
                let mut guard = store.write().await;
                guard.take_injected_failure()?;
                let page = guard
                    .pages
                    .get_mut(&page_id)
                    .filter(|page| page.deleted_at.is_none())
                    .ok_or(StoreError::PageNotFound(page_id))?;
                page.content = content.clone();
                page.lock = metadata.lock.clone();
                guard.saves += 1;
                Ok(())
            }
        }
    }

    pub async fn latest_version(&self, page_id: Uuid) -> Result<Option<PageVersion>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::latest_version(pool, page_id).await,
            Self::Memory(store) => Ok(store
                .read()
                .await
                .versions
                .get(&page_id)
                .and_then(|versions| versions.last().cloned())),
        }
    }

    pub async fn version(
        &self,
        page_id: Uuid,
        version_number: i32,
    ) -> Result<Option<PageVersion>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::version(pool, page_id, version_number).await,
            Self::Memory(store) => Ok(store.read().await.versions.get(&page_id).and_then(|versions| {
                versions.iter().find(|v| v.version_number == version_number).cloned()
            })),
        }
    }

    /// Append the next version. The number must be exactly one past the
    /// current head; anything else is a `VersionConflict`.
    pub async fn append_version(&self, version: &PageVersion) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::append_version(pool, version).await,
            Self::Memory(store) => {
                let mut guard = store.write().await;
                guard.take_injected_failure()?;
                if !guard.pages.contains_key(&version.page_id) {
                    return Err(StoreError::PageNotFound(version.page_id));
                }
                let ledger = guard.versions.entry(version.page_id).or_default();
                let head = ledger.last().map_or(0, |v| v.version_number);
                if version.version_number != head + 1 {
                    return Err(StoreError::VersionConflict {
                        page_id: version.page_id,
                        version_number: version.version_number,
                    });
                }
                ledger.push(version.clone());
                Ok(())
            }
        }
    }

    /// Versions older than `before` (exclusive), newest first.
    pub async fn list_versions(
        &self,
        page_id: Uuid,
        before: Option<i32>,
        limit: usize,
    ) -> Result<Vec<PageVersion>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::list_versions(pool, page_id, before, limit).await,
            Self::Memory(store) => Ok(store
                .read()
                .await
                .versions
                .get(&page_id)
                .map(|versions| {
                    versions
                        .iter()
                        .rev()
                        .filter(|v| before.map_or(true, |before| v.version_number < before))
                        .take(limit)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()),
        }
    }

    /// Soft-delete for the memory store; Postgres rows are managed by the
    /// page CRUD service.
    pub async fn archive_page(&self, page_id: Uuid) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::archive_page(pool, page_id).await,
            Self::Memory(store) => {
                let mut guard = store.write().await;
                let page =
                    guard.pages.get_mut(&page_id).ok_or(StoreError::PageNotFound(page_id))?;
                page.archived_at = Some(Utc::now());
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn fail_next_writes(&self, count: usize) {
        if let Self::Memory(store) = self {
            store.write().await.write_failures = count;
        }
    }

    /// Let `skip` writes through, then fail the next `count`.
    #[cfg(test)]
    pub(crate) async fn fail_writes_after(&self, skip: usize, count: usize) {
        if let Self::Memory(store) = self {
            let mut guard = store.write().await;
            guard.writes_before_failure = skip;
            guard.write_failures = count;
        }
    }

    #[cfg(test)]
    pub(crate) async fn save_count(&self) -> usize {
        match self {
            Self::Memory(store) => store.read().await.saves,
            Self::Postgres(_) => 0,
        }
    }
}

impl MemoryPageStore {
    fn take_injected_failure(&mut self) -> Result<(), StoreError> {
        if self.write_failures == 0 {
            return Ok(());
        }
        if self.writes_before_failure > 0 {
            self.writes_before_failure -= 1;
            return Ok(());
        }
        self.write_failures -= 1;
        Err(StoreError::Unavailable("injected write failure".into()))
    }
}
