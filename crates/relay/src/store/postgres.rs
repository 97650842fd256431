use chrono::{DateTime, Utc};
use onezone_common::types::{LockInfo, PageContent, PageVersion};
use sqlx::PgPool;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use super::{NewPage, PageMetadata, StoreError, StoredPage};

#[derive(Debug, sqlx::FromRow)]
struct PageRow {
    id: Uuid,
    workspace_id: Uuid,
    name: String,
    content: serde_json::Value,
    content_html: String,
    is_locked: bool,
    locked_by: Option<Uuid>,
    locked_at: Option<DateTime<Utc>>,
    lock_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct VersionRow {
    page_id: Uuid,
    version_number: i32,
    name: String,
    content: serde_json::Value,
    content_html: String,
    change_summary: Option<String>,
    created_by: Uuid,
    created_at: DateTime<Utc>,
}

impl From<VersionRow> for PageVersion {
    fn from(row: VersionRow) -> Self {
        PageVersion {
            page_id: row.page_id,
            version_number: row.version_number,
            name: row.name,
            content: row.content,
            content_html: row.content_html,
            change_summary: row.change_summary,
            created_by: row.created_by,
            created_at: row.created_at,
        }
    }
}

impl TryFrom<PageRow> for StoredPage {
    type Error = StoreError;

    fn try_from(row: PageRow) -> Result<Self, Self::Error> {
        let lock = match (row.is_locked, row.locked_by, row.locked_at, row.lock_expires_at) {
            (false, ..) => None,
            (true, Some(holder_id), Some(acquired_at), Some(expires_at)) => {
                Some(LockInfo { page_id: row.id, holder_id, acquired_at, expires_at })
            }
            (true, ..) => {
                return Err(StoreError::Corrupt(format!(
                    "page {} is locked without holder or expiry",
                    row.id
                )))
            }
        };

        Ok(StoredPage {
            page_id: row.id,
            workspace_id: row.workspace_id,
            content: PageContent {
                name: row.name,
                content: row.content,
                content_html: row.content_html,
            },
            lock,
        })
    }
}

const VERSION_COLUMNS: &str = "page_id, version_number, name, content, content_html, \
                               change_summary, created_by, created_at";

pub(super) async fn create_page(pool: &PgPool, page: &NewPage) -> Result<(), StoreError> {
    sqlx::query(
        r#"
INSERT INTO pages (id, workspace_id, created_by, name, content, content_html, is_private)
VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(page.page_id)
    .bind(page.workspace_id)
    .bind(page.created_by)
    .bind(&page.content.name)
    .bind(&page.content.content)
    .bind(&page.content.content_html)
    .bind(page.is_private)
    .execute(pool)
    .instrument(info_span!("relay.db.query", query = "insert_page"))
    .await?;

    Ok(())
}

pub(super) async fn load_page(pool: &PgPool, page_id: Uuid) -> Result<StoredPage, StoreError> {
    let row = sqlx::query_as::<_, PageRow>(
        r#"
SELECT id, workspace_id, name, content, content_html,
       is_locked, locked_by, locked_at, lock_expires_at
FROM pages
WHERE id = $1
  AND archived_at IS NULL
  AND deleted_at IS NULL
        "#,
    )
    .bind(page_id)
    .fetch_optional(pool)
    .instrument(info_span!("relay.db.query", query = "load_page"))
    .await?
    .ok_or(StoreError::PageNotFound(page_id))?;

    row.try_into()
}

pub(super) async fn save_page(
    pool: &PgPool,
    page_id: Uuid,
    content: &PageContent,
    metadata: &PageMetadata,
) -> Result<(), StoreError> {
    let lock = metadata.lock.as_ref();
    let updated = sqlx::query(
        r#"
UPDATE pages
SET name = $2,
    content = $3,
    content_html = $4,
    is_locked = $5,
    locked_by = $6,
    locked_at = $7,
    lock_expires_at = $8,
    updated_at = now()
WHERE id = $1
  AND deleted_at IS NULL
        "#,
    )
    .bind(page_id)
    .bind(&content.name)
    .bind(&content.content)
    .bind(&content.content_html)
    .bind(lock.is_some())
    .bind(lock.map(|l| l.holder_id))
    .bind(lock.map(|l| l.acquired_at))
    .bind(lock.map(|l| l.expires_at))
    .execute(pool)
    .instrument(info_span!("relay.db.query", query = "save_page"))
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(StoreError::PageNotFound(page_id));
    }
    Ok(())
}

pub(super) async fn latest_version(
    pool: &PgPool,
    page_id: Uuid,
) -> Result<Option<PageVersion>, StoreError> {
    let row = sqlx::query_as::<_, VersionRow>(&format!(
        "SELECT {VERSION_COLUMNS} FROM page_versions WHERE page_id = $1 \
         ORDER BY version_number DESC LIMIT 1"
    ))
    .bind(page_id)
    .fetch_optional(pool)
    .instrument(info_span!("relay.db.query", query = "latest_page_version"))
    .await?;

    Ok(row.map(Into::into))
}

pub(super) async fn version(
    pool: &PgPool,
    page_id: Uuid,
    version_number: i32,
) -> Result<Option<PageVersion>, StoreError> {
    let row = sqlx::query_as::<_, VersionRow>(&format!(
        "SELECT {VERSION_COLUMNS} FROM page_versions WHERE page_id = $1 AND version_number = $2"
    ))
    .bind(page_id)
    .bind(version_number)
    .fetch_optional(pool)
    .instrument(info_span!("relay.db.query", query = "fetch_page_version"))
    .await?;

    Ok(row.map(Into::into))
}

pub(super) async fn append_version(pool: &PgPool, version: &PageVersion) -> Result<(), StoreError> {
    // The WHERE clause rejects gaps; the primary key rejects duplicates.
    let result = sqlx::query(
        r#"
INSERT INTO page_versions
    (page_id, version_number, name, content, content_html, change_summary, created_by, created_at)
SELECT $1, $2, $3, $4, $5, $6, $7, $8
WHERE (
    SELECT COALESCE(MAX(version_number), 0) + 1
    FROM page_versions
    WHERE page_id = $1
) = $2
        "#,
    )
    .bind(version.page_id)
    .bind(version.version_number)
    .bind(&version.name)
    .bind(&version.content)
    .bind(&version.content_html)
    .bind(&version.change_summary)
    .bind(version.created_by)
    .bind(version.created_at)
    .execute(pool)
    .instrument(info_span!("relay.db.query", query = "insert_page_version"))
    .await;

    let conflict = || StoreError::VersionConflict {
        page_id: version.page_id,
        version_number: version.version_number,
    };

    match result {
        Ok(done) if done.rows_affected() == 1 => Ok(()),
        Ok(_) => Err(conflict()),
        Err(sqlx::Error::Database(db_error)) if db_error.is_unique_violation() => Err(conflict()),
        Err(sqlx::Error::Database(db_error)) if db_error.is_foreign_key_violation() => {
            Err(StoreError::PageNotFound(version.page_id))
        }
        Err(error) => Err(error.into()),
    }
}

pub(super) async fn list_versions(
    pool: &PgPool,
    page_id: Uuid,
    before: Option<i32>,
    limit: usize,
) -> Result<Vec<PageVersion>, StoreError> {
    let rows = sqlx::query_as::<_, VersionRow>(&format!(
        "SELECT {VERSION_COLUMNS} FROM page_versions \
         WHERE page_id = $1 AND ($2::INTEGER IS NULL OR version_number < $2) \
         ORDER BY version_number DESC LIMIT $3"
    ))
    .bind(page_id)
    .bind(before)
    .bind(limit as i64)
    .fetch_all(pool)
    .instrument(info_span!("relay.db.query", query = "list_page_versions"))
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

pub(super) async fn archive_page(pool: &PgPool, page_id: Uuid) -> Result<(), StoreError> {
    let updated = sqlx::query(
        "UPDATE pages SET archived_at = now() WHERE id = $1 AND archived_at IS NULL",
    )
    .bind(page_id)
    .execute(pool)
    .instrument(info_span!("relay.db.query", query = "archive_page"))
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(StoreError::PageNotFound(page_id));
    }
    Ok(())
}
