// Page-level authorization backed by workspace membership.

use std::collections::HashMap;
use std::sync::Arc;

use onezone_common::types::WorkspaceRole;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::store::StoreError;

/// What a caller wants to do with a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAction {
    /// Join, read content, lock status, history and presence.
    View,
    /// Mutate, hold the lock, snapshot and restore.
    Edit,
    /// Force-release somebody else's lock.
    BreakLock,
}

impl PageAction {
    pub const fn required_role(self) -> WorkspaceRole {
        match self {
            Self::View => WorkspaceRole::Guest,
            Self::Edit => WorkspaceRole::Member,
            Self::BreakLock => WorkspaceRole::Admin,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Edit => "edit",
            Self::BreakLock => "break_lock",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageAccess {
    workspace_id: Uuid,
    created_by: Uuid,
    is_private: bool,
}

#[derive(Debug, Default)]
pub struct MemoryAccessStore {
    pages: HashMap<Uuid, PageAccess>,
    members: HashMap<(Uuid, Uuid), WorkspaceRole>,
}

#[derive(Clone)]
pub enum PageAccessPolicy {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryAccessStore>>),
}

impl PageAccessPolicy {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryAccessStore::default())))
    }

    /// Whether `user_id` may perform `action` on the page. Unknown pages are
    /// `PageNotFound`; a stranger to the workspace is simply denied.
    pub async fn authorize(
        &self,
        user_id: Uuid,
        page_id: Uuid,
        action: PageAction,
    ) -> Result<bool, StoreError> {
        let (page, role) = match self {
            Self::Postgres(pool) => access_pg(pool, user_id, page_id).await?,
            Self::Memory(store) => {
                let guard = store.read().await;
                let page = *guard.pages.get(&page_id).ok_or(StoreError::PageNotFound(page_id))?;
                let role = guard.members.get(&(page.workspace_id, user_id)).copied();
                (page, role)
            }
        };

        Ok(decide(page, role, user_id, action))
    }

    /// Register a page with the in-memory policy. No-op for Postgres, where
    /// `pages` is the source of truth.
    pub async fn register_page(
        &self,
        page_id: Uuid,
        workspace_id: Uuid,
        created_by: Uuid,
        is_private: bool,
    ) {
        if let Self::Memory(store) = self {
            store
                .write()
                .await
                .pages
                .insert(page_id, PageAccess { workspace_id, created_by, is_private });
        }
    }

    /// Give `user_id` a role in the workspace (in-memory policy only).
    pub async fn grant(&self, workspace_id: Uuid, user_id: Uuid, role: WorkspaceRole) {
        if let Self::Memory(store) = self {
            store.write().await.members.insert((workspace_id, user_id), role);
        }
    }
}

fn decide(
    page: PageAccess,
    role: Option<WorkspaceRole>,
    user_id: Uuid,
    action: PageAction,
) -> bool {
    let Some(role) = role else {
        return false;
    };
    if page.is_private && page.created_by != user_id && !role.allows(WorkspaceRole::Admin) {
        return false;
    }
    role.allows(action.required_role())
}

#[derive(Debug, sqlx::FromRow)]
struct AccessRow {
    workspace_id: Uuid,
    created_by: Uuid,
    is_private: bool,
    role: Option<String>,
}

async fn access_pg(
    pool: &PgPool,
    user_id: Uuid,
    page_id: Uuid,
) -> Result<(PageAccess, Option<WorkspaceRole>), StoreError> {
    let row = sqlx::query_as::<_, AccessRow>(
        r#"
SELECT p.workspace_id, p.created_by, p.is_private, m.role
FROM pages p
LEFT JOIN workspace_members m
  ON m.workspace_id = p.workspace_id
 AND m.user_id = $2
 AND m.status = 'active'
WHERE p.id = $1
  AND p.archived_at IS NULL
  AND p.deleted_at IS NULL
        "#,
    )
    .bind(page_id)
    .bind(user_id)
    .fetch_optional(pool)
    .instrument(info_span!("relay.db.query", query = "page_access"))
    .await?
    .ok_or(StoreError::PageNotFound(page_id))?;

    let role = row
        .role
        .map(|value| {
            WorkspaceRole::from_db_value(&value)
                .ok_or_else(|| StoreError::Corrupt(format!("invalid workspace role '{value}'")))
        })
        .transpose()?;

    Ok((
        PageAccess {
            workspace_id: row.workspace_id,
            created_by: row.created_by,
            is_private: row.is_private,
        },
        role,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn policy_with_page(is_private: bool) -> (PageAccessPolicy, Uuid, Uuid, Uuid) {
        let policy = PageAccessPolicy::memory();
        let (page_id, workspace_id, creator) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        policy.register_page(page_id, workspace_id, creator, is_private).await;
        policy.grant(workspace_id, creator, WorkspaceRole::Member).await;
        (policy, page_id, workspace_id, creator)
    }

    #[tokio::test]
    async fn roles_map_to_actions() {
        let (policy, page_id, workspace_id, _) = policy_with_page(false).await;
        let guest = Uuid::new_v4();
        let member = Uuid::new_v4();
        let admin = Uuid::new_v4();
        policy.grant(workspace_id, guest, WorkspaceRole::Guest).await;
        policy.grant(workspace_id, member, WorkspaceRole::Member).await;
        policy.grant(workspace_id, admin, WorkspaceRole::Admin).await;

        assert!(policy.authorize(guest, page_id, PageAction::View).await.unwrap());
        assert!(!policy.authorize(guest, page_id, PageAction::Edit).await.unwrap());
        assert!(policy.authorize(member, page_id, PageAction::Edit).await.unwrap());
        assert!(!policy.authorize(member, page_id, PageAction::BreakLock).await.unwrap());
        assert!(policy.authorize(admin, page_id, PageAction::BreakLock).await.unwrap());
    }

    #[tokio::test]
    async fn non_members_are_denied() {
        let (policy, page_id, _, _) = policy_with_page(false).await;
        assert!(!policy.authorize(Uuid::new_v4(), page_id, PageAction::View).await.unwrap());
    }

    #[tokio::test]
    async fn private_pages_admit_creator_and_admins_only() {
        let (policy, page_id, workspace_id, creator) = policy_with_page(true).await;
        let member = Uuid::new_v4();
        let owner = Uuid::new_v4();
        policy.grant(workspace_id, member, WorkspaceRole::Member).await;
        policy.grant(workspace_id, owner, WorkspaceRole::Owner).await;

        assert!(policy.authorize(creator, page_id, PageAction::Edit).await.unwrap());
        assert!(!policy.authorize(member, page_id, PageAction::View).await.unwrap());
        assert!(policy.authorize(owner, page_id, PageAction::View).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_page_is_not_found() {
        let policy = PageAccessPolicy::memory();
        let result = policy.authorize(Uuid::new_v4(), Uuid::new_v4(), PageAction::View).await;
        assert!(matches!(result, Err(StoreError::PageNotFound(_))));
    }
}
