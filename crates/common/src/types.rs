// Core domain types shared by the relay engine and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of a page name, in characters.
pub const MAX_PAGE_NAME_CHARS: usize = 500;

/// Live, editable content of a page.
///
/// `content` is the editor's document tree (TipTap-style JSON). The relay
/// treats it as opaque structure; `content_html` is a derived form supplied
/// by the editor and stored alongside it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageContent {
    pub name: String,
    #[serde(default = "empty_document")]
    pub content: serde_json::Value,
    #[serde(default)]
    pub content_html: String,
}

impl PageContent {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), content: empty_document(), content_html: String::new() }
    }

    /// True when name and document tree are identical. The derived HTML is
    /// ignored since it always follows the tree.
    pub fn same_document(&self, other: &PageContent) -> bool {
        self.name == other.name && self.content == other.content
    }
}

/// An empty editor document: `{"type":"doc","content":[]}`.
pub fn empty_document() -> serde_json::Value {
    serde_json::json!({ "type": "doc", "content": [] })
}

/// Immutable historical snapshot of a page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageVersion {
    pub page_id: Uuid,
    /// 1-based, contiguous per page.
    pub version_number: i32,
    pub name: String,
    pub content: serde_json::Value,
    pub content_html: String,
    pub change_summary: Option<String>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

impl PageVersion {
    pub fn page_content(&self) -> PageContent {
        PageContent {
            name: self.name.clone(),
            content: self.content.clone(),
            content_html: self.content_html.clone(),
        }
    }
}

/// Exclusive edit right over a page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    pub page_id: Uuid,
    pub holder_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// A lock whose `expires_at` has been reached no longer exists.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Selection range in editor positions. `from == to` is a collapsed caret.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionRange {
    pub from: u32,
    pub to: u32,
}

/// One user's presence on a page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceEntry {
    pub page_id: Uuid,
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRange>,
    pub last_active_at: DateTime<Utc>,
}

/// The "who is here and who holds the pen" view of a page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollaborationSession {
    pub page_id: Uuid,
    pub active_users: Vec<PresenceEntry>,
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<Uuid>,
}

/// Workspace membership role. Higher levels include lower ones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceRole {
    Guest,
    Member,
    Admin,
    Owner,
}

impl WorkspaceRole {
    pub const fn level(self) -> u8 {
        match self {
            Self::Guest => 5,
            Self::Member => 10,
            Self::Admin => 15,
            Self::Owner => 20,
        }
    }

    pub fn allows(self, required: WorkspaceRole) -> bool {
        self.level() >= required.level()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::Member => "member",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "guest" => Some(Self::Guest),
            "member" => Some(Self::Member),
            "admin" => Some(Self::Admin),
            "owner" => Some(Self::Owner),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn lock_is_expired_at_its_deadline() {
        let acquired_at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let lock = LockInfo {
            page_id: Uuid::nil(),
            holder_id: Uuid::nil(),
            acquired_at,
            expires_at: acquired_at + chrono::Duration::seconds(30),
        };

        assert!(!lock.is_expired_at(acquired_at + chrono::Duration::seconds(29)));
        assert!(lock.is_expired_at(acquired_at + chrono::Duration::seconds(30)));
    }

    #[test]
    fn role_levels_are_ordered() {
        assert!(WorkspaceRole::Owner.allows(WorkspaceRole::Admin));
        assert!(WorkspaceRole::Admin.allows(WorkspaceRole::Member));
        assert!(!WorkspaceRole::Member.allows(WorkspaceRole::Admin));
        assert!(!WorkspaceRole::Guest.allows(WorkspaceRole::Member));
    }

    #[test]
    fn role_round_trips_through_db_value() {
        for role in [
            WorkspaceRole::Guest,
            WorkspaceRole::Member,
            WorkspaceRole::Admin,
            WorkspaceRole::Owner,
        ] {
            assert_eq!(WorkspaceRole::from_db_value(role.as_str()), Some(role));
        }
        assert_eq!(WorkspaceRole::from_db_value("viewer"), None);
    }

    #[test]
    fn page_content_comparison_ignores_html() {
        let a = PageContent::new("Roadmap");
        let mut b = a.clone();
        b.content_html = "<p></p>".into();
        assert!(a.same_document(&b));

        b.name = "Roadmap v2".into();
        assert!(!a.same_document(&b));
    }
}
