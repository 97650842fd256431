// WebSocket message types for the onezone-page.v1 protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mutation::PageMutation;
use crate::types::{LockInfo, PageContent, PresenceEntry, SelectionRange};

pub const CURRENT_PROTOCOL_VERSION: &str = "onezone-page.v1";
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[CURRENT_PROTOCOL_VERSION];

/// Commands a client sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open (or re-open) a page session.
    Join { page_id: Uuid },

    Leave { page_id: Uuid },

    /// Apply an edit. Rejected while another user holds the lock.
    Mutate {
        page_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        op: PageMutation,
    },

    AcquireLock { page_id: Uuid },

    ReleaseLock { page_id: Uuid },

    /// Extend the caller's lock by one TTL.
    Heartbeat { page_id: Uuid },

    CursorUpdate {
        page_id: Uuid,
        position: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection: Option<SelectionRange>,
    },

    RestoreVersion {
        page_id: Uuid,
        version_number: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ClientMessage {
    pub fn page_id(&self) -> Uuid {
        match self {
            Self::Join { page_id }
            | Self::Leave { page_id }
            | Self::Mutate { page_id, .. }
            | Self::AcquireLock { page_id }
            | Self::ReleaseLock { page_id }
            | Self::Heartbeat { page_id }
            | Self::CursorUpdate { page_id, .. }
            | Self::RestoreVersion { page_id, .. } => *page_id,
        }
    }

    /// Wire tag, used as the metrics endpoint label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Mutate { .. } => "mutate",
            Self::AcquireLock { .. } => "acquire_lock",
            Self::ReleaseLock { .. } => "release_lock",
            Self::Heartbeat { .. } => "heartbeat",
            Self::CursorUpdate { .. } => "cursor_update",
            Self::RestoreVersion { .. } => "restore_version",
        }
    }
}

/// Why a lock went away.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnlockReason {
    Released,
    Expired,
    Broken,
    Disconnected,
}

/// Events and replies the relay sends to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after the socket is accepted.
    Connect {
        connection_id: Uuid,
        user_id: Uuid,
        protocol: String,
        server_time: DateTime<Utc>,
        heartbeat_interval_ms: u32,
    },

    /// Sent before the relay closes the socket.
    Disconnect { reason: String },

    JoinPage { page_id: Uuid, user_id: Uuid },

    LeavePage { page_id: Uuid, user_id: Uuid },

    /// An accepted mutation, in session order.
    PageUpdate { page_id: Uuid, seq: u64, actor_id: Uuid, op: PageMutation },

    /// Current roster plus lock summary.
    UserPresence {
        page_id: Uuid,
        active_users: Vec<PresenceEntry>,
        locked: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locked_by: Option<Uuid>,
    },

    CursorUpdate {
        page_id: Uuid,
        user_id: Uuid,
        position: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection: Option<SelectionRange>,
    },

    LockPage { page_id: Uuid, locked_by: Uuid, expires_at: DateTime<Utc> },

    UnlockPage {
        page_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_holder: Option<Uuid>,
        reason: UnlockReason,
    },

    NewComment { page_id: Uuid, comment: serde_json::Value },

    /// Reply to `join`: the full live state of the page.
    PageState {
        page_id: Uuid,
        seq: u64,
        page: PageContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lock: Option<LockInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latest_version: Option<i32>,
        active_users: Vec<PresenceEntry>,
    },

    /// Reply to a command that succeeded.
    Ack {
        page_id: Uuid,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version_number: Option<i32>,
    },

    Error {
        code: String,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}
