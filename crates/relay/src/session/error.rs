use axum::response::{IntoResponse, Response};
use onezone_common::mutation::MutationError;
use onezone_common::protocol::ws::ServerMessage;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{ErrorCode, RelayError};
use crate::store::StoreError;
use crate::versions::VersionError;

/// Why an operation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Unauthorized,
    LockedBy { holder: Uuid },
    NotHolder,
    Expired,
}

impl DenyReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::LockedBy { .. } => "locked_by",
            Self::NotHolder => "not_holder",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("denied: {}", .0.as_str())]
    Denied(DenyReason),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("version {version_number} of page {page_id} conflicts with the ledger")]
    VersionConflict { page_id: Uuid, version_number: i32 },
    #[error("page session is owned by relay node {owner}")]
    OwnedElsewhere { owner: Uuid },
    #[error("page session is unavailable")]
    Unavailable,
    #[error("storage temporarily unavailable: {0}")]
    Transient(String),
    #[error("page session failed: {0}")]
    Fatal(String),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Denied(DenyReason::Unauthorized) => ErrorCode::AuthForbidden,
            Self::Denied(DenyReason::LockedBy { .. }) => ErrorCode::LockHeld,
            Self::Denied(DenyReason::NotHolder) => ErrorCode::LockNotHeld,
            Self::Denied(DenyReason::Expired) => ErrorCode::LockExpired,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Invalid(_) => ErrorCode::ValidationFailed,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::VersionConflict { .. } => ErrorCode::VersionConflict,
            Self::OwnedElsewhere { .. } => ErrorCode::PageOwnedElsewhere,
            Self::Unavailable => ErrorCode::SessionUnavailable,
            Self::Transient(_) | Self::Fatal(_) => ErrorCode::InternalError,
        }
    }

    /// Storage failures worth retrying: the session keeps its in-memory
    /// state and tries again later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    fn details(&self) -> serde_json::Value {
        match self {
            Self::Denied(DenyReason::LockedBy { holder }) => json!({ "locked_by": holder }),
            Self::VersionConflict { version_number, .. } => {
                json!({ "version_number": version_number })
            }
            Self::OwnedElsewhere { owner } => json!({ "owner_node_id": owner }),
            _ => json!({}),
        }
    }

    pub fn to_relay_error(&self) -> RelayError {
        let error = RelayError::new(self.code(), self.to_string()).with_details(self.details());
        match self {
            Self::RateLimited { retry_after_secs } => error.with_retry_after(*retry_after_secs),
            _ => error,
        }
    }

    /// Error reply on the WebSocket.
    pub fn to_message(&self, page_id: Option<Uuid>) -> ServerMessage {
        let code = self.code();
        let details = self.details();
        ServerMessage::Error {
            code: code.as_str().to_string(),
            message: self.to_string(),
            retryable: code.retryable(),
            page_id,
            details: details.as_object().filter(|map| !map.is_empty()).map(|_| details.clone()),
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::PageNotFound(page_id) => Self::NotFound(format!("page {page_id}")),
            StoreError::VersionConflict { page_id, version_number } => {
                Self::VersionConflict { page_id, version_number }
            }
            StoreError::Corrupt(message) => Self::Fatal(message),
            StoreError::Database(error) => Self::Transient(error.to_string()),
            StoreError::Unavailable(message) => Self::Transient(message),
        }
    }
}

impl From<VersionError> for SessionError {
    fn from(error: VersionError) -> Self {
        match error {
            VersionError::NotFound { page_id, version_number } => {
                Self::NotFound(format!("version {version_number} of page {page_id}"))
            }
            VersionError::Conflict { page_id, version_number } => {
                Self::VersionConflict { page_id, version_number }
            }
            VersionError::OutOfOrder { .. } => Self::Fatal(error.to_string()),
            VersionError::InvalidCursor => Self::Invalid(error.to_string()),
            VersionError::Store(store) => store.into(),
        }
    }
}

impl From<MutationError> for SessionError {
    fn from(error: MutationError) -> Self {
        Self::Invalid(error.to_string())
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        self.to_relay_error().into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn taxonomy_maps_to_status_codes() {
        let holder = Uuid::new_v4();
        let cases = [
            (SessionError::Denied(DenyReason::Unauthorized), StatusCode::FORBIDDEN),
            (SessionError::Denied(DenyReason::LockedBy { holder }), StatusCode::FORBIDDEN),
            (SessionError::Denied(DenyReason::NotHolder), StatusCode::FORBIDDEN),
            (SessionError::NotFound("page".into()), StatusCode::NOT_FOUND),
            (SessionError::Invalid("bad".into()), StatusCode::BAD_REQUEST),
            (
                SessionError::VersionConflict { page_id: holder, version_number: 2 },
                StatusCode::CONFLICT,
            ),
            (SessionError::RateLimited { retry_after_secs: 3 }, StatusCode::TOO_MANY_REQUESTS),
            (SessionError::OwnedElsewhere { owner: holder }, StatusCode::SERVICE_UNAVAILABLE),
            (SessionError::Unavailable, StatusCode::SERVICE_UNAVAILABLE),
            (SessionError::Transient("io".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (SessionError::Fatal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, status) in cases {
            assert_eq!(error.clone().into_response().status(), status, "{error:?}");
        }
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let response = SessionError::RateLimited { retry_after_secs: 7 }.into_response();
        assert_eq!(response.headers()["retry-after"], "7");
    }

    #[test]
    fn locked_by_error_message_names_holder() {
        let holder = Uuid::new_v4();
        let ServerMessage::Error { code, details, retryable, .. } =
            SessionError::Denied(DenyReason::LockedBy { holder }).to_message(None)
        else {
            panic!("expected error message");
        };
        assert_eq!(code, "LOCK_HELD");
        assert!(!retryable);
        assert_eq!(details.unwrap()["locked_by"], json!(holder));
    }

    #[test]
    fn store_errors_classify() {
        assert!(SessionError::from(StoreError::Unavailable("down".into())).is_transient());
        assert!(matches!(
            SessionError::from(StoreError::Corrupt("bad row".into())),
            SessionError::Fatal(_)
        ));
        assert!(matches!(
            SessionError::from(VersionError::OutOfOrder { expected: 2, actual: 4 }),
            SessionError::Fatal(_)
        ));
    }
}
