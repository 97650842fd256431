// Page session ownership leases.
//
// One relay node runs the session for a page at a time. In a single-process
// deployment the in-process registry already guarantees that, so the local
// backend grants every claim. With Postgres, the lease row in
// `page_session_leases` decides which node owns the page; the owning session
// renews it on every sweep tick and releases it when it goes idle.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info_span, Instrument};
use uuid::Uuid;

/// Default lease duration.
pub const DEFAULT_OWNERSHIP_TTL: Duration = Duration::from_secs(60);

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    Granted { lease_id: Uuid },
    /// This node already owned the page; the lease was extended.
    Renewed { lease_id: Uuid },
    Denied { current_owner: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewResult {
    Renewed,
    /// Lease missing or expired.
    NotFound,
    /// Another node owns the page now.
    WrongHolder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseResult {
    Released,
    NotFound,
    WrongHolder,
}

#[derive(Clone)]
enum OwnershipBackend {
    Local,
    Postgres(PgPool),
}

#[derive(Clone)]
pub struct PageOwnership {
    node_id: Uuid,
    ttl: Duration,
    backend: OwnershipBackend,
}

impl PageOwnership {
    pub fn local(node_id: Uuid) -> Self {
        Self { node_id, ttl: DEFAULT_OWNERSHIP_TTL, backend: OwnershipBackend::Local }
    }

    pub fn postgres(pool: PgPool, node_id: Uuid, ttl: Duration) -> Self {
        Self { node_id, ttl, backend: OwnershipBackend::Postgres(pool) }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Claim the page for this node.
    pub async fn claim(&self, page_id: Uuid) -> Result<ClaimResult, sqlx::Error> {
        let OwnershipBackend::Postgres(pool) = &self.backend else {
            return Ok(ClaimResult::Granted { lease_id: Uuid::new_v4() });
        };

        let now = Utc::now();
        let expires_at = expires_at_with_ttl(now, self.ttl);
        let proposed_lease_id = Uuid::new_v4();

        let (holder_id, lease_id) = sqlx::query_as::<_, (Uuid, Uuid)>(
            r#"
INSERT INTO page_session_leases (page_id, node_id, lease_id, acquired_at, expires_at)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (page_id) DO UPDATE
SET node_id = CASE
        WHEN page_session_leases.expires_at <= $4 THEN EXCLUDED.node_id
        ELSE page_session_leases.node_id
    END,
    lease_id = CASE
        WHEN page_session_leases.expires_at <= $4 THEN EXCLUDED.lease_id
        ELSE page_session_leases.lease_id
    END,
    acquired_at = CASE
        WHEN page_session_leases.expires_at <= $4 THEN EXCLUDED.acquired_at
        ELSE page_session_leases.acquired_at
    END,
    expires_at = CASE
        WHEN page_session_leases.expires_at <= $4
            OR page_session_leases.node_id = EXCLUDED.node_id
            THEN EXCLUDED.expires_at
        ELSE page_session_leases.expires_at
    END
RETURNING node_id, lease_id
            "#,
        )
        .bind(page_id)
        .bind(self.node_id)
        .bind(proposed_lease_id)
        .bind(now)
        .bind(expires_at)
        .fetch_one(pool)
        .instrument(info_span!("relay.db.query", query = "claim_page_session_lease"))
        .await?;

        if holder_id != self.node_id {
            return Ok(ClaimResult::Denied { current_owner: holder_id });
        }

        if lease_id == proposed_lease_id {
            Ok(ClaimResult::Granted { lease_id })
        } else {
            Ok(ClaimResult::Renewed { lease_id })
        }
    }

    pub async fn renew(&self, page_id: Uuid, lease_id: Uuid) -> Result<RenewResult, sqlx::Error> {
        let OwnershipBackend::Postgres(pool) = &self.backend else {
            return Ok(RenewResult::Renewed);
        };

        let now = Utc::now();
        let updated = sqlx::query(
            r#"
UPDATE page_session_leases
SET expires_at = $4
WHERE page_id = $1
  AND node_id = $2
  AND lease_id = $3
  AND expires_at > $5
            "#,
        )
        .bind(page_id)
        .bind(self.node_id)
        .bind(lease_id)
        .bind(expires_at_with_ttl(now, self.ttl))
        .bind(now)
        .execute(pool)
        .instrument(info_span!("relay.db.query", query = "renew_page_session_lease"))
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(RenewResult::Renewed);
        }

        Ok(match self.live_owner(pool, page_id, now).await? {
            Some(_) => RenewResult::WrongHolder,
            None => RenewResult::NotFound,
        })
    }

    pub async fn release(&self, page_id: Uuid) -> Result<ReleaseResult, sqlx::Error> {
        let OwnershipBackend::Postgres(pool) = &self.backend else {
            return Ok(ReleaseResult::Released);
        };

        let now = Utc::now();
        let deleted = sqlx::query(
            r#"
DELETE FROM page_session_leases
WHERE page_id = $1
  AND node_id = $2
  AND expires_at > $3
            "#,
        )
        .bind(page_id)
        .bind(self.node_id)
        .bind(now)
        .execute(pool)
        .instrument(info_span!("relay.db.query", query = "release_page_session_lease"))
        .await?
        .rows_affected();

        if deleted == 1 {
            return Ok(ReleaseResult::Released);
        }

        Ok(match self.live_owner(pool, page_id, now).await? {
            Some(_) => ReleaseResult::WrongHolder,
            None => ReleaseResult::NotFound,
        })
    }

    /// Node currently owning the page, if any lease is live.
    pub async fn current_owner(&self, page_id: Uuid) -> Result<Option<Uuid>, sqlx::Error> {
        match &self.backend {
            OwnershipBackend::Local => Ok(None),
            OwnershipBackend::Postgres(pool) => self.live_owner(pool, page_id, Utc::now()).await,
        }
    }

    /// Delete expired lease rows. Returns how many were removed.
    pub async fn evict_expired(&self) -> Result<usize, sqlx::Error> {
        let OwnershipBackend::Postgres(pool) = &self.backend else {
            return Ok(0);
        };

        let deleted = sqlx::query("DELETE FROM page_session_leases WHERE expires_at <= $1")
            .bind(Utc::now())
            .execute(pool)
            .instrument(info_span!("relay.db.query", query = "evict_page_session_leases"))
            .await?
            .rows_affected();

        Ok(deleted as usize)
    }

    async fn live_owner(
        &self,
        pool: &PgPool,
        page_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>(
            r#"
SELECT node_id
FROM page_session_leases
WHERE page_id = $1
  AND expires_at > $2
            "#,
        )
        .bind(page_id)
        .bind(now)
        .fetch_optional(pool)
        .await
    }
}

fn expires_at_with_ttl(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60))
}
