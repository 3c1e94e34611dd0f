use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::tier::Tier;

use super::{ClaimedDomain, DomainStatus, Store, StoreError};

/// A domain bounced back to pending this many times in a row is parked as
/// `error` until a full run reclaims it.
pub const PARK_AFTER_CONSECUTIVE_RETURNS: i32 = 3;

impl Store {
    /// Atomically claims up to `batch_size` pending domains for `owner`.
    /// Rows locked by a competing claimer are skipped, so two workers can
    /// never hold the same domain.
    pub async fn claim_domains(
        &self,
        owner: &str,
        batch_size: i64,
        source: &str,
        now: DateTime<Utc>,
        lease_ttl_seconds: i64,
    ) -> Result<Vec<ClaimedDomain>, StoreError> {
        if batch_size <= 0 {
            return Ok(Vec::new());
        }
        if lease_ttl_seconds <= 0 {
            return Err(StoreError::InvalidData(
                "lease_ttl_seconds must be > 0".to_string(),
            ));
        }

        let lease_until = now + Duration::seconds(lease_ttl_seconds);

        let rows = sqlx::query(
            "WITH candidate_ids AS (
                SELECT id
                FROM domains
                WHERE status = 'pending'
                  AND source = $3
                ORDER BY last_processed_at ASC NULLS FIRST, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
             ),
             claimed AS (
                UPDATE domains d
                SET status = 'processing',
                    lease_owner = $1,
                    lease_expires_at = $4,
                    process_count = process_count + 1,
                    updated_at = NOW()
                FROM candidate_ids c
                WHERE d.id = c.id
                RETURNING d.id, d.hostname
             )
             SELECT id, hostname FROM claimed",
        )
        .bind(owner)
        .bind(batch_size)
        .bind(source)
        .bind(lease_until)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ClaimedDomain {
                    id: row.try_get("id")?,
                    hostname: row.try_get("hostname")?,
                })
            })
            .collect()
    }

    /// Sweeps expired leases back to pending. Returns the reclaimed ids so
    /// the caller can log release events.
    pub async fn release_expired_leases(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            "UPDATE domains
             SET status = 'pending',
                 lease_owner = NULL,
                 lease_expires_at = NULL,
                 updated_at = NOW()
             WHERE status = 'processing'
               AND lease_expires_at IS NOT NULL
               AND lease_expires_at <= $1
             RETURNING id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok(row.try_get("id")?))
            .collect()
    }

    /// Commits a finished tensor. Only `completed` / `completed_partial` are
    /// legal here; the update is a no-op when the lease was lost.
    pub async fn complete_domain(
        &self,
        id: Uuid,
        owner: &str,
        status: DomainStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if !matches!(
            status,
            DomainStatus::Completed | DomainStatus::CompletedPartial
        ) {
            return Err(StoreError::InvalidData(format!(
                "complete_domain cannot set status {}",
                status.as_str()
            )));
        }

        let result = sqlx::query(
            "UPDATE domains
             SET status = $3,
                 lease_owner = NULL,
                 lease_expires_at = NULL,
                 last_processed_at = $4,
                 consecutive_failures = 0,
                 updated_at = NOW()
             WHERE id = $1
               AND status = 'processing'
               AND lease_owner = $2",
        )
        .bind(id)
        .bind(owner)
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns an incomplete domain to pending for a later retry, or parks
    /// it as `error` once it has cycled back too many times.
    pub async fn return_domain(
        &self,
        id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DomainStatus>, StoreError> {
        let row = sqlx::query(
            "UPDATE domains
             SET status = CASE
                   WHEN consecutive_failures + 1 >= $3 THEN 'error'
                   ELSE 'pending'
                 END,
                 error_count = error_count + 1,
                 consecutive_failures = consecutive_failures + 1,
                 lease_owner = NULL,
                 lease_expires_at = NULL,
                 last_processed_at = $4,
                 updated_at = NOW()
             WHERE id = $1
               AND status = 'processing'
               AND lease_owner = $2
             RETURNING status",
        )
        .bind(id)
        .bind(owner)
        .bind(PARK_AFTER_CONSECUTIVE_RETURNS)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let status: String = row.try_get("status")?;
            DomainStatus::from_db(&status)
        })
        .transpose()
    }

    /// Hands a lease back without recording an error, for cancellation and
    /// per-domain timeouts.
    pub async fn release_domain(&self, id: Uuid, owner: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE domains
             SET status = 'pending',
                 lease_owner = NULL,
                 lease_expires_at = NULL,
                 updated_at = NOW()
             WHERE id = $1
               AND status = 'processing'
               AND lease_owner = $2",
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Marks the domains selected by a tier's policy as pending, bounded by
    /// `limit`. Returns how many rows were queued.
    pub async fn mark_tier_pending(
        &self,
        tier: Tier,
        source: &str,
        limit: i64,
    ) -> Result<u64, StoreError> {
        let reset = if tier == Tier::Full {
            ", consecutive_failures = 0"
        } else {
            ""
        };
        let statement = format!(
            "UPDATE domains
             SET status = 'pending', updated_at = NOW(){reset}
             WHERE id IN (
                 SELECT id
                 FROM domains
                 WHERE source = $1
                   AND {eligibility}
                   AND {predicate}
                 ORDER BY last_processed_at ASC NULLS FIRST, id ASC
                 LIMIT $2
             )
               AND status <> 'processing'",
            eligibility = tier.eligible_status_sql(),
            predicate = tier.selection_predicate(),
        );

        let result = sqlx::query(&statement)
            .bind(source)
            .bind(limit)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn count_pending(&self, source: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)::bigint FROM domains WHERE status = 'pending' AND source = $1",
        )
        .bind(source)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn domain_status_counts(
        &self,
        source: &str,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*)::bigint AS total
             FROM domains
             WHERE source = $1
             GROUP BY status
             ORDER BY status",
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok((row.try_get("status")?, row.try_get("total")?)))
            .collect()
    }

    /// Idempotent seeding entry point, used by operational tooling and
    /// integration tests. Hostnames are canonicalized to lowercase.
    pub async fn insert_domain(&self, hostname: &str, source: &str) -> Result<Uuid, StoreError> {
        let hostname = hostname.trim().to_ascii_lowercase();
        if hostname.is_empty() {
            return Err(StoreError::InvalidData(
                "hostname must not be empty".to_string(),
            ));
        }

        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO domains (hostname, source)
             VALUES ($1, $2)
             ON CONFLICT (hostname)
             DO UPDATE SET updated_at = NOW()
             RETURNING id",
        )
        .bind(&hostname)
        .bind(source)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn count_untouched_domains(
        &self,
        source: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)::bigint
             FROM domains
             WHERE source = $1
               AND (last_processed_at IS NULL OR last_processed_at < $2)",
        )
        .bind(source)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
