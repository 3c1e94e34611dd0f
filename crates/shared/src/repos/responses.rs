use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{NewResponse, Store, StoreError, response_idempotency_key};

/// Guardian input: one provider's recent footprint.
#[derive(Debug, Clone)]
pub struct ProviderActivityRow {
    pub provider: String,
    pub active_days: i64,
    pub responses_last_3d: i64,
}

impl Store {
    /// Appends one response. Returns false when the idempotency key already
    /// exists, which makes same-cycle replays harmless. Rows are never
    /// updated or deleted.
    pub async fn persist_response(&self, response: &NewResponse) -> Result<bool, StoreError> {
        let idempotency_key = response_idempotency_key(
            response.domain_id,
            response.provider,
            &response.prompt_template_id,
            response.captured_at,
        );

        let result = sqlx::query(
            "INSERT INTO responses (
                id,
                domain_id,
                provider,
                model,
                prompt_template_id,
                prompt_text,
                response_text,
                prompt_tokens,
                completion_tokens,
                total_cost_usd,
                latency_ms,
                captured_at,
                idempotency_key
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             ON CONFLICT (idempotency_key) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(response.domain_id)
        .bind(response.provider.as_str())
        .bind(&response.model)
        .bind(&response.prompt_template_id)
        .bind(&response.prompt_text)
        .bind(&response.response_text)
        .bind(i32::try_from(response.prompt_tokens).unwrap_or(i32::MAX))
        .bind(i32::try_from(response.completion_tokens).unwrap_or(i32::MAX))
        .bind(response.total_cost_usd)
        .bind(response.latency_ms)
        .bind(response.captured_at)
        .bind(&idempotency_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count_responses_since(&self, since: DateTime<Utc>) -> Result<i64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*)::bigint FROM responses WHERE captured_at >= $1")
                .bind(since)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn distinct_providers_since(&self, since: DateTime<Utc>) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT provider)::bigint FROM responses WHERE captured_at >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn distinct_domains_since(&self, since: DateTime<Utc>) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT domain_id)::bigint FROM responses WHERE captured_at >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn mean_response_length_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64, StoreError> {
        let mean: f64 = sqlx::query_scalar(
            "SELECT COALESCE(AVG(char_length(response_text))::double precision, 0)
             FROM responses
             WHERE captured_at >= $1 AND captured_at < $2",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;
        Ok(mean)
    }

    pub async fn total_cost_since(&self, since: DateTime<Utc>) -> Result<f64, StoreError> {
        let total: f64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(total_cost_usd), 0)::double precision
             FROM responses
             WHERE captured_at >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    /// Response counts per ISO week for the trailing `weeks` weeks, oldest
    /// first, with empty weeks filled in as zero.
    pub async fn weekly_response_counts(&self, weeks: i64) -> Result<Vec<i64>, StoreError> {
        let counts: Vec<i64> = sqlx::query_scalar(
            "SELECT COALESCE(buckets.total, 0)::bigint
             FROM generate_series(
                 date_trunc('week', NOW()) - ($1 - 1) * INTERVAL '1 week',
                 date_trunc('week', NOW()),
                 INTERVAL '1 week'
             ) AS wk
             LEFT JOIN (
                 SELECT date_trunc('week', captured_at) AS wk, COUNT(*)::bigint AS total
                 FROM responses
                 WHERE captured_at >= date_trunc('week', NOW()) - ($1 - 1) * INTERVAL '1 week'
                 GROUP BY 1
             ) buckets USING (wk)
             ORDER BY wk",
        )
        .bind(weeks)
        .fetch_all(&self.pool)
        .await?;
        Ok(counts)
    }

    /// Per-provider activity over the trailing 12 weeks, for the guardian's
    /// silent-model check.
    pub async fn provider_activity_window(&self) -> Result<Vec<ProviderActivityRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT provider,
                    COUNT(DISTINCT date_trunc('day', captured_at))::bigint AS active_days,
                    COUNT(*) FILTER (WHERE captured_at >= NOW() - INTERVAL '3 days')::bigint
                        AS responses_last_3d
             FROM responses
             WHERE captured_at >= NOW() - INTERVAL '12 weeks'
             GROUP BY provider
             ORDER BY provider",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ProviderActivityRow {
                    provider: row.try_get("provider")?,
                    active_days: row.try_get("active_days")?,
                    responses_last_3d: row.try_get("responses_last_3d")?,
                })
            })
            .collect()
    }
}
