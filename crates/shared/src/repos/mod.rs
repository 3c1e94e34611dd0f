use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use uuid::Uuid;

use crate::providers::ProviderId;

mod domains;
mod events;
mod responses;
mod templates;

pub use domains::PARK_AFTER_CONSECUTIVE_RETURNS;
pub use responses::ProviderActivityRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainStatus {
    Pending,
    Processing,
    Completed,
    CompletedPartial,
    Error,
}

impl DomainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::CompletedPartial => "completed_partial",
            Self::Error => "error",
        }
    }

    pub fn from_db(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "completed_partial" => Ok(Self::CompletedPartial),
            "error" => Ok(Self::Error),
            _ => Err(StoreError::InvalidData(format!(
                "unknown domain status persisted: {value}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Claim,
    Release,
    CallSuccess,
    CallFailure,
    CircuitOpen,
    CircuitClose,
    SchedulerTick,
    GuardianBlock,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Release => "release",
            Self::CallSuccess => "call_success",
            Self::CallFailure => "call_failure",
            Self::CircuitOpen => "circuit_open",
            Self::CircuitClose => "circuit_close",
            Self::SchedulerTick => "scheduler_tick",
            Self::GuardianBlock => "guardian_block",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClaimedDomain {
    pub id: Uuid,
    pub hostname: String,
}

/// One LLM reply headed for the append-only store.
#[derive(Debug, Clone)]
pub struct NewResponse {
    pub domain_id: Uuid,
    pub provider: ProviderId,
    pub model: String,
    pub prompt_template_id: String,
    pub prompt_text: String,
    pub response_text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_cost_usd: f64,
    pub latency_ms: i64,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid persisted data: {0}")]
    InvalidData(String),
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Dedup key for a response row: one successful (domain, provider, template)
/// cell per minute bucket. Replaying a crawl inside the bucket is a no-op.
pub fn response_idempotency_key(
    domain_id: Uuid,
    provider: ProviderId,
    prompt_template_id: &str,
    captured_at: DateTime<Utc>,
) -> String {
    let minute_bucket = captured_at.timestamp().div_euclid(60);

    let mut hasher = Sha256::new();
    hasher.update(domain_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(provider.as_str().as_bytes());
    hasher.update([0x1f]);
    hasher.update(prompt_template_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(minute_bucket.to_be_bytes());

    let digest = hasher.finalize();
    let suffix = URL_SAFE_NO_PAD.encode(digest);
    format!("{}:{suffix}", provider.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn idempotency_key_is_stable_within_a_minute_bucket() {
        let domain_id = Uuid::from_u128(7);
        let first = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 2).unwrap();
        let second = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 58).unwrap();
        let next_minute = Utc.with_ymd_and_hms(2025, 6, 1, 12, 31, 0).unwrap();

        let a = response_idempotency_key(domain_id, ProviderId::OpenAi, "brand_memory_v1", first);
        let b = response_idempotency_key(domain_id, ProviderId::OpenAi, "brand_memory_v1", second);
        let c =
            response_idempotency_key(domain_id, ProviderId::OpenAi, "brand_memory_v1", next_minute);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn idempotency_key_separates_providers_and_templates() {
        let domain_id = Uuid::from_u128(7);
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap();

        let openai = response_idempotency_key(domain_id, ProviderId::OpenAi, "brand_memory_v1", at);
        let cohere = response_idempotency_key(domain_id, ProviderId::Cohere, "brand_memory_v1", at);
        let other_template =
            response_idempotency_key(domain_id, ProviderId::OpenAi, "brand_perception_v1", at);

        assert_ne!(openai, cohere);
        assert_ne!(openai, other_template);
        assert!(openai.starts_with("openai:"));
    }

    #[test]
    fn domain_status_round_trips() {
        for status in [
            DomainStatus::Pending,
            DomainStatus::Processing,
            DomainStatus::Completed,
            DomainStatus::CompletedPartial,
            DomainStatus::Error,
        ] {
            assert_eq!(
                DomainStatus::from_db(status.as_str()).expect("round trip"),
                status
            );
        }
        assert!(DomainStatus::from_db("archived").is_err());
    }
}
