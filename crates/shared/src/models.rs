use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub providers_enabled: usize,
    pub active_runs: usize,
}

/// Final accounting for one scheduler-initiated run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub tier: String,
    pub outcome: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub domains_claimed: u64,
    pub domains_completed: u64,
    pub domains_partial: u64,
    pub domains_returned: u64,
    pub domains_parked: u64,
    pub domains_released: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    pub calls_skipped_open: u64,
    pub total_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_reasons: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TierStatus {
    pub tier: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub active_run_id: Option<Uuid>,
    pub last_run: Option<RunSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub tier: String,
    pub circuit_state: String,
    pub health_score: i32,
    pub keys: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThroughputSummary {
    pub responses_24h: i64,
    pub cost_24h_usd: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub tiers: Vec<TierStatus>,
    pub throughput: ThroughputSummary,
    pub providers: Vec<ProviderHealth>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub tier: String,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub run_id: Uuid,
    pub tier: String,
}
