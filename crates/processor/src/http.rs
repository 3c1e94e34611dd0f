use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use tracing::{error, warn};
use uuid::Uuid;

use shared::guardian;
use shared::models::{
    ErrorBody, ErrorResponse, HealthResponse, OkResponse, ProviderHealth, StatusResponse,
    ThroughputSummary, TierStatus, TriggerRequest, TriggerResponse,
};
use shared::tier::Tier;

use crate::Engine;
use crate::scheduler::{self, LaunchError};

pub(crate) fn build_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/trigger", post(trigger))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/guardian/anomalies", get(guardian_anomalies))
        .with_state(engine)
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: message.into(),
            },
        }),
    )
        .into_response()
}

async fn health(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        providers_enabled: engine.registry.list_enabled().len(),
        active_runs: engine.runs.active_count(),
    })
}

async fn status(State(engine): State<Arc<Engine>>) -> Response {
    let day_ago = Utc::now() - Duration::days(1);
    let responses_24h = match engine.store.count_responses_since(day_ago).await {
        Ok(count) => count,
        Err(err) => {
            error!("status query failed: {err}");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                "could not read throughput counters",
            );
        }
    };
    let cost_24h_usd = match engine.store.total_cost_since(day_ago).await {
        Ok(total) => total,
        Err(err) => {
            error!("status query failed: {err}");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                "could not read throughput counters",
            );
        }
    };

    let tiers = Tier::ALL
        .into_iter()
        .map(|tier| TierStatus {
            tier: tier.as_str().to_string(),
            next_run_at: engine.runs.next_run(tier),
            active_run_id: engine.runs.active_run_id(tier),
            last_run: engine.runs.last_summary(tier),
        })
        .collect();

    let providers = engine
        .registry
        .list_enabled()
        .into_iter()
        .map(|provider| ProviderHealth {
            provider: provider.id.as_str().to_string(),
            tier: provider.tier.as_str().to_string(),
            circuit_state: engine.breakers.state(provider.id).as_str().to_string(),
            health_score: engine.telemetry.health_score(provider.id),
            keys: engine.registry.key_pool_size(provider.id),
        })
        .collect();

    Json(StatusResponse {
        tiers,
        throughput: ThroughputSummary {
            responses_24h,
            cost_24h_usd,
        },
        providers,
    })
    .into_response()
}

async fn trigger(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<TriggerRequest>,
) -> Response {
    let Some(tier) = Tier::parse(&request.tier) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "unknown_tier",
            format!("unknown tier: {}", request.tier),
        );
    };

    match scheduler::launch_run(engine.clone(), tier, request.limit, request.force).await {
        Ok(started) => (
            StatusCode::ACCEPTED,
            Json(TriggerResponse {
                run_id: started.run_id,
                tier: tier.as_str().to_string(),
            }),
        )
            .into_response(),
        Err(LaunchError::AlreadyActive) => error_response(
            StatusCode::CONFLICT,
            "run_active",
            "an identical run is already active; pass force=true to replace it",
        ),
        Err(LaunchError::GuardianBlocked(reasons)) => {
            warn!(tier = tier.as_str(), "trigger refused by guardian");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "guardian_block",
                reasons.join("; "),
            )
        }
        Err(LaunchError::Store(err)) => {
            error!("trigger failed: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                "run could not be started",
            )
        }
    }
}

async fn cancel_job(
    State(engine): State<Arc<Engine>>,
    Path(run_id): Path<Uuid>,
) -> Response {
    if engine.runs.cancel(run_id) {
        Json(OkResponse { ok: true }).into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            "unknown_job",
            format!("no active run with id {run_id}"),
        )
    }
}

async fn guardian_anomalies(State(engine): State<Arc<Engine>>) -> Response {
    match guardian::anomalies(&engine.store, &engine.config.source).await {
        Ok(anomalies) => Json(anomalies).into_response(),
        Err(err) => {
            error!("anomaly scan failed: {err}");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                "could not compute anomalies",
            )
        }
    }
}
