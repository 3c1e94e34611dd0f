use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shared::guardian::{self, LivenessProber};
use shared::models::RunSummary;
use shared::providers::ProviderTier;
use shared::repos::{EventKind, StoreError};
use shared::tier::Tier;

use crate::Engine;
use crate::orchestrator;
use crate::runs::BeginRunError;

const LIVENESS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub(crate) enum LaunchError {
    #[error("a run for this tier is already active")]
    AlreadyActive,
    #[error("guardian blocked the run: {}", .0.join("; "))]
    GuardianBlocked(Vec<String>),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub(crate) struct RunStarted {
    pub(crate) run_id: Uuid,
    pub(crate) handle: JoinHandle<RunSummary>,
}

/// Starts a run for `tier`: registry slot, guardian gate, queueing, then the
/// orchestrator worker pool on a background task.
pub(crate) async fn launch_run(
    engine: Arc<Engine>,
    tier: Tier,
    limit: Option<i64>,
    force: bool,
) -> Result<RunStarted, LaunchError> {
    let ticket = engine
        .runs
        .begin(tier, force)
        .map_err(|BeginRunError::AlreadyActive| LaunchError::AlreadyActive)?;
    let run_id = ticket.id;
    let started_at = Utc::now();

    let prober = if engine.config.guardian_liveness_probes {
        LivenessProber::new(LIVENESS_PROBE_TIMEOUT).ok()
    } else {
        None
    };
    let critical_providers = engine.registry.enabled_with_tiers(&[ProviderTier::Premium]);

    let report = match guardian::preflight(
        &engine.store,
        &engine.guardian_thresholds,
        prober.as_ref(),
        &critical_providers,
    )
    .await
    {
        Ok(report) => report,
        Err(err) => {
            finish_early(&engine, tier, run_id, started_at, "failed", Vec::new());
            return Err(err.into());
        }
    };

    if !report.passed() {
        let reasons: Vec<String> = report
            .reasons
            .iter()
            .map(|reason| format!("{}: {}", reason.check, reason.detail))
            .collect();
        warn!(tier = tier.as_str(), reasons = ?reasons, "guardian blocked run");
        let _ = engine
            .store
            .append_event(
                EventKind::GuardianBlock,
                None,
                json!({
                    "tier": tier.as_str(),
                    "run_id": run_id,
                    "reasons": reasons,
                }),
            )
            .await;
        finish_early(&engine, tier, run_id, started_at, "guardian_block", reasons.clone());
        return Err(LaunchError::GuardianBlocked(reasons));
    }

    let cap = limit.unwrap_or_else(|| tier.domain_cap()).max(0);
    let queued = match engine
        .store
        .mark_tier_pending(tier, &engine.config.source, cap)
        .await
    {
        Ok(queued) => queued,
        Err(err) => {
            finish_early(&engine, tier, run_id, started_at, "failed", Vec::new());
            return Err(err.into());
        }
    };

    info!(
        tier = tier.as_str(),
        run_id = %run_id,
        queued,
        cap,
        "run starting"
    );

    let handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            let summary = orchestrator::run_tier(
                engine.clone(),
                ticket,
                cap,
                tier.budget_ceiling_usd(),
                started_at,
            )
            .await;
            engine.runs.finish(tier, run_id, summary.clone());
            info!(
                tier = %summary.tier,
                run_id = %run_id,
                outcome = %summary.outcome,
                domains_claimed = summary.domains_claimed,
                domains_completed = summary.domains_completed,
                domains_partial = summary.domains_partial,
                domains_returned = summary.domains_returned,
                domains_parked = summary.domains_parked,
                calls_succeeded = summary.calls_succeeded,
                calls_failed = summary.calls_failed,
                calls_skipped_open = summary.calls_skipped_open,
                total_cost_usd = summary.total_cost_usd,
                "run finished"
            );
            summary
        }
    });

    Ok(RunStarted { run_id, handle })
}

fn finish_early(
    engine: &Engine,
    tier: Tier,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    outcome: &str,
    block_reasons: Vec<String>,
) {
    engine.runs.finish(
        tier,
        run_id,
        RunSummary {
            run_id,
            tier: tier.as_str().to_string(),
            outcome: outcome.to_string(),
            started_at,
            finished_at: Some(Utc::now()),
            domains_claimed: 0,
            domains_completed: 0,
            domains_partial: 0,
            domains_returned: 0,
            domains_parked: 0,
            domains_released: 0,
            calls_succeeded: 0,
            calls_failed: 0,
            calls_skipped_open: 0,
            total_cost_usd: 0.0,
            block_reasons,
        },
    );
}

/// Cron-like driver: one interval ticker per tier, each tick attempting a
/// run at that tier. A tick that finds the previous run still active is
/// skipped rather than queued.
pub(crate) async fn scheduler_loop(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    let schedule = engine.config.schedule;

    let make_ticker = |tier: Tier| {
        let period = Duration::from_secs(tier.interval_seconds(&schedule).max(1));
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        engine
            .runs
            .set_next_run(tier, next_fire_time(tier, &schedule));
        ticker
    };
    let mut cheap_ticks = make_ticker(Tier::Cheap);
    let mut medium_ticks = make_ticker(Tier::Medium);
    let mut expensive_ticks = make_ticker(Tier::Expensive);
    let mut full_ticks = make_ticker(Tier::Full);

    info!(
        cheap_seconds = schedule.cheap_seconds,
        medium_seconds = schedule.medium_seconds,
        expensive_seconds = schedule.expensive_seconds,
        full_seconds = schedule.full_seconds,
        "scheduler running"
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = cheap_ticks.tick() => tick(&engine, Tier::Cheap).await,
            _ = medium_ticks.tick() => tick(&engine, Tier::Medium).await,
            _ = expensive_ticks.tick() => tick(&engine, Tier::Expensive).await,
            _ = full_ticks.tick() => tick(&engine, Tier::Full).await,
        }
    }

    info!("scheduler stopped");
}

fn next_fire_time(tier: Tier, schedule: &shared::config::ScheduleIntervals) -> DateTime<Utc> {
    let seconds = i64::try_from(tier.interval_seconds(schedule)).unwrap_or(i64::MAX);
    Utc::now() + ChronoDuration::seconds(seconds)
}

async fn tick(engine: &Arc<Engine>, tier: Tier) {
    let _ = engine
        .store
        .append_event(
            EventKind::SchedulerTick,
            None,
            json!({ "tier": tier.as_str() }),
        )
        .await;
    engine
        .runs
        .set_next_run(tier, next_fire_time(tier, &engine.config.schedule));

    match launch_run(engine.clone(), tier, None, false).await {
        Ok(started) => {
            debug!(tier = tier.as_str(), run_id = %started.run_id, "scheduled run started");
        }
        Err(LaunchError::AlreadyActive) => {
            info!(
                tier = tier.as_str(),
                "previous run still active, skipping tick"
            );
        }
        // Already logged with its reasons at the gate.
        Err(LaunchError::GuardianBlocked(_)) => {}
        Err(LaunchError::Store(err)) => {
            error!(tier = tier.as_str(), "scheduled run failed to start: {err}");
        }
    }
}

/// Returns expired leases to pending so crashed or wedged workers cannot
/// strand domains in `processing`.
pub(crate) async fn sweeper_loop(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(engine.config.sweep_interval_seconds.max(1));
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                match engine.store.release_expired_leases(Utc::now()).await {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        for domain_id in &reclaimed {
                            let _ = engine
                                .store
                                .append_event(
                                    EventKind::Release,
                                    Some(*domain_id),
                                    json!({ "reason": "lease_expired" }),
                                )
                                .await;
                        }
                        info!(reclaimed = reclaimed.len(), "swept expired leases");
                    }
                    Ok(_) => {}
                    Err(err) => error!("lease sweep failed: {err}"),
                }
            }
        }
    }
}
