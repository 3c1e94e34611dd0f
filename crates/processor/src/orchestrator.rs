use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Duration, sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shared::breaker::{BreakerCheck, BreakerTransition};
use shared::models::RunSummary;
use shared::prompts::{self, PromptTemplate};
use shared::providers::{Provider, ProviderId};
use shared::providers::adapter::{CallErrorKind, CallRequest, CallTarget};
use shared::repos::{ClaimedDomain, DomainStatus, EventKind, NewResponse};
use shared::telemetry::call_cost_usd;

use crate::Engine;
use crate::retry::backoff_delay_ms;
use crate::runs::RunTicket;

const MAX_CALL_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 1_000;
const RETRY_MAX_DELAY_MS: u64 = 10_000;
const CALL_MAX_TOKENS: u32 = 500;
const CALL_TEMPERATURE: f64 = 0.7;
const CLAIM_ERROR_LIMIT: u32 = 3;

#[derive(Debug, Default, Clone)]
pub(crate) struct RunMetrics {
    pub domains_claimed: u64,
    pub domains_completed: u64,
    pub domains_partial: u64,
    pub domains_returned: u64,
    pub domains_parked: u64,
    pub domains_released: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    pub calls_skipped_open: u64,
    pub failures_auth: u64,
    pub failures_rate_limited: u64,
    pub failures_transient: u64,
    pub failures_non_retryable: u64,
    pub total_cost_usd: f64,
}

impl RunMetrics {
    fn record_failure_kind(&mut self, kind: CallErrorKind) {
        self.calls_failed += 1;
        match kind {
            CallErrorKind::Auth => self.failures_auth += 1,
            CallErrorKind::RateLimited => self.failures_rate_limited += 1,
            CallErrorKind::Transient => self.failures_transient += 1,
            CallErrorKind::NonRetryable => self.failures_non_retryable += 1,
        }
    }
}

/// Everything a run's workers share.
struct RunShared {
    engine: Arc<Engine>,
    ticket: RunTicket,
    providers: Vec<&'static Provider>,
    /// One permit per configured key, so a slow provider saturates its own
    /// pool without starving the others.
    semaphores: HashMap<ProviderId, Arc<Semaphore>>,
    metrics: Mutex<RunMetrics>,
    domain_cap: u64,
    budget_usd: f64,
}

impl RunShared {
    fn metrics(&self) -> std::sync::MutexGuard<'_, RunMetrics> {
        match self.metrics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn limits_reached(&self) -> bool {
        let metrics = self.metrics();
        metrics.domains_claimed >= self.domain_cap || metrics.total_cost_usd >= self.budget_usd
    }
}

#[derive(Debug, Clone, Copy)]
struct ElementOutcome {
    success: bool,
    skipped_open: bool,
    error_kind: Option<CallErrorKind>,
}

impl ElementOutcome {
    fn success() -> Self {
        Self {
            success: true,
            skipped_open: false,
            error_kind: None,
        }
    }

    fn skipped_open() -> Self {
        Self {
            success: false,
            skipped_open: true,
            error_kind: None,
        }
    }

    fn failed(kind: CallErrorKind) -> Self {
        Self {
            success: false,
            skipped_open: false,
            error_kind: Some(kind),
        }
    }
}

/// Most frequent failure kind across a tensor, recorded when a domain is
/// parked.
fn dominant_error_kind(outcomes: &[ElementOutcome]) -> Option<CallErrorKind> {
    let mut counts: HashMap<CallErrorKind, usize> = HashMap::new();
    for outcome in outcomes {
        if let Some(kind) = outcome.error_kind {
            *counts.entry(kind).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(kind, _)| kind)
}

enum ElementFatal {
    Persistence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitDecision {
    Completed,
    CompletedPartial,
    Returned,
}

/// Where a finished tensor lands. Fully successful tensors commit; a deficit
/// confined to open-circuit providers is still observable and commits as
/// partial; anything else goes back to pending for a later retry.
fn commit_decision(outcomes: &[ElementOutcome], expected: usize) -> CommitDecision {
    let successes = outcomes.iter().filter(|outcome| outcome.success).count();
    if successes == expected {
        return CommitDecision::Completed;
    }
    if successes > 0
        && outcomes.len() == expected
        && outcomes
            .iter()
            .all(|outcome| outcome.success || outcome.skipped_open)
    {
        return CommitDecision::CompletedPartial;
    }
    CommitDecision::Returned
}

enum DomainFailure {
    Timeout,
    Persistence,
}

pub(crate) async fn run_tier(
    engine: Arc<Engine>,
    ticket: RunTicket,
    domain_cap: i64,
    budget_usd: f64,
    started_at: DateTime<Utc>,
) -> RunSummary {
    let tier = ticket.tier;
    let run_id = ticket.id;
    let providers = engine.registry.enabled_with_tiers(tier.provider_tiers());

    if providers.is_empty() {
        warn!(tier = tier.as_str(), "no enabled providers for tier, nothing to do");
        return summary_from(
            run_id,
            tier.as_str(),
            "failed",
            started_at,
            &RunMetrics::default(),
            true,
        );
    }

    let semaphores = providers
        .iter()
        .map(|provider| {
            let permits = engine.registry.key_pool_size(provider.id).max(1);
            (provider.id, Arc::new(Semaphore::new(permits)))
        })
        .collect();

    let shared = Arc::new(RunShared {
        engine: engine.clone(),
        ticket,
        providers,
        semaphores,
        metrics: Mutex::new(RunMetrics::default()),
        domain_cap: u64::try_from(domain_cap).unwrap_or(u64::MAX),
        budget_usd,
    });

    let mut workers = JoinSet::new();
    for worker_index in 0..engine.config.worker_concurrency.max(1) {
        let shared = shared.clone();
        workers.spawn(async move { worker_loop(shared, worker_index).await });
    }

    let mut worker_fatal = false;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(healthy) => worker_fatal |= !healthy,
            Err(err) => {
                error!(run_id = %run_id, "worker task aborted: {err}");
                worker_fatal = true;
            }
        }
    }

    let canceled = shared.ticket.is_canceled();
    let outcome = if canceled {
        "canceled"
    } else if worker_fatal {
        "failed"
    } else {
        "completed"
    };
    let metrics = shared.metrics().clone();
    summary_from(run_id, tier.as_str(), outcome, started_at, &metrics, true)
}

fn summary_from(
    run_id: Uuid,
    tier: &str,
    outcome: &str,
    started_at: DateTime<Utc>,
    metrics: &RunMetrics,
    finished: bool,
) -> RunSummary {
    RunSummary {
        run_id,
        tier: tier.to_string(),
        outcome: outcome.to_string(),
        started_at,
        finished_at: finished.then(Utc::now),
        domains_claimed: metrics.domains_claimed,
        domains_completed: metrics.domains_completed,
        domains_partial: metrics.domains_partial,
        domains_returned: metrics.domains_returned,
        domains_parked: metrics.domains_parked,
        domains_released: metrics.domains_released,
        calls_succeeded: metrics.calls_succeeded,
        calls_failed: metrics.calls_failed,
        calls_skipped_open: metrics.calls_skipped_open,
        total_cost_usd: metrics.total_cost_usd,
        block_reasons: Vec::new(),
    }
}

/// One worker: claim a domain, drive its tensor, commit, repeat. Returns
/// false when the worker had to stop because persistence went unhealthy.
async fn worker_loop(shared: Arc<RunShared>, worker_index: usize) -> bool {
    let engine = &shared.engine;
    let owner = format!("{}:{}", engine.config.source, Uuid::new_v4());
    let mut claim_errors = 0_u32;

    loop {
        if shared.ticket.is_canceled() || shared.limits_reached() {
            return true;
        }

        let claimed = engine
            .store
            .claim_domains(
                &owner,
                engine.config.claim_batch_size,
                &engine.config.source,
                Utc::now(),
                engine.config.lease_ttl_seconds,
            )
            .await;

        let domains = match claimed {
            Ok(domains) => {
                claim_errors = 0;
                domains
            }
            Err(err) => {
                claim_errors += 1;
                error!(worker_index, "failed to claim domains: {err}");
                if claim_errors >= CLAIM_ERROR_LIMIT {
                    return false;
                }
                sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        if domains.is_empty() {
            return true;
        }

        for domain in domains {
            shared.metrics().domains_claimed += 1;
            log_event(
                engine,
                EventKind::Claim,
                Some(domain.id),
                json!({
                    "run_id": shared.ticket.id,
                    "owner": owner,
                    "hostname": domain.hostname,
                }),
            )
            .await;

            match process_domain(&shared, &owner, &domain).await {
                Ok(()) => {}
                Err(DomainFailure::Timeout) => {
                    warn!(
                        worker_index,
                        hostname = %domain.hostname,
                        "domain exceeded its wall-clock cap, releasing lease"
                    );
                    release_quietly(&shared, &owner, &domain, "domain_timeout").await;
                    shared.metrics().domains_released += 1;
                }
                Err(DomainFailure::Persistence) => {
                    error!(
                        worker_index,
                        hostname = %domain.hostname,
                        "persistence unhealthy, worker shutting down"
                    );
                    release_quietly(&shared, &owner, &domain, "worker_unhealthy").await;
                    shared.metrics().domains_released += 1;
                    return false;
                }
            }
        }
    }
}

async fn release_quietly(shared: &RunShared, owner: &str, domain: &ClaimedDomain, reason: &str) {
    let engine = &shared.engine;
    match engine.store.release_domain(domain.id, owner).await {
        Ok(true) => {
            log_event(
                engine,
                EventKind::Release,
                Some(domain.id),
                json!({ "reason": reason, "run_id": shared.ticket.id }),
            )
            .await;
        }
        Ok(false) => {
            warn!(hostname = %domain.hostname, "lease already lost while releasing");
        }
        Err(err) => {
            error!(hostname = %domain.hostname, "failed to release lease: {err}");
        }
    }
}

async fn process_domain(
    shared: &Arc<RunShared>,
    owner: &str,
    domain: &ClaimedDomain,
) -> Result<(), DomainFailure> {
    let per_domain = Duration::from_millis(shared.engine.config.per_domain_timeout_ms);
    match timeout(per_domain, process_domain_inner(shared, owner, domain)).await {
        Ok(result) => result,
        Err(_) => Err(DomainFailure::Timeout),
    }
}

async fn process_domain_inner(
    shared: &Arc<RunShared>,
    owner: &str,
    domain: &ClaimedDomain,
) -> Result<(), DomainFailure> {
    let engine = &shared.engine;
    let templates = prompts::active_templates();
    let expected = shared.providers.len() * templates.len();

    let mut elements = JoinSet::new();
    for provider in &shared.providers {
        for template in templates {
            let shared = shared.clone();
            let domain_id = domain.id;
            let hostname = domain.hostname.clone();
            let provider = *provider;
            elements.spawn(async move {
                run_element(shared, domain_id, hostname, provider, template).await
            });
        }
    }

    let mut outcomes = Vec::with_capacity(expected);
    let mut persistence_failed = false;
    while let Some(joined) = elements.join_next().await {
        match joined {
            Ok(Ok(outcome)) => outcomes.push(outcome),
            Ok(Err(ElementFatal::Persistence)) => persistence_failed = true,
            Err(err) => {
                error!(hostname = %domain.hostname, "tensor element task failed: {err}");
                outcomes.push(ElementOutcome::failed(CallErrorKind::NonRetryable));
            }
        }
    }

    if persistence_failed {
        return Err(DomainFailure::Persistence);
    }

    let decision = commit_decision(&outcomes, expected);
    let successes = outcomes.iter().filter(|outcome| outcome.success).count();
    let now = Utc::now();

    match decision {
        CommitDecision::Completed | CommitDecision::CompletedPartial => {
            let status = if decision == CommitDecision::Completed {
                DomainStatus::Completed
            } else {
                DomainStatus::CompletedPartial
            };
            let mut committed = engine
                .store
                .complete_domain(domain.id, owner, status, now)
                .await;
            if committed.is_err() {
                committed = engine
                    .store
                    .complete_domain(domain.id, owner, status, now)
                    .await;
            }
            match committed {
                Ok(true) => {
                    let mut metrics = shared.metrics();
                    if status == DomainStatus::Completed {
                        metrics.domains_completed += 1;
                    } else {
                        metrics.domains_partial += 1;
                    }
                    drop(metrics);
                    info!(
                        hostname = %domain.hostname,
                        status = status.as_str(),
                        successes,
                        expected,
                        "domain committed"
                    );
                }
                Ok(false) => {
                    warn!(
                        hostname = %domain.hostname,
                        "completion skipped because lease ownership was lost"
                    );
                }
                Err(err) => {
                    error!(hostname = %domain.hostname, "failed to commit domain: {err}");
                    return Err(DomainFailure::Persistence);
                }
            }
        }
        CommitDecision::Returned => {
            let mut returned = engine.store.return_domain(domain.id, owner, now).await;
            if returned.is_err() {
                returned = engine.store.return_domain(domain.id, owner, now).await;
            }
            match returned {
                Ok(Some(DomainStatus::Error)) => {
                    shared.metrics().domains_parked += 1;
                    let last_error_kind =
                        dominant_error_kind(&outcomes).map(|kind| kind.as_str());
                    log_event(
                        engine,
                        EventKind::Release,
                        Some(domain.id),
                        json!({
                            "reason": "parked",
                            "last_error_kind": last_error_kind,
                            "successes": successes,
                            "expected": expected,
                        }),
                    )
                    .await;
                    warn!(
                        hostname = %domain.hostname,
                        successes,
                        expected,
                        last_error_kind,
                        "domain parked after repeated incomplete tensors"
                    );
                }
                Ok(Some(_)) => {
                    shared.metrics().domains_returned += 1;
                    info!(
                        hostname = %domain.hostname,
                        successes,
                        expected,
                        "incomplete tensor, domain returned to pending"
                    );
                }
                Ok(None) => {
                    warn!(
                        hostname = %domain.hostname,
                        "return skipped because lease ownership was lost"
                    );
                }
                Err(err) => {
                    error!(hostname = %domain.hostname, "failed to return domain: {err}");
                    return Err(DomainFailure::Persistence);
                }
            }
        }
    }

    Ok(())
}

/// One (provider, template) cell of the tensor. Always resolves to an
/// outcome; only a sick store escalates.
async fn run_element(
    shared: Arc<RunShared>,
    domain_id: Uuid,
    hostname: String,
    provider: &'static Provider,
    template: &'static PromptTemplate,
) -> Result<ElementOutcome, ElementFatal> {
    let engine = &shared.engine;

    let Some(semaphore) = shared.semaphores.get(&provider.id).cloned() else {
        return Ok(ElementOutcome::failed(CallErrorKind::NonRetryable));
    };
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return Ok(ElementOutcome::failed(CallErrorKind::NonRetryable));
    };

    let prompt = template.render(&hostname);
    let mut attempt = 1_u32;

    loop {
        if let BreakerCheck::Deny { .. } = engine.breakers.check(provider.id) {
            shared.metrics().calls_skipped_open += 1;
            log_event(
                engine,
                EventKind::CallFailure,
                Some(domain_id),
                json!({
                    "provider": provider.id.as_str(),
                    "template": template.id,
                    "kind": "provider_unavailable",
                }),
            )
            .await;
            return Ok(ElementOutcome::skipped_open());
        }

        let Some(lease) = engine.limiter.acquire(provider.id).await else {
            // Key pool emptied out mid-run.
            shared.metrics().record_failure_kind(CallErrorKind::NonRetryable);
            return Ok(ElementOutcome::failed(CallErrorKind::NonRetryable));
        };

        let target = CallTarget {
            provider,
            key: lease.key().to_string(),
        };
        let request = CallRequest {
            prompt: prompt.clone(),
            max_tokens: CALL_MAX_TOKENS,
            temperature: CALL_TEMPERATURE,
        };
        let result = engine.caller.call(target, request).await;
        drop(lease);

        match result {
            Ok(success) => {
                if let Some(BreakerTransition::Closed) = engine.breakers.on_success(provider.id) {
                    log_event(
                        engine,
                        EventKind::CircuitClose,
                        None,
                        json!({ "provider": provider.id.as_str() }),
                    )
                    .await;
                }
                engine.telemetry.record_success(provider.id);

                let cost = call_cost_usd(
                    provider.id,
                    &success.model,
                    success.prompt_tokens,
                    success.completion_tokens,
                );
                let captured_at = Utc::now();

                if !engine.config.shadow_mode {
                    let response = NewResponse {
                        domain_id,
                        provider: provider.id,
                        model: success.model.clone(),
                        prompt_template_id: template.id.to_string(),
                        prompt_text: prompt.clone(),
                        response_text: success.text.clone(),
                        prompt_tokens: success.prompt_tokens,
                        completion_tokens: success.completion_tokens,
                        total_cost_usd: cost,
                        latency_ms: success.latency_ms,
                        captured_at,
                    };
                    let mut persisted = engine.store.persist_response(&response).await;
                    if persisted.is_err() {
                        persisted = engine.store.persist_response(&response).await;
                    }
                    match persisted {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(
                                provider = provider.id.as_str(),
                                template = template.id,
                                hostname,
                                "duplicate response suppressed by idempotency key"
                            );
                        }
                        Err(err) => {
                            error!(
                                provider = provider.id.as_str(),
                                hostname, "response persistence failed twice: {err}"
                            );
                            return Err(ElementFatal::Persistence);
                        }
                    }
                }

                log_event(
                    engine,
                    EventKind::CallSuccess,
                    Some(domain_id),
                    json!({
                        "provider": provider.id.as_str(),
                        "template": template.id,
                        "latency_ms": success.latency_ms,
                        "prompt_tokens": success.prompt_tokens,
                        "completion_tokens": success.completion_tokens,
                        "cost_usd": cost,
                    }),
                )
                .await;

                let mut metrics = shared.metrics();
                metrics.calls_succeeded += 1;
                metrics.total_cost_usd += cost;
                drop(metrics);

                return Ok(ElementOutcome::success());
            }
            Err(err) => {
                engine.telemetry.record_failure(provider.id);

                if err.kind == CallErrorKind::Auth {
                    engine.limiter.rotate(provider.id).await;
                }
                if let Some(BreakerTransition::Opened { cooldown }) =
                    engine.breakers.on_failure(provider.id, err.kind)
                {
                    log_event(
                        engine,
                        EventKind::CircuitOpen,
                        None,
                        json!({
                            "provider": provider.id.as_str(),
                            "cooldown_ms": cooldown.as_millis() as u64,
                        }),
                    )
                    .await;
                }

                log_event(
                    engine,
                    EventKind::CallFailure,
                    Some(domain_id),
                    json!({
                        "provider": provider.id.as_str(),
                        "template": template.id,
                        "kind": err.kind.as_str(),
                        "detail": err.detail,
                        "latency_ms": err.latency_ms,
                        "attempt": attempt,
                    }),
                )
                .await;
                shared.metrics().record_failure_kind(err.kind);

                if err.kind.is_retryable() && attempt < MAX_CALL_ATTEMPTS {
                    let delay =
                        backoff_delay_ms(RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS, attempt);
                    sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                    continue;
                }

                return Ok(ElementOutcome::failed(err.kind));
            }
        }
    }
}

/// Event-log writes never abort processing; a failed append is only logged.
async fn log_event(engine: &Engine, kind: EventKind, domain_id: Option<Uuid>, payload: Value) {
    if let Err(err) = engine.store.append_event(kind, domain_id, payload).await {
        warn!(kind = kind.as_str(), "failed to append event: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(success: bool, skipped_open: bool) -> ElementOutcome {
        ElementOutcome {
            success,
            skipped_open,
            error_kind: (!success && !skipped_open).then_some(CallErrorKind::Transient),
        }
    }

    #[test]
    fn full_tensor_commits_as_completed() {
        let outcomes = vec![outcome(true, false); 33];
        assert_eq!(commit_decision(&outcomes, 33), CommitDecision::Completed);
    }

    #[test]
    fn deficit_confined_to_open_circuits_commits_as_partial() {
        let mut outcomes = vec![outcome(true, false); 30];
        outcomes.extend(vec![outcome(false, true); 3]);
        assert_eq!(
            commit_decision(&outcomes, 33),
            CommitDecision::CompletedPartial
        );
    }

    #[test]
    fn real_failures_send_the_domain_back_to_pending() {
        let mut outcomes = vec![outcome(true, false); 31];
        outcomes.push(outcome(false, true));
        outcomes.push(outcome(false, false));
        assert_eq!(commit_decision(&outcomes, 33), CommitDecision::Returned);
    }

    #[test]
    fn an_entirely_failed_tensor_is_returned_not_partial() {
        let outcomes = vec![outcome(false, true); 33];
        assert_eq!(commit_decision(&outcomes, 33), CommitDecision::Returned);
    }

    #[test]
    fn missing_outcomes_disqualify_partial_commit() {
        let mut outcomes = vec![outcome(true, false); 20];
        outcomes.extend(vec![outcome(false, true); 3]);
        // 10 elements never reported.
        assert_eq!(commit_decision(&outcomes, 33), CommitDecision::Returned);
    }

    #[test]
    fn dominant_error_kind_is_the_most_frequent() {
        let outcomes = vec![
            ElementOutcome::failed(CallErrorKind::Transient),
            ElementOutcome::failed(CallErrorKind::RateLimited),
            ElementOutcome::failed(CallErrorKind::RateLimited),
            ElementOutcome::success(),
            ElementOutcome::skipped_open(),
        ];
        assert_eq!(
            dominant_error_kind(&outcomes),
            Some(CallErrorKind::RateLimited)
        );
        assert_eq!(dominant_error_kind(&[ElementOutcome::success()]), None);
    }

    #[test]
    fn failure_kinds_land_in_their_own_counters() {
        let mut metrics = RunMetrics::default();
        metrics.record_failure_kind(CallErrorKind::Auth);
        metrics.record_failure_kind(CallErrorKind::RateLimited);
        metrics.record_failure_kind(CallErrorKind::Transient);
        metrics.record_failure_kind(CallErrorKind::Transient);
        metrics.record_failure_kind(CallErrorKind::NonRetryable);

        assert_eq!(metrics.calls_failed, 5);
        assert_eq!(metrics.failures_auth, 1);
        assert_eq!(metrics.failures_rate_limited, 1);
        assert_eq!(metrics.failures_transient, 2);
        assert_eq!(metrics.failures_non_retryable, 1);
    }
}
