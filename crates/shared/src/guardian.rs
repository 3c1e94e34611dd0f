use chrono::{Duration, Utc};
use serde::Serialize;
use url::Url;

use crate::providers::Provider;
use crate::repos::{Store, StoreError};

/// Floors below which the infrastructure is considered too degraded to
/// crawl. Running anyway would let outage artifacts masquerade as brand
/// memory decay in the downstream temporal analysis.
#[derive(Debug, Clone, Copy)]
pub struct GuardianThresholds {
    pub min_responses_7d: i64,
    pub min_active_providers_3d: i64,
    pub min_active_domains_3d: i64,
    pub min_mean_response_chars_24h: f64,
}

impl Default for GuardianThresholds {
    fn default() -> Self {
        Self {
            min_responses_7d: 1_000,
            min_active_providers_3d: 6,
            min_active_domains_3d: 100,
            min_mean_response_chars_24h: 500.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockReason {
    pub check: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub reasons: Vec<BlockReason>,
}

impl PreflightReport {
    pub fn passed(&self) -> bool {
        self.reasons.is_empty()
    }
}

/// Rolling-window signals the pre-flight gate inspects.
#[derive(Debug, Clone, Copy)]
pub struct PreflightWindow {
    pub responses_7d: i64,
    pub active_providers_3d: i64,
    pub active_domains_3d: i64,
    pub mean_response_chars_24h: f64,
}

pub fn evaluate_preflight(
    window: &PreflightWindow,
    thresholds: &GuardianThresholds,
) -> Vec<BlockReason> {
    let mut reasons = Vec::new();

    if window.responses_7d < thresholds.min_responses_7d {
        reasons.push(BlockReason {
            check: "response_volume",
            detail: format!(
                "{} successful responses in the last 7 days, need {}",
                window.responses_7d, thresholds.min_responses_7d
            ),
        });
    }
    if window.active_providers_3d < thresholds.min_active_providers_3d {
        reasons.push(BlockReason {
            check: "provider_coverage",
            detail: format!(
                "{} distinct providers active in the last 3 days, need {}",
                window.active_providers_3d, thresholds.min_active_providers_3d
            ),
        });
    }
    if window.active_domains_3d < thresholds.min_active_domains_3d {
        reasons.push(BlockReason {
            check: "domain_coverage",
            detail: format!(
                "{} distinct domains processed in the last 3 days, need {}",
                window.active_domains_3d, thresholds.min_active_domains_3d
            ),
        });
    }
    if window.mean_response_chars_24h < thresholds.min_mean_response_chars_24h {
        reasons.push(BlockReason {
            check: "response_quality",
            detail: format!(
                "mean response length {:.0} chars in the last 24h, need {:.0}",
                window.mean_response_chars_24h, thresholds.min_mean_response_chars_24h
            ),
        });
    }

    reasons
}

/// Runs the pre-flight gate against the store, plus optional endpoint
/// liveness probes for the critical providers.
pub async fn preflight(
    store: &Store,
    thresholds: &GuardianThresholds,
    prober: Option<&LivenessProber>,
    critical_providers: &[&'static Provider],
) -> Result<PreflightReport, StoreError> {
    let now = Utc::now();
    let window = PreflightWindow {
        responses_7d: store.count_responses_since(now - Duration::days(7)).await?,
        active_providers_3d: store.distinct_providers_since(now - Duration::days(3)).await?,
        active_domains_3d: store.distinct_domains_since(now - Duration::days(3)).await?,
        mean_response_chars_24h: store
            .mean_response_length_between(now - Duration::days(1), now)
            .await?,
    };

    tracing::debug!(
        responses_7d = window.responses_7d,
        active_providers_3d = window.active_providers_3d,
        active_domains_3d = window.active_domains_3d,
        mean_response_chars_24h = window.mean_response_chars_24h,
        "guardian pre-flight window"
    );
    let mut reasons = evaluate_preflight(&window, thresholds);

    if let Some(prober) = prober {
        for provider in critical_providers {
            if !prober.probe(provider).await {
                reasons.push(BlockReason {
                    check: "endpoint_liveness",
                    detail: format!("{} endpoint failed its liveness probe", provider.id.as_str()),
                });
            }
        }
    }

    Ok(PreflightReport { reasons })
}

/// Reachability probe against a provider's endpoint origin. Any HTTP answer
/// counts as alive; only connect failures and timeouts count as dead.
pub struct LivenessProber {
    client: reqwest::Client,
}

impl LivenessProber {
    pub fn new(timeout: std::time::Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    pub async fn probe(&self, provider: &Provider) -> bool {
        let Ok(url) = Url::parse(provider.endpoint) else {
            return false;
        };
        let origin = url.origin().ascii_serialization();
        self.client.get(origin).send().await.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    VolumeDrop,
    ModelFailure,
    QualityDegradation,
    CoverageGap,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VolumeDrop => "volume_drop",
            Self::ModelFailure => "model_failure",
            Self::QualityDegradation => "quality_degradation",
            Self::CoverageGap => "coverage_gap",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyClass {
    SystemFailure,
    MemoryDecay,
    Unknown,
}

impl AnomalyClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SystemFailure => "system_failure",
            Self::MemoryDecay => "memory_decay",
            Self::Unknown => "unknown",
        }
    }

    /// Only genuine memory decay may flow to downstream tensor consumers.
    pub fn propagation_allowed(&self) -> bool {
        matches!(self, Self::MemoryDecay)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub class: AnomalyClass,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct ProviderActivity {
    pub provider: String,
    pub active_days: i64,
    pub responses_last_3d: i64,
}

/// Twelve-week lookback aggregates feeding the classifier.
#[derive(Debug, Clone)]
pub struct AnomalyInput {
    /// Weekly response counts, oldest first, current week last.
    pub weekly_response_counts: Vec<i64>,
    pub providers: Vec<ProviderActivity>,
    pub mean_length_prior_day: f64,
    pub mean_length_latest_day: f64,
    pub untouched_domains_7d: i64,
}

const VOLUME_ZSCORE_THRESHOLD: f64 = 2.5;
const QUALITY_DROP_RATIO: f64 = 0.30;
const COVERAGE_GAP_DOMAINS: i64 = 100;
const MIN_WEEKS_FOR_ZSCORE: usize = 4;

pub fn detect_anomalies(input: &AnomalyInput) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();

    let silent_providers: Vec<&ProviderActivity> = input
        .providers
        .iter()
        .filter(|activity| activity.active_days >= 1 && activity.responses_last_3d == 0)
        .collect();
    let has_model_failure = !silent_providers.is_empty();

    let volume_z = weekly_zscore(&input.weekly_response_counts);
    let volume_dropped = volume_z.is_some_and(|z| z.abs() > VOLUME_ZSCORE_THRESHOLD);
    if let Some(z) = volume_z
        && volume_dropped
    {
        // A silent provider explains the drop as an infra problem; without
        // one the cause is undetermined.
        let class = if has_model_failure {
            AnomalyClass::SystemFailure
        } else {
            AnomalyClass::Unknown
        };
        anomalies.push(Anomaly {
            kind: AnomalyKind::VolumeDrop,
            class,
            detail: format!("weekly response volume z-score {z:.2}"),
        });
    }

    for activity in &silent_providers {
        anomalies.push(Anomaly {
            kind: AnomalyKind::ModelFailure,
            class: AnomalyClass::SystemFailure,
            detail: format!(
                "{} was active {} days in the window but produced nothing in the last 3 days",
                activity.provider, activity.active_days
            ),
        });
    }

    if input.mean_length_prior_day > 0.0 {
        let drop_ratio = (input.mean_length_prior_day - input.mean_length_latest_day)
            / input.mean_length_prior_day;
        if drop_ratio > QUALITY_DROP_RATIO {
            // Shorter answers with healthy volume and full provider coverage
            // read as the models knowing less, not the pipeline breaking.
            let class = if volume_dropped || has_model_failure {
                AnomalyClass::SystemFailure
            } else {
                AnomalyClass::MemoryDecay
            };
            anomalies.push(Anomaly {
                kind: AnomalyKind::QualityDegradation,
                class,
                detail: format!(
                    "mean response length fell {:.0}% day-over-day ({:.0} to {:.0} chars)",
                    drop_ratio * 100.0,
                    input.mean_length_prior_day,
                    input.mean_length_latest_day
                ),
            });
        }
    }

    if input.untouched_domains_7d > COVERAGE_GAP_DOMAINS {
        anomalies.push(Anomaly {
            kind: AnomalyKind::CoverageGap,
            class: AnomalyClass::SystemFailure,
            detail: format!(
                "{} domains untouched for 7 days",
                input.untouched_domains_7d
            ),
        });
    }

    anomalies
}

/// z-score of the latest week against the preceding weeks. None when the
/// history is too short or flat to be meaningful.
fn weekly_zscore(counts: &[i64]) -> Option<f64> {
    if counts.len() < MIN_WEEKS_FOR_ZSCORE {
        return None;
    }
    let (history, latest) = counts.split_at(counts.len() - 1);
    let latest = latest[0] as f64;
    let mean = history.iter().sum::<i64>() as f64 / history.len() as f64;
    let variance = history
        .iter()
        .map(|count| {
            let diff = *count as f64 - mean;
            diff * diff
        })
        .sum::<f64>()
        / history.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return None;
    }
    Some((latest - mean) / std_dev)
}

pub async fn collect_anomaly_input(
    store: &Store,
    source: &str,
) -> Result<AnomalyInput, StoreError> {
    let now = Utc::now();
    let providers = store
        .provider_activity_window()
        .await?
        .into_iter()
        .map(|row| ProviderActivity {
            provider: row.provider,
            active_days: row.active_days,
            responses_last_3d: row.responses_last_3d,
        })
        .collect();

    Ok(AnomalyInput {
        weekly_response_counts: store.weekly_response_counts(12).await?,
        providers,
        mean_length_prior_day: store
            .mean_response_length_between(now - Duration::days(2), now - Duration::days(1))
            .await?,
        mean_length_latest_day: store
            .mean_response_length_between(now - Duration::days(1), now)
            .await?,
        untouched_domains_7d: store
            .count_untouched_domains(source, now - Duration::days(7))
            .await?,
    })
}

pub async fn anomalies(store: &Store, source: &str) -> Result<Vec<Anomaly>, StoreError> {
    let input = collect_anomaly_input(store, source).await?;
    Ok(detect_anomalies(&input))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_input() -> AnomalyInput {
        AnomalyInput {
            weekly_response_counts: vec![1000, 1020, 980, 1010, 990, 1005],
            providers: vec![ProviderActivity {
                provider: "openai".to_string(),
                active_days: 80,
                responses_last_3d: 500,
            }],
            mean_length_prior_day: 900.0,
            mean_length_latest_day: 880.0,
            untouched_domains_7d: 10,
        }
    }

    #[test]
    fn healthy_window_produces_no_anomalies() {
        assert!(detect_anomalies(&healthy_input()).is_empty());
    }

    #[test]
    fn collapsed_weekly_volume_is_flagged() {
        let mut input = healthy_input();
        input.weekly_response_counts = vec![1000, 1020, 980, 1010, 990, 50];
        let anomalies = detect_anomalies(&input);
        assert!(
            anomalies
                .iter()
                .any(|anomaly| anomaly.kind == AnomalyKind::VolumeDrop)
        );
        // No silent provider, so the drop is unexplained rather than pinned
        // on infrastructure.
        let drop = anomalies
            .iter()
            .find(|anomaly| anomaly.kind == AnomalyKind::VolumeDrop)
            .expect("volume drop present");
        assert_eq!(drop.class, AnomalyClass::Unknown);
    }

    #[test]
    fn silent_provider_is_a_system_failure() {
        let mut input = healthy_input();
        input.providers.push(ProviderActivity {
            provider: "cohere".to_string(),
            active_days: 30,
            responses_last_3d: 0,
        });
        let anomalies = detect_anomalies(&input);
        let failure = anomalies
            .iter()
            .find(|anomaly| anomaly.kind == AnomalyKind::ModelFailure)
            .expect("model failure present");
        assert_eq!(failure.class, AnomalyClass::SystemFailure);
        assert!(!failure.class.propagation_allowed());
    }

    #[test]
    fn quality_drop_with_healthy_volume_reads_as_memory_decay() {
        let mut input = healthy_input();
        input.mean_length_prior_day = 1000.0;
        input.mean_length_latest_day = 600.0;
        let anomalies = detect_anomalies(&input);
        let degradation = anomalies
            .iter()
            .find(|anomaly| anomaly.kind == AnomalyKind::QualityDegradation)
            .expect("quality degradation present");
        assert_eq!(degradation.class, AnomalyClass::MemoryDecay);
        assert!(degradation.class.propagation_allowed());
    }

    #[test]
    fn quality_drop_during_provider_outage_is_not_memory_decay() {
        let mut input = healthy_input();
        input.mean_length_prior_day = 1000.0;
        input.mean_length_latest_day = 600.0;
        input.providers.push(ProviderActivity {
            provider: "groq".to_string(),
            active_days: 12,
            responses_last_3d: 0,
        });
        let anomalies = detect_anomalies(&input);
        let degradation = anomalies
            .iter()
            .find(|anomaly| anomaly.kind == AnomalyKind::QualityDegradation)
            .expect("quality degradation present");
        assert_eq!(degradation.class, AnomalyClass::SystemFailure);
    }

    #[test]
    fn coverage_gap_over_threshold_is_flagged() {
        let mut input = healthy_input();
        input.untouched_domains_7d = 250;
        let anomalies = detect_anomalies(&input);
        assert!(
            anomalies
                .iter()
                .any(|anomaly| anomaly.kind == AnomalyKind::CoverageGap
                    && anomaly.class == AnomalyClass::SystemFailure)
        );
    }

    #[test]
    fn zscore_needs_history_and_spread() {
        assert_eq!(weekly_zscore(&[100, 100]), None);
        assert_eq!(weekly_zscore(&[100, 100, 100, 100]), None);
        let z = weekly_zscore(&[100, 110, 90, 100, 10]).expect("spread present");
        assert!(z < -2.5);
    }

    #[test]
    fn preflight_reports_every_failing_signal() {
        let thresholds = GuardianThresholds::default();
        let window = PreflightWindow {
            responses_7d: 200,
            active_providers_3d: 3,
            active_domains_3d: 40,
            mean_response_chars_24h: 120.0,
        };
        let reasons = evaluate_preflight(&window, &thresholds);
        assert_eq!(reasons.len(), 4);

        let healthy = PreflightWindow {
            responses_7d: 5_000,
            active_providers_3d: 9,
            active_domains_3d: 700,
            mean_response_chars_24h: 900.0,
        };
        assert!(evaluate_preflight(&healthy, &thresholds).is_empty());
    }
}
