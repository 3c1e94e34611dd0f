use std::collections::HashMap;
use std::sync::Mutex;

use crate::providers::ProviderId;

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tariff {
    pub prompt_usd_per_mtok: f64,
    pub completion_usd_per_mtok: f64,
}

const fn tariff(prompt: f64, completion: f64) -> Tariff {
    Tariff {
        prompt_usd_per_mtok: prompt,
        completion_usd_per_mtok: completion,
    }
}

/// The single authoritative tariff table. Model names are matched by family
/// substring; unknown models fall back to the provider's default row.
pub fn tariff_for(provider: ProviderId, model: &str) -> Tariff {
    match provider {
        ProviderId::OpenAi => {
            if model.contains("gpt-4o-mini") {
                tariff(0.15, 0.60)
            } else if model.contains("gpt-4o") {
                tariff(2.50, 10.00)
            } else {
                tariff(0.50, 1.50)
            }
        }
        ProviderId::Anthropic => {
            if model.contains("opus") {
                tariff(15.00, 75.00)
            } else if model.contains("sonnet") {
                tariff(3.00, 15.00)
            } else {
                tariff(0.80, 4.00)
            }
        }
        ProviderId::Google => {
            if model.contains("pro") {
                tariff(1.25, 5.00)
            } else {
                tariff(0.075, 0.30)
            }
        }
        ProviderId::DeepSeek => tariff(0.14, 0.28),
        ProviderId::Mistral => {
            if model.contains("large") {
                tariff(2.00, 6.00)
            } else {
                tariff(0.20, 0.60)
            }
        }
        ProviderId::Xai => tariff(2.00, 10.00),
        ProviderId::Together => tariff(0.18, 0.18),
        ProviderId::Perplexity => tariff(1.00, 1.00),
        ProviderId::Cohere => tariff(0.50, 1.50),
        ProviderId::Ai21 => tariff(0.50, 0.70),
        ProviderId::Groq => tariff(0.05, 0.08),
    }
}

pub fn call_cost_usd(
    provider: ProviderId,
    model: &str,
    prompt_tokens: u32,
    completion_tokens: u32,
) -> f64 {
    let tariff = tariff_for(provider, model);
    f64::from(prompt_tokens) * tariff.prompt_usd_per_mtok / 1_000_000.0
        + f64::from(completion_tokens) * tariff.completion_usd_per_mtok / 1_000_000.0
}

const SCORE_MAX: i32 = 100;
const SCORE_MIN: i32 = 0;
const SUCCESS_CREDIT: i32 = 2;
const FAILURE_PENALTY: i32 = 10;

/// Rolling per-provider health scores, 0..=100. Providers start healthy.
pub struct Telemetry {
    scores: Mutex<HashMap<ProviderId, i32>>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            scores: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_success(&self, provider: ProviderId) {
        self.adjust(provider, SUCCESS_CREDIT);
    }

    pub fn record_failure(&self, provider: ProviderId) {
        self.adjust(provider, -FAILURE_PENALTY);
    }

    pub fn health_score(&self, provider: ProviderId) -> i32 {
        self.lock().get(&provider).copied().unwrap_or(SCORE_MAX)
    }

    fn adjust(&self, provider: ProviderId, delta: i32) {
        let mut scores = self.lock();
        let entry = scores.entry(provider).or_insert(SCORE_MAX);
        *entry = (*entry + delta).clamp(SCORE_MIN, SCORE_MAX);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ProviderId, i32>> {
        match self.scores.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_combines_prompt_and_completion_tariffs() {
        let cost = call_cost_usd(ProviderId::OpenAi, "gpt-4o-mini", 1_000_000, 1_000_000);
        assert!((cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn unknown_models_fall_back_to_provider_default() {
        assert_eq!(
            tariff_for(ProviderId::Anthropic, "claude-next"),
            tariff_for(ProviderId::Anthropic, "claude-3-5-haiku-20241022")
        );
    }

    #[test]
    fn model_families_select_distinct_rows() {
        let haiku = tariff_for(ProviderId::Anthropic, "claude-3-5-haiku-20241022");
        let opus = tariff_for(ProviderId::Anthropic, "claude-3-opus-20240229");
        assert!(opus.prompt_usd_per_mtok > haiku.prompt_usd_per_mtok);
    }

    #[test]
    fn health_score_is_clamped() {
        let telemetry = Telemetry::new();
        assert_eq!(telemetry.health_score(ProviderId::Groq), 100);

        for _ in 0..20 {
            telemetry.record_failure(ProviderId::Groq);
        }
        assert_eq!(telemetry.health_score(ProviderId::Groq), 0);

        for _ in 0..3 {
            telemetry.record_success(ProviderId::Groq);
        }
        assert_eq!(telemetry.health_score(ProviderId::Groq), 6);

        for _ in 0..100 {
            telemetry.record_success(ProviderId::Groq);
        }
        assert_eq!(telemetry.health_score(ProviderId::Groq), 100);
    }
}
