use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub mod adapter;
mod keys;

/// Closed set of configured LLM providers. Adding a provider means extending
/// this enum and the catalog, never matching on free-form strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    OpenAi,
    Anthropic,
    Google,
    DeepSeek,
    Mistral,
    Xai,
    Together,
    Perplexity,
    Cohere,
    Ai21,
    Groq,
}

impl ProviderId {
    pub const ALL: [ProviderId; 11] = [
        Self::OpenAi,
        Self::Anthropic,
        Self::Google,
        Self::DeepSeek,
        Self::Mistral,
        Self::Xai,
        Self::Together,
        Self::Perplexity,
        Self::Cohere,
        Self::Ai21,
        Self::Groq,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::DeepSeek => "deepseek",
            Self::Mistral => "mistral",
            Self::Xai => "xai",
            Self::Together => "together",
            Self::Perplexity => "perplexity",
            Self::Cohere => "cohere",
            Self::Ai21 => "ai21",
            Self::Groq => "groq",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == value)
    }

    /// Prefix for `<PROVIDER>_API_KEY[_N]` env vars.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI",
            Self::Anthropic => "ANTHROPIC",
            Self::Google => "GOOGLE",
            Self::DeepSeek => "DEEPSEEK",
            Self::Mistral => "MISTRAL",
            Self::Xai => "XAI",
            Self::Together => "TOGETHER",
            Self::Perplexity => "PERPLEXITY",
            Self::Cohere => "COHERE",
            Self::Ai21 => "AI21",
            Self::Groq => "GROQ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderTier {
    Premium,
    Standard,
    Economy,
}

impl ProviderTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Premium => "premium",
            Self::Standard => "standard",
            Self::Economy => "economy",
        }
    }
}

/// Wire dialect spoken by a provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAiChat,
    AnthropicMessages,
    GeminiGenerateContent,
    Ai21Complete,
    CohereGenerate,
}

#[derive(Debug)]
pub struct Provider {
    pub id: ProviderId,
    pub display_name: &'static str,
    pub endpoint: &'static str,
    pub dialect: Dialect,
    pub default_model: &'static str,
    pub rpm_per_key: u32,
    pub min_delay_ms: u64,
    pub tier: ProviderTier,
}

impl Provider {
    /// Spacing that satisfies both the configured floor and the per-key rpm
    /// budget.
    pub fn effective_min_delay_ms(&self) -> u64 {
        let rpm_spacing = if self.rpm_per_key == 0 {
            0
        } else {
            60_000 / u64::from(self.rpm_per_key)
        };
        self.min_delay_ms.max(rpm_spacing)
    }
}

static CATALOG: [Provider; 11] = [
    Provider {
        id: ProviderId::OpenAi,
        display_name: "OpenAI",
        endpoint: "https://api.openai.com/v1/chat/completions",
        dialect: Dialect::OpenAiChat,
        default_model: "gpt-4o-mini",
        rpm_per_key: 60,
        min_delay_ms: 1_000,
        tier: ProviderTier::Premium,
    },
    Provider {
        id: ProviderId::Anthropic,
        display_name: "Anthropic",
        endpoint: "https://api.anthropic.com/v1/messages",
        dialect: Dialect::AnthropicMessages,
        default_model: "claude-3-5-haiku-20241022",
        rpm_per_key: 50,
        min_delay_ms: 1_200,
        tier: ProviderTier::Premium,
    },
    Provider {
        id: ProviderId::Google,
        display_name: "Google Gemini",
        endpoint: "https://generativelanguage.googleapis.com/v1beta/models",
        dialect: Dialect::GeminiGenerateContent,
        default_model: "gemini-1.5-flash",
        rpm_per_key: 60,
        min_delay_ms: 1_000,
        tier: ProviderTier::Standard,
    },
    Provider {
        id: ProviderId::DeepSeek,
        display_name: "DeepSeek",
        endpoint: "https://api.deepseek.com/v1/chat/completions",
        dialect: Dialect::OpenAiChat,
        default_model: "deepseek-chat",
        rpm_per_key: 30,
        min_delay_ms: 2_000,
        tier: ProviderTier::Economy,
    },
    Provider {
        id: ProviderId::Mistral,
        display_name: "Mistral",
        endpoint: "https://api.mistral.ai/v1/chat/completions",
        dialect: Dialect::OpenAiChat,
        default_model: "mistral-small-latest",
        rpm_per_key: 60,
        min_delay_ms: 1_000,
        tier: ProviderTier::Standard,
    },
    Provider {
        id: ProviderId::Xai,
        display_name: "xAI",
        endpoint: "https://api.x.ai/v1/chat/completions",
        dialect: Dialect::OpenAiChat,
        default_model: "grok-2-latest",
        rpm_per_key: 30,
        min_delay_ms: 2_000,
        tier: ProviderTier::Standard,
    },
    Provider {
        id: ProviderId::Together,
        display_name: "Together",
        endpoint: "https://api.together.xyz/v1/chat/completions",
        dialect: Dialect::OpenAiChat,
        default_model: "meta-llama/Llama-3.1-8B-Instruct-Turbo",
        rpm_per_key: 60,
        min_delay_ms: 1_000,
        tier: ProviderTier::Economy,
    },
    Provider {
        id: ProviderId::Perplexity,
        display_name: "Perplexity",
        endpoint: "https://api.perplexity.ai/chat/completions",
        dialect: Dialect::OpenAiChat,
        default_model: "sonar",
        rpm_per_key: 30,
        min_delay_ms: 2_000,
        tier: ProviderTier::Standard,
    },
    Provider {
        id: ProviderId::Cohere,
        display_name: "Cohere",
        endpoint: "https://api.cohere.ai/v1/generate",
        dialect: Dialect::CohereGenerate,
        default_model: "command",
        rpm_per_key: 40,
        min_delay_ms: 1_500,
        tier: ProviderTier::Standard,
    },
    Provider {
        id: ProviderId::Ai21,
        display_name: "AI21",
        endpoint: "https://api.ai21.com/studio/v1",
        dialect: Dialect::Ai21Complete,
        default_model: "j2-ultra",
        rpm_per_key: 30,
        min_delay_ms: 2_000,
        tier: ProviderTier::Economy,
    },
    Provider {
        id: ProviderId::Groq,
        display_name: "Groq",
        endpoint: "https://api.groq.com/openai/v1/chat/completions",
        dialect: Dialect::OpenAiChat,
        default_model: "llama-3.1-8b-instant",
        rpm_per_key: 30,
        min_delay_ms: 2_000,
        tier: ProviderTier::Economy,
    },
];

pub fn catalog() -> &'static [Provider; 11] {
    &CATALOG
}

pub fn provider(id: ProviderId) -> &'static Provider {
    CATALOG
        .iter()
        .find(|provider| provider.id == id)
        .expect("catalog covers every provider id")
}

/// Immutable provider catalog plus the mutable per-provider key pools.
///
/// Key pools can be swapped at runtime (`reload_keys`); in-flight calls keep
/// the key string they were handed.
pub struct ProviderRegistry {
    pools: RwLock<HashMap<ProviderId, Arc<Vec<String>>>>,
}

impl ProviderRegistry {
    pub fn from_env() -> Self {
        Self {
            pools: RwLock::new(keys::pools_from_env()),
        }
    }

    pub fn with_pools(pools: HashMap<ProviderId, Vec<String>>) -> Self {
        Self {
            pools: RwLock::new(
                pools
                    .into_iter()
                    .map(|(id, keys)| (id, Arc::new(keys)))
                    .collect(),
            ),
        }
    }

    /// Providers with at least one configured key, in catalog order.
    pub fn list_enabled(&self) -> Vec<&'static Provider> {
        CATALOG
            .iter()
            .filter(|provider| self.key_pool_size(provider.id) > 0)
            .collect()
    }

    pub fn enabled_with_tiers(&self, tiers: &[ProviderTier]) -> Vec<&'static Provider> {
        self.list_enabled()
            .into_iter()
            .filter(|provider| tiers.contains(&provider.tier))
            .collect()
    }

    pub fn get(&self, id: ProviderId) -> &'static Provider {
        provider(id)
    }

    pub fn keys(&self, id: ProviderId) -> Arc<Vec<String>> {
        let pools = match self.pools.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pools.get(&id).cloned().unwrap_or_default()
    }

    pub fn key_pool_size(&self, id: ProviderId) -> usize {
        self.keys(id).len()
    }

    /// Re-read key pools from the environment without disturbing in-flight
    /// calls; they keep the key string they were handed.
    pub fn reload_keys(&self) {
        let fresh = keys::pools_from_env();
        let enabled = fresh.values().filter(|keys| !keys.is_empty()).count();
        let mut pools = match self.pools.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *pools = fresh;
        tracing::info!(providers_enabled = enabled, "provider key pools reloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_covers_all_ids_once() {
        for id in ProviderId::ALL {
            assert_eq!(provider(id).id, id);
        }
        assert_eq!(CATALOG.len(), ProviderId::ALL.len());
    }

    #[test]
    fn provider_id_round_trips_through_str() {
        for id in ProviderId::ALL {
            assert_eq!(ProviderId::parse(id.as_str()), Some(id));
        }
        assert_eq!(ProviderId::parse("openrouter"), None);
    }

    #[test]
    fn registry_disables_providers_without_keys() {
        let mut pools = HashMap::new();
        pools.insert(ProviderId::OpenAi, vec!["sk-one".to_string()]);
        pools.insert(ProviderId::Cohere, Vec::new());
        let registry = ProviderRegistry::with_pools(pools);

        let enabled = registry.list_enabled();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, ProviderId::OpenAi);
    }

    #[test]
    fn tier_filter_respects_catalog_tiers() {
        let pools = ProviderId::ALL
            .into_iter()
            .map(|id| (id, vec![format!("key-{}", id.as_str())]))
            .collect();
        let registry = ProviderRegistry::with_pools(pools);

        let economy = registry.enabled_with_tiers(&[ProviderTier::Economy]);
        assert!(
            economy
                .iter()
                .all(|provider| provider.tier == ProviderTier::Economy)
        );
        assert!(economy.iter().any(|p| p.id == ProviderId::Groq));
        assert!(!economy.iter().any(|p| p.id == ProviderId::OpenAi));
    }

    #[test]
    fn rpm_budget_tightens_min_delay() {
        let provider = Provider {
            id: ProviderId::OpenAi,
            display_name: "test",
            endpoint: "https://example.invalid",
            dialect: Dialect::OpenAiChat,
            default_model: "m",
            rpm_per_key: 20,
            min_delay_ms: 1_000,
            tier: ProviderTier::Premium,
        };
        assert_eq!(provider.effective_min_delay_ms(), 3_000);
    }
}
