use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use super::ProviderId;

const MAX_NUMBERED_KEYS: u32 = 16;

pub(super) fn pools_from_env() -> HashMap<ProviderId, Arc<Vec<String>>> {
    let lookup = |name: &str| env::var(name).ok();
    ProviderId::ALL
        .into_iter()
        .map(|id| (id, Arc::new(collect_keys(id.env_prefix(), &lookup))))
        .collect()
}

/// Gathers the key pool for one provider. Deployments have historically used
/// both `PROVIDER_API_KEY_2` and `PROVIDER_API_KEY2`; both spellings are
/// honored, empty values are skipped, and duplicates collapse to the first
/// occurrence.
fn collect_keys(prefix: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Vec<String> {
    let mut keys = Vec::new();
    let mut push = |value: Option<String>, keys: &mut Vec<String>| {
        if let Some(raw) = value {
            let trimmed = raw.trim();
            if !trimmed.is_empty() && !keys.iter().any(|existing| existing == trimmed) {
                keys.push(trimmed.to_string());
            }
        }
    };

    push(lookup(&format!("{prefix}_API_KEY")), &mut keys);
    for n in 1..=MAX_NUMBERED_KEYS {
        push(lookup(&format!("{prefix}_API_KEY_{n}")), &mut keys);
        push(lookup(&format!("{prefix}_API_KEY{n}")), &mut keys);
    }

    keys
}

#[cfg(test)]
mod tests {
    use super::collect_keys;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name: &str| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn accepts_both_numbered_spellings() {
        let lookup = lookup_from(&[
            ("OPENAI_API_KEY", "sk-base"),
            ("OPENAI_API_KEY_1", "sk-underscore"),
            ("OPENAI_API_KEY2", "sk-bare"),
        ]);
        let keys = collect_keys("OPENAI", &lookup);
        assert_eq!(keys, vec!["sk-base", "sk-underscore", "sk-bare"]);
    }

    #[test]
    fn skips_empty_and_duplicate_values() {
        let lookup = lookup_from(&[
            ("GROQ_API_KEY", "  "),
            ("GROQ_API_KEY_1", "gsk-one"),
            ("GROQ_API_KEY1", "gsk-one"),
            ("GROQ_API_KEY_2", "gsk-two"),
        ]);
        let keys = collect_keys("GROQ", &lookup);
        assert_eq!(keys, vec!["gsk-one", "gsk-two"]);
    }

    #[test]
    fn missing_provider_yields_empty_pool() {
        let lookup = lookup_from(&[]);
        assert!(collect_keys("COHERE", &lookup).is_empty());
    }
}
