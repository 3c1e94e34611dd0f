use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{Duration, Instant, sleep};

use crate::providers::{ProviderId, ProviderRegistry};

/// One provider's share of the limiter: its key slots and a rotation cursor.
///
/// Fairness comes from two places. The rotation mutex queues callers of the
/// same provider FIFO while a key is being chosen; each key's own mutex
/// serializes the two tasks that would otherwise hold the same credential at
/// once.
struct ProviderSlots {
    rotation: Mutex<usize>,
    slots: Vec<KeySlot>,
    min_delay: Duration,
}

struct KeySlot {
    key: Arc<str>,
    clock: Arc<Mutex<KeyClock>>,
}

struct KeyClock {
    last_used_at: Option<Instant>,
}

pub struct LimiterSeed {
    pub provider: ProviderId,
    pub keys: Vec<String>,
    pub min_delay_ms: u64,
}

/// Round-robin key rotator enforcing minimum inter-request spacing per key.
pub struct RateLimiter {
    providers: HashMap<ProviderId, ProviderSlots>,
}

/// A granted key. Holding the lease keeps the key exclusively checked out;
/// the spacing clock was stamped at acquisition, so throttling reflects
/// request start rather than completion.
pub struct KeyLease {
    key: Arc<str>,
    acquired_at: Instant,
    _clock: OwnedMutexGuard<KeyClock>,
}

impl KeyLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }
}

impl RateLimiter {
    pub fn from_seeds(seeds: Vec<LimiterSeed>) -> Self {
        let providers = seeds
            .into_iter()
            .map(|seed| {
                let slots = seed
                    .keys
                    .into_iter()
                    .map(|key| KeySlot {
                        key: Arc::from(key.as_str()),
                        clock: Arc::new(Mutex::new(KeyClock { last_used_at: None })),
                    })
                    .collect();
                (
                    seed.provider,
                    ProviderSlots {
                        rotation: Mutex::new(0),
                        slots,
                        min_delay: Duration::from_millis(seed.min_delay_ms),
                    },
                )
            })
            .collect();
        Self { providers }
    }

    pub fn for_registry(registry: &ProviderRegistry) -> Self {
        let seeds = registry
            .list_enabled()
            .into_iter()
            .map(|provider| LimiterSeed {
                provider: provider.id,
                keys: registry.keys(provider.id).to_vec(),
                min_delay_ms: provider.effective_min_delay_ms(),
            })
            .collect();
        Self::from_seeds(seeds)
    }

    /// Suspends until a key for `provider` may start a request. Returns
    /// `None` when the provider has no configured keys.
    pub async fn acquire(&self, provider: ProviderId) -> Option<KeyLease> {
        let slots = self.providers.get(&provider)?;
        let slot_count = slots.slots.len();
        if slot_count == 0 {
            return None;
        }

        let mut cursor = slots.rotation.lock().await;
        let mut chosen: Option<(usize, OwnedMutexGuard<KeyClock>)> = None;
        for step in 0..slot_count {
            let idx = (*cursor + step) % slot_count;
            let Ok(guard) = slots.slots[idx].clock.clone().try_lock_owned() else {
                continue;
            };
            let replace = match &chosen {
                None => true,
                Some((_, best)) => used_earlier(guard.last_used_at, best.last_used_at),
            };
            if replace {
                chosen = Some((idx, guard));
            }
        }

        match chosen {
            Some((idx, guard)) => {
                *cursor = (idx + 1) % slot_count;
                drop(cursor);
                Some(grant(&slots.slots[idx], guard, slots.min_delay).await)
            }
            None => {
                // Every key is mid-call; queue on the round-robin slot.
                let idx = *cursor % slot_count;
                *cursor = (idx + 1) % slot_count;
                drop(cursor);
                let guard = slots.slots[idx].clock.clone().lock_owned().await;
                Some(grant(&slots.slots[idx], guard, slots.min_delay).await)
            }
        }
    }

    /// Skips the rotation cursor forward one key. Invoked after an
    /// authentication failure so the bad credential is not immediately
    /// re-selected.
    pub async fn rotate(&self, provider: ProviderId) {
        if let Some(slots) = self.providers.get(&provider)
            && !slots.slots.is_empty()
        {
            let mut cursor = slots.rotation.lock().await;
            *cursor = (*cursor + 1) % slots.slots.len();
        }
    }

    pub fn key_count(&self, provider: ProviderId) -> usize {
        self.providers
            .get(&provider)
            .map(|slots| slots.slots.len())
            .unwrap_or(0)
    }
}

async fn grant(
    slot: &KeySlot,
    mut guard: OwnedMutexGuard<KeyClock>,
    min_delay: Duration,
) -> KeyLease {
    if let Some(last_used) = guard.last_used_at {
        let since = last_used.elapsed();
        if since < min_delay {
            sleep(min_delay - since).await;
        }
    }
    let acquired_at = Instant::now();
    guard.last_used_at = Some(acquired_at);
    KeyLease {
        key: slot.key.clone(),
        acquired_at,
        _clock: guard,
    }
}

/// Never-used keys sort first; among used keys the staler one wins. Two
/// never-used keys keep scan order, which preserves round-robin from the
/// cursor on a cold pool.
fn used_earlier(candidate: Option<Instant>, best: Option<Instant>) -> bool {
    match (candidate, best) {
        (None, None) => false,
        (None, Some(_)) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => a < b,
    }
}
