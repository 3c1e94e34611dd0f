use std::collections::HashMap;
use std::sync::Mutex;

use tokio::time::{Duration, Instant};

use crate::providers::ProviderId;
use crate::providers::adapter::CallErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub base_cooldown: Duration,
    pub max_cooldown: Duration,
    /// Non-retryable failures stop counting toward the threshold once this
    /// many have been seen from a provider within an hour.
    pub non_retryable_hourly_cap: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(15 * 60),
            non_retryable_hourly_cap: 10,
        }
    }
}

#[derive(Debug)]
struct Cell {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    cooldown: Duration,
    probe_in_flight: bool,
    non_retryable_window_start: Option<Instant>,
    non_retryable_count: u32,
}

impl Cell {
    fn new(settings: &BreakerSettings) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            open_until: None,
            cooldown: settings.base_cooldown,
            probe_in_flight: false,
            non_retryable_window_start: None,
            non_retryable_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerCheck {
    Allow,
    Deny { retry_after: Duration },
}

/// State change worth recording in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Opened { cooldown: Duration },
    Closed,
}

/// Per-provider three-state circuit breakers behind one lock. The state is
/// tiny and the lock is never held across an await.
pub struct BreakerBoard {
    settings: BreakerSettings,
    cells: Mutex<HashMap<ProviderId, Cell>>,
}

impl BreakerBoard {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, provider: ProviderId) -> BreakerCheck {
        let now = Instant::now();
        let mut cells = self.lock();
        let settings = self.settings;
        let cell = cells
            .entry(provider)
            .or_insert_with(|| Cell::new(&settings));

        match cell.state {
            CircuitState::Closed => BreakerCheck::Allow,
            CircuitState::Open => {
                let open_until = cell.open_until.unwrap_or(now);
                if now >= open_until {
                    cell.state = CircuitState::HalfOpen;
                    cell.probe_in_flight = true;
                    BreakerCheck::Allow
                } else {
                    BreakerCheck::Deny {
                        retry_after: open_until.saturating_duration_since(now),
                    }
                }
            }
            CircuitState::HalfOpen => {
                if cell.probe_in_flight {
                    BreakerCheck::Deny {
                        retry_after: Duration::from_secs(1),
                    }
                } else {
                    cell.probe_in_flight = true;
                    BreakerCheck::Allow
                }
            }
        }
    }

    pub fn on_success(&self, provider: ProviderId) -> Option<BreakerTransition> {
        let mut cells = self.lock();
        let settings = self.settings;
        let cell = cells
            .entry(provider)
            .or_insert_with(|| Cell::new(&settings));

        match cell.state {
            CircuitState::Closed => {
                cell.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                cell.state = CircuitState::Closed;
                cell.consecutive_failures = 0;
                cell.open_until = None;
                cell.cooldown = self.settings.base_cooldown;
                cell.probe_in_flight = false;
                Some(BreakerTransition::Closed)
            }
        }
    }

    pub fn on_failure(
        &self,
        provider: ProviderId,
        kind: CallErrorKind,
    ) -> Option<BreakerTransition> {
        let now = Instant::now();
        let mut cells = self.lock();
        let settings = self.settings;
        let cell = cells
            .entry(provider)
            .or_insert_with(|| Cell::new(&settings));

        match kind {
            // Key rotation, not circuit state, is the remedy for bad
            // credentials.
            CallErrorKind::Auth => return None,
            CallErrorKind::NonRetryable => {
                if !count_non_retryable(cell, now, &settings) {
                    return None;
                }
            }
            CallErrorKind::RateLimited | CallErrorKind::Transient => {}
        }

        match cell.state {
            CircuitState::Closed => {
                cell.consecutive_failures = cell.consecutive_failures.saturating_add(1);
                if cell.consecutive_failures >= settings.failure_threshold {
                    cell.state = CircuitState::Open;
                    cell.open_until = Some(now + cell.cooldown);
                    Some(BreakerTransition::Opened {
                        cooldown: cell.cooldown,
                    })
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                cell.state = CircuitState::Open;
                cell.probe_in_flight = false;
                cell.cooldown = (cell.cooldown * 2).min(settings.max_cooldown);
                cell.open_until = Some(now + cell.cooldown);
                Some(BreakerTransition::Opened {
                    cooldown: cell.cooldown,
                })
            }
            CircuitState::Open => None,
        }
    }

    pub fn state(&self, provider: ProviderId) -> CircuitState {
        self.lock()
            .get(&provider)
            .map(|cell| cell.state)
            .unwrap_or(CircuitState::Closed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ProviderId, Cell>> {
        match self.cells.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Rolls the hourly window and reports whether this non-retryable failure
/// still counts toward the threshold.
fn count_non_retryable(cell: &mut Cell, now: Instant, settings: &BreakerSettings) -> bool {
    const WINDOW: Duration = Duration::from_secs(3_600);
    let window_expired = cell
        .non_retryable_window_start
        .is_none_or(|started| now.saturating_duration_since(started) >= WINDOW);
    if window_expired {
        cell.non_retryable_window_start = Some(now);
        cell.non_retryable_count = 0;
    }
    if cell.non_retryable_count >= settings.non_retryable_hourly_cap {
        return false;
    }
    cell.non_retryable_count = cell.non_retryable_count.saturating_add(1);
    true
}
