use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use shared::models::RunSummary;
use shared::tier::Tier;

/// In-memory ledger of runs: at most one active per tier, plus the last
/// finished summary and the next scheduled fire time for the status surface.
pub(crate) struct RunRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    active: HashMap<Tier, ActiveRun>,
    last: HashMap<Tier, RunSummary>,
    next_runs: HashMap<Tier, DateTime<Utc>>,
}

struct ActiveRun {
    id: Uuid,
    cancel_tx: watch::Sender<bool>,
}

/// Handle carried by a run's workers. Cancellation is cooperative: workers
/// observe the flag between domains and between tensor elements.
#[derive(Clone)]
pub(crate) struct RunTicket {
    pub(crate) id: Uuid,
    pub(crate) tier: Tier,
    cancel_rx: watch::Receiver<bool>,
}

impl RunTicket {
    pub(crate) fn is_canceled(&self) -> bool {
        *self.cancel_rx.borrow()
    }
}

impl std::fmt::Debug for RunTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunTicket")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .finish()
    }
}

impl PartialEq for RunTicket {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.tier == other.tier
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BeginRunError {
    AlreadyActive,
}

impl RunRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Registers a run for `tier`. A second run on the same tier is refused
    /// unless forced, in which case the incumbent is canceled and replaced.
    pub(crate) fn begin(&self, tier: Tier, force: bool) -> Result<RunTicket, BeginRunError> {
        let mut inner = self.lock();
        if let Some(active) = inner.active.get(&tier) {
            if !force {
                return Err(BeginRunError::AlreadyActive);
            }
            let _ = active.cancel_tx.send(true);
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let id = Uuid::new_v4();
        inner.active.insert(tier, ActiveRun { id, cancel_tx });

        Ok(RunTicket {
            id,
            tier,
            cancel_rx,
        })
    }

    pub(crate) fn finish(&self, tier: Tier, run_id: Uuid, summary: RunSummary) {
        let mut inner = self.lock();
        if inner
            .active
            .get(&tier)
            .is_some_and(|active| active.id == run_id)
        {
            inner.active.remove(&tier);
        }
        inner.last.insert(tier, summary);
    }

    pub(crate) fn cancel(&self, run_id: Uuid) -> bool {
        let inner = self.lock();
        for active in inner.active.values() {
            if active.id == run_id {
                let _ = active.cancel_tx.send(true);
                return true;
            }
        }
        false
    }

    pub(crate) fn cancel_all(&self) {
        let inner = self.lock();
        for active in inner.active.values() {
            let _ = active.cancel_tx.send(true);
        }
    }

    pub(crate) fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub(crate) fn active_run_id(&self, tier: Tier) -> Option<Uuid> {
        self.lock().active.get(&tier).map(|active| active.id)
    }

    pub(crate) fn last_summary(&self, tier: Tier) -> Option<RunSummary> {
        self.lock().last.get(&tier).cloned()
    }

    pub(crate) fn set_next_run(&self, tier: Tier, at: DateTime<Utc>) {
        self.lock().next_runs.insert(tier, at);
    }

    pub(crate) fn next_run(&self, tier: Tier) -> Option<DateTime<Utc>> {
        self.lock().next_runs.get(&tier).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary_for(ticket: &RunTicket) -> RunSummary {
        RunSummary {
            run_id: ticket.id,
            tier: ticket.tier.as_str().to_string(),
            outcome: "completed".to_string(),
            started_at: Utc::now(),
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
            block_reasons: Vec::new(),
        }
    }

    #[test]
    fn duplicate_runs_per_tier_are_refused() {
        let registry = RunRegistry::new();
        let first = registry.begin(Tier::Cheap, false).expect("first run");
        assert_eq!(
            registry.begin(Tier::Cheap, false),
            Err(BeginRunError::AlreadyActive)
        );
        // A different tier is unaffected.
        registry.begin(Tier::Full, false).expect("other tier");
        assert_eq!(registry.active_count(), 2);
        assert!(!first.is_canceled());
    }

    #[test]
    fn force_cancels_and_replaces_the_incumbent() {
        let registry = RunRegistry::new();
        let first = registry.begin(Tier::Medium, false).expect("first run");
        let second = registry.begin(Tier::Medium, true).expect("forced run");

        assert!(first.is_canceled());
        assert!(!second.is_canceled());
        assert_eq!(registry.active_run_id(Tier::Medium), Some(second.id));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn cancel_by_run_id_flags_the_ticket() {
        let registry = RunRegistry::new();
        let ticket = registry.begin(Tier::Expensive, false).expect("run");

        assert!(registry.cancel(ticket.id));
        assert!(ticket.is_canceled());
        assert!(!registry.cancel(Uuid::new_v4()));
    }

    #[test]
    fn finish_clears_the_active_slot_and_records_the_summary() {
        let registry = RunRegistry::new();
        let ticket = registry.begin(Tier::Cheap, false).expect("run");
        let run_id = ticket.id;

        registry.finish(Tier::Cheap, run_id, summary_for(&ticket));

        assert_eq!(registry.active_count(), 0);
        assert_eq!(
            registry.last_summary(Tier::Cheap).map(|s| s.run_id),
            Some(run_id)
        );
        // A fresh run can start immediately.
        registry.begin(Tier::Cheap, false).expect("second run");
    }

    #[test]
    fn finish_of_a_superseded_run_leaves_the_replacement_active() {
        let registry = RunRegistry::new();
        let first = registry.begin(Tier::Full, false).expect("first run");
        let second = registry.begin(Tier::Full, true).expect("forced run");

        registry.finish(Tier::Full, first.id, summary_for(&first));
        assert_eq!(registry.active_run_id(Tier::Full), Some(second.id));
    }
}
