use crate::config::ScheduleIntervals;
use crate::providers::ProviderTier;

/// Processing tier: a preset bundle of providers, domain-selection policy,
/// and spend ceilings for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Cheap,
    Medium,
    Expensive,
    Full,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Self::Cheap, Self::Medium, Self::Expensive, Self::Full];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cheap => "cheap",
            Self::Medium => "medium",
            Self::Expensive => "expensive",
            Self::Full => "full",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|tier| tier.as_str() == value)
    }

    pub fn provider_tiers(&self) -> &'static [ProviderTier] {
        match self {
            Self::Cheap => &[ProviderTier::Economy],
            Self::Medium => &[ProviderTier::Standard, ProviderTier::Economy],
            Self::Expensive | Self::Full => &[
                ProviderTier::Premium,
                ProviderTier::Standard,
                ProviderTier::Economy,
            ],
        }
    }

    /// Maximum domains marked pending per run.
    pub fn domain_cap(&self) -> i64 {
        match self {
            Self::Cheap => 100,
            Self::Medium => 500,
            Self::Expensive => 200,
            Self::Full => 10_000_000,
        }
    }

    pub fn budget_ceiling_usd(&self) -> f64 {
        match self {
            Self::Cheap => 5.0,
            Self::Medium => 25.0,
            Self::Expensive => 100.0,
            Self::Full => 500.0,
        }
    }

    pub fn interval_seconds(&self, schedule: &ScheduleIntervals) -> u64 {
        match self {
            Self::Cheap => schedule.cheap_seconds,
            Self::Medium => schedule.medium_seconds,
            Self::Expensive => schedule.expensive_seconds,
            Self::Full => schedule.full_seconds,
        }
    }

    /// SQL predicate selecting this tier's domains. Interpolated into claim
    /// preparation statements; every fragment is a static literal.
    pub(crate) fn selection_predicate(&self) -> &'static str {
        match self {
            Self::Cheap => {
                "(char_length(hostname) <= 15 OR last_processed_at IS NULL \
                 OR last_processed_at < NOW() - INTERVAL '1 day')"
            }
            Self::Medium => {
                "(hostname LIKE '%.ai' OR hostname LIKE '%.io' OR hostname LIKE '%.dev' \
                 OR hostname LIKE '%tech%' OR last_processed_at IS NULL \
                 OR last_processed_at < NOW() - INTERVAL '7 days')"
            }
            Self::Expensive => {
                "((SELECT COUNT(*) FROM responses r WHERE r.domain_id = domains.id) < 10)"
            }
            Self::Full => "TRUE",
        }
    }

    /// Which rows a run may pull back to pending. Weekly full runs also
    /// reclaim parked rows; the other tiers leave them alone.
    pub(crate) fn eligible_status_sql(&self) -> &'static str {
        match self {
            Self::Full => "status IN ('pending', 'completed', 'completed_partial', 'error')",
            _ => "status IN ('pending', 'completed', 'completed_partial')",
        }
    }
}
