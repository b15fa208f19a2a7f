//! Freshness contracts for layered reads.
//!
//! Callers state how old a value may be before the origin must be
//! consulted. The policy here is pure arithmetic over arrival times; the
//! orchestrator decides what to do with the verdict.

use serde::{Deserialize, Serialize};

use crate::TimeMs;

/// Staleness tolerance for a read.
///
/// `Default` is a placeholder resolved against the configured default
/// before any evaluation takes place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Freshness {
    /// Accept a cached value of any age.
    Any,

    /// Never accept a cached value; the origin must be asked.
    ///
    /// Cache layers are not even probed while online.
    Insist,

    /// Probe the cache but only accept a value captured this very millisecond.
    ///
    /// In practice this forces an origin round trip while still allowing
    /// etag short-circuiting and degraded fallback.
    Freshest,

    /// Use the configured default.
    #[default]
    Default,

    /// Accept a cached value at most this many seconds old.
    MaxAge(u32),
}

impl Freshness {
    /// Maximum age in seconds.
    pub fn max_age(seconds: u32) -> Self {
        Self::MaxAge(seconds)
    }

    /// Replace `Default` with the configured default.
    ///
    /// A `Default` configured default collapses to `Freshest`.
    pub fn resolve(self, default: Freshness) -> Freshness {
        match self {
            Self::Default => match default {
                Self::Default => Self::Freshest,
                other => other,
            },
            other => other,
        }
    }

    /// True when cache layers should be consulted at all.
    pub fn allows_probe(&self) -> bool {
        !matches!(self, Self::Insist)
    }

    /// Age budget in milliseconds, if this freshness is a bounded age.
    pub fn budget_ms(&self) -> Option<i64> {
        match self {
            Self::Freshest => Some(0),
            Self::MaxAge(seconds) => Some(i64::from(*seconds) * 1000),
            _ => None,
        }
    }

    /// Decide whether a value captured at `arrived_at_ms` satisfies this
    /// freshness at `request_time_ms`.
    ///
    /// `Default` must be resolved first; unresolved it is treated as `Freshest`.
    pub fn is_acceptable(&self, arrived_at_ms: TimeMs, request_time_ms: TimeMs) -> bool {
        match self {
            Self::Any => true,
            Self::Insist => false,
            Self::Default | Self::Freshest | Self::MaxAge(_) => {
                let budget = self.budget_ms().unwrap_or(0);
                request_time_ms.saturating_sub(arrived_at_ms) <= budget
            }
        }
    }
}

/// Free-function form of [`Freshness::is_acceptable`].
pub fn is_acceptable(arrived_at_ms: TimeMs, request_time_ms: TimeMs, freshness: Freshness) -> bool {
    freshness.is_acceptable(arrived_at_ms, request_time_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_any_accepts_ancient_values() {
        assert!(Freshness::Any.is_acceptable(0, i64::MAX));
    }

    #[test]
    fn test_insist_never_accepts() {
        assert!(!Freshness::Insist.is_acceptable(1_000, 1_000));
        assert!(!Freshness::Insist.allows_probe());
    }

    #[test]
    fn test_freshest_accepts_only_same_millisecond() {
        assert!(Freshness::Freshest.is_acceptable(5_000, 5_000));
        assert!(!Freshness::Freshest.is_acceptable(5_000, 5_001));
        assert!(Freshness::Freshest.allows_probe());
    }

    #[test]
    fn test_max_age_boundary_is_inclusive() {
        let f = Freshness::max_age(60);
        assert!(f.is_acceptable(0, 60_000));
        assert!(!f.is_acceptable(0, 60_001));
    }

    #[test]
    fn test_resolve_default() {
        assert_eq!(
            Freshness::Default.resolve(Freshness::MaxAge(30)),
            Freshness::MaxAge(30)
        );
        assert_eq!(Freshness::Any.resolve(Freshness::MaxAge(30)), Freshness::Any);
        assert_eq!(
            Freshness::Default.resolve(Freshness::Default),
            Freshness::Freshest
        );
    }

    #[test]
    fn test_value_from_the_future_is_fresh() {
        // Clock skew between layers must not make a value unacceptable.
        assert!(Freshness::max_age(0).is_acceptable(10_000, 9_000));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_max_age_matches_arithmetic(
            seconds in 0u32..100_000,
            arrived in 0i64..4_000_000_000_000,
            elapsed in 0i64..200_000_000,
        ) {
            let now = arrived + elapsed;
            let expected = now - arrived <= i64::from(seconds) * 1000;
            prop_assert_eq!(is_acceptable(arrived, now, Freshness::MaxAge(seconds)), expected);
        }

        #[test]
        fn prop_any_and_insist_ignore_age(arrived in any::<i64>(), now in any::<i64>()) {
            prop_assert!(Freshness::Any.is_acceptable(arrived, now));
            prop_assert!(!Freshness::Insist.is_acceptable(arrived, now));
        }
    }
}
