//! Funnel-stage objective resolution.
//!
//! The optimization target is the deepest funnel stage at which **every** arm has already
//! converted at least once. Optimizing on a stage some arm has never reached would compare
//! real rates against structural zeros, so shallower stages win until all arms catch up.
//!
//! Independently, any arm that has not yet produced a single CTA event is forced: the
//! caller serves it directly, skipping scoring.

use std::fmt;

use crate::{FunnelCounters, VariantId, VariantStats};

/// Funnel stage used as the success signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Objective {
    Cta,
    Lead,
    Mql,
    Prospek,
    Purchase,
}

impl Objective {
    /// All stages, shallowest first.
    pub const ALL: [Objective; 5] = [
        Objective::Cta,
        Objective::Lead,
        Objective::Mql,
        Objective::Prospek,
        Objective::Purchase,
    ];

    /// Stable lowercase name (also the storage column name).
    pub const fn name(self) -> &'static str {
        match self {
            Objective::Cta => "cta",
            Objective::Lead => "lead",
            Objective::Mql => "mql",
            Objective::Prospek => "prospek",
            Objective::Purchase => "purchase",
        }
    }

    /// Parse a stage name (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|o| o.name().eq_ignore_ascii_case(s))
    }

    /// This stage's count in `c`.
    pub fn count(self, c: &FunnelCounters) -> u64 {
        match self {
            Objective::Cta => c.cta,
            Objective::Lead => c.lead,
            Objective::Mql => c.mql,
            Objective::Prospek => c.prospek,
            Objective::Purchase => c.purchase,
        }
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Output of [`resolve_objective`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjectiveResolution {
    /// Arm to serve unconditionally (has `cta < 1`), if any.
    pub forced: Option<VariantId>,
    pub objective: Objective,
}

/// Pick the objective stage and the forced-exploration arm for an experiment.
///
/// - Objective: deepest stage where every row has a positive count; `Cta` otherwise.
/// - Forced: the **last** row (in input order) whose CTA count is zero.
///
/// An empty slice resolves to `Cta` with nothing forced.
#[must_use]
pub fn resolve_objective(stats: &[VariantStats]) -> ObjectiveResolution {
    if stats.is_empty() {
        return ObjectiveResolution {
            forced: None,
            objective: Objective::Cta,
        };
    }

    let forced = stats
        .iter()
        .rev()
        .find(|s| s.counters.cta < 1)
        .map(|s| s.variant_id.clone());

    let objective = Objective::ALL
        .into_iter()
        .rev()
        .find(|o| stats.iter().all(|s| o.count(&s.counters) >= 1))
        .unwrap_or(Objective::Cta);

    ObjectiveResolution { forced, objective }
}
