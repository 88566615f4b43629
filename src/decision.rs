//! Audit envelope for a single selection.
//!
//! A [`Decision`] records which arm was chosen, under which objective, and the typed notes
//! explaining the path (forced exploration, exploit, or posterior sampling). It is cheap to
//! log and carries enough to replay the reasoning offline.

use crate::{Objective, VariantId};

/// How the chosen arm was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecisionPath {
    /// An arm without a single CTA event was served unconditionally.
    Forced,
    /// The greedy (highest observed rate) arm was kept.
    Exploit,
    /// Per-arm Beta posteriors were sampled and the max was served.
    Explore,
}

/// Typed notes attached to a decision.
///
/// Prefer adding variants over changing the meaning of existing ones.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecisionNote {
    /// Forced exploration of an arm with `cta < 1`.
    ForcedExploration { variant: VariantId },

    /// Greedy candidate and the full width of its confidence interval.
    Greedy {
        variant: VariantId,
        rate: f64,
        margin: f64,
    },

    /// Outcome of the exploit gate.
    ///
    /// `tight` is `margin <= threshold`; `exploited` is whether the greedy arm was kept.
    ExploitGate {
        margin: f64,
        threshold: f64,
        tight: bool,
        exploited: bool,
    },

    /// Posterior sampling chose the max sample.
    SampledPosteriorMax { variant: VariantId, sample: f64 },
}

/// A single selection decision.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Decision {
    pub chosen: VariantId,
    pub path: DecisionPath,
    pub objective: Objective,
    pub notes: Vec<DecisionNote>,
}

impl Decision {
    /// Greedy candidate's margin, when scoring ran.
    pub fn greedy_margin(&self) -> Option<f64> {
        self.notes.iter().find_map(|n| match n {
            DecisionNote::Greedy { margin, .. } => Some(*margin),
            _ => None,
        })
    }
}
