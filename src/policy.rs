//! Explore/exploit selection policy.
//!
//! Given the resolved objective and per-variant aggregates:
//!
//! 1. A forced arm (see [`resolve_objective`](crate::resolve_objective)) is served as-is.
//! 2. Otherwise the greedy arm (highest `successes / impressions`) is computed, along with
//!    the full width of its normal-approximation confidence interval.
//! 3. If that margin is at most `margin_threshold`, the greedy arm is kept with probability
//!    `exploit_probability`; the rest of the time, and always when the margin is wider, the
//!    arm is picked by Thompson sampling over `Beta(successes, fails)` posteriors.
//!
//! The policy is pure: no storage access and no shared state; randomness comes from the
//! caller's RNG.

use rand::Rng;

use crate::thompson::{sample_posterior_max, BetaArm};
use crate::{
    margin_of_error, Decision, DecisionNote, DecisionPath, Objective, ObjectiveResolution,
    VariantId, VariantStats,
};

/// Selection policy configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SelectionConfig {
    /// Probability of keeping the greedy arm once its estimate is tight.
    pub exploit_probability: f64,
    /// Maximum confidence-interval width at which the greedy estimate counts as tight.
    pub margin_threshold: f64,
    /// Two-sided confidence level for the margin (0.95 → z ≈ 1.96).
    pub confidence_level: f64,
    /// Beta prior pseudo-successes added to every arm when sampling.
    pub prior_alpha: f64,
    /// Beta prior pseudo-failures added to every arm when sampling.
    pub prior_beta: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            exploit_probability: 0.9,
            margin_threshold: 0.01,
            confidence_level: 0.95,
            prior_alpha: 1.0,
            prior_beta: 1.0,
        }
    }
}

impl SelectionConfig {
    /// Check ranges; returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.exploit_probability) {
            return Err(format!(
                "exploit_probability must be in [0, 1], got {}",
                self.exploit_probability
            ));
        }
        if !(self.margin_threshold.is_finite() && self.margin_threshold >= 0.0) {
            return Err(format!(
                "margin_threshold must be finite and >= 0, got {}",
                self.margin_threshold
            ));
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(format!(
                "confidence_level must be in (0, 1), got {}",
                self.confidence_level
            ));
        }
        for (name, v) in [("prior_alpha", self.prior_alpha), ("prior_beta", self.prior_beta)] {
            if !(v.is_finite() && v > 0.0) {
                return Err(format!("{name} must be finite and > 0, got {v}"));
            }
        }
        Ok(())
    }
}

/// Per-arm inputs to scoring under one objective.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArmScore {
    pub variant_id: VariantId,
    pub successes: u64,
    pub impressions: u64,
    /// `impressions - successes`, floored at zero.
    pub fails: u64,
}

impl ArmScore {
    pub fn from_stats(stats: &VariantStats, objective: Objective) -> Self {
        let successes = objective.count(&stats.counters);
        let impressions = stats.counters.impression;
        Self {
            variant_id: stats.variant_id.clone(),
            successes,
            impressions,
            fails: impressions.saturating_sub(successes),
        }
    }

    /// Observed success rate; `0` for an arm with no impressions.
    pub fn rate(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.successes as f64 / self.impressions as f64
        }
    }
}

/// Index of the highest-rate arm; ties keep the earliest.
pub fn greedy_index(scores: &[ArmScore]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, s) in scores.iter().enumerate() {
        let r = s.rate();
        if best.map_or(true, |(_, b)| r > b) {
            best = Some((i, r));
        }
    }
    best.map(|(i, _)| i)
}

/// Choose an arm. Returns `None` only when `stats` is empty and nothing is forced.
pub fn select_variant<R: Rng + ?Sized>(
    rng: &mut R,
    stats: &[VariantStats],
    resolution: &ObjectiveResolution,
    cfg: &SelectionConfig,
) -> Option<Decision> {
    let objective = resolution.objective;
    if let Some(forced) = &resolution.forced {
        return Some(Decision {
            chosen: forced.clone(),
            path: DecisionPath::Forced,
            objective,
            notes: vec![DecisionNote::ForcedExploration {
                variant: forced.clone(),
            }],
        });
    }

    let scores: Vec<ArmScore> = stats
        .iter()
        .map(|s| ArmScore::from_stats(s, objective))
        .collect();
    let greedy = &scores[greedy_index(&scores)?];
    let margin = margin_of_error(greedy.successes, greedy.impressions, cfg.confidence_level);
    let tight = margin <= cfg.margin_threshold;
    let exploited = tight && rng.random_bool(cfg.exploit_probability.clamp(0.0, 1.0));

    let mut notes = vec![
        DecisionNote::Greedy {
            variant: greedy.variant_id.clone(),
            rate: greedy.rate(),
            margin,
        },
        DecisionNote::ExploitGate {
            margin,
            threshold: cfg.margin_threshold,
            tight,
            exploited,
        },
    ];

    if exploited {
        return Some(Decision {
            chosen: greedy.variant_id.clone(),
            path: DecisionPath::Exploit,
            objective,
            notes,
        });
    }

    let arms: Vec<(VariantId, BetaArm)> = scores
        .iter()
        .map(|s| {
            (
                s.variant_id.clone(),
                BetaArm::from_counts(s.successes, s.fails, cfg.prior_alpha, cfg.prior_beta),
            )
        })
        .collect();
    let (chosen, sample) = sample_posterior_max(rng, &arms)?;
    notes.push(DecisionNote::SampledPosteriorMax {
        variant: chosen.clone(),
        sample,
    });
    Some(Decision {
        chosen: chosen.clone(),
        path: DecisionPath::Explore,
        objective,
        notes,
    })
}
