//! Bernoulli Thompson sampling over aggregated success/fail counts.
//!
//! Each arm's belief is `Beta(prior_alpha + successes, prior_beta + fails)`; one sample is
//! drawn per arm and the highest sample wins. The prior keeps zero-traffic arms well
//! defined (uniform under the default `1, 1`) without letting them outrank an arm with a
//! proven positive rate except by sampling noise.
//!
//! The RNG is caller-supplied so selection is reproducible in tests.

use rand::Rng;
use rand_distr::{Beta, Distribution};

use crate::VariantId;

/// Beta posterior parameters for one arm.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BetaArm {
    pub alpha: f64,
    pub beta: f64,
}

impl BetaArm {
    /// Posterior from counts under a `Beta(prior_alpha, prior_beta)` prior.
    pub fn from_counts(successes: u64, fails: u64, prior_alpha: f64, prior_beta: f64) -> Self {
        Self {
            alpha: sanitize_shape(prior_alpha) + successes as f64,
            beta: sanitize_shape(prior_beta) + fails as f64,
        }
    }

    pub fn expected_value(&self) -> f64 {
        let denom = self.alpha + self.beta;
        if denom <= 0.0 {
            0.5
        } else {
            self.alpha / denom
        }
    }
}

fn sanitize_shape(x: f64) -> f64 {
    if x.is_finite() && x > 0.0 {
        x
    } else {
        1.0
    }
}

/// One draw from `Beta(alpha, beta)`; `0.5` when the shape is unusable.
pub fn sample_beta<R: Rng + ?Sized>(rng: &mut R, arm: BetaArm) -> f64 {
    if !(arm.alpha.is_finite() && arm.beta.is_finite()) || arm.alpha <= 0.0 || arm.beta <= 0.0 {
        return 0.5;
    }
    match Beta::new(arm.alpha, arm.beta) {
        Ok(dist) => dist.sample(rng),
        Err(_) => 0.5,
    }
}

/// Sample every arm's posterior and return the arm with the highest draw.
///
/// Ties keep the earlier arm. Returns `None` only for an empty slice.
pub fn sample_posterior_max<'a, R: Rng + ?Sized>(
    rng: &mut R,
    arms: &'a [(VariantId, BetaArm)],
) -> Option<(&'a VariantId, f64)> {
    let mut best: Option<(&'a VariantId, f64)> = None;
    for (id, arm) in arms {
        let x = sample_beta(rng, *arm);
        if best.map_or(true, |(_, b)| x > b) {
            best = Some((id, x));
        }
    }
    best
}
