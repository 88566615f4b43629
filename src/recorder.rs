//! Outcome recording: atomic per-day counter increments.
//!
//! Every write is a single insert-or-increment at the store; the recorder never reads a
//! counter back to write it.

use chrono::NaiveDate;
use tracing::warn;

use crate::{
    Counter, ExperimentId, HistoryKey, Objective, ShardLocator, Store, StoreError, VariantId,
};

/// Whether a selection's impression made it to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WriteStatus {
    Recorded,
    /// Recording was turned off in the engine config.
    Skipped,
    /// The increment failed; the selection itself is still valid.
    Degraded { reason: String },
}

impl WriteStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, WriteStatus::Degraded { .. })
    }
}

/// Writes impression and conversion counters for one shard.
#[derive(Debug)]
pub struct Recorder<'a, S: ?Sized> {
    store: &'a S,
    shard: ShardLocator,
}

impl<'a, S: Store + ?Sized> Recorder<'a, S> {
    pub fn new(store: &'a S, shard: ShardLocator) -> Self {
        Self { store, shard }
    }

    /// Count one impression of `variant` on `day`.
    pub fn record_impression(
        &self,
        experiment: &ExperimentId,
        variant: &VariantId,
        day: NaiveDate,
    ) -> Result<(), StoreError> {
        self.bump(experiment, variant, day, Counter::Impression)
    }

    /// Count one conversion at `stage` for `variant` on `day`.
    pub fn record_conversion(
        &self,
        experiment: &ExperimentId,
        variant: &VariantId,
        stage: Objective,
        day: NaiveDate,
    ) -> Result<(), StoreError> {
        self.bump(experiment, variant, day, Counter::Stage(stage))
    }

    /// Like [`record_impression`](Self::record_impression), but a failure is logged and
    /// reported as [`WriteStatus::Degraded`] instead of an error.
    pub fn record_impression_tolerant(
        &self,
        experiment: &ExperimentId,
        variant: &VariantId,
        day: NaiveDate,
    ) -> WriteStatus {
        match self.record_impression(experiment, variant, day) {
            Ok(()) => WriteStatus::Recorded,
            Err(e) => {
                warn!(
                    experiment = %experiment,
                    variant = %variant,
                    shard = %self.shard,
                    error = %e,
                    "impression write failed; serving selection anyway"
                );
                WriteStatus::Degraded {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn bump(
        &self,
        experiment: &ExperimentId,
        variant: &VariantId,
        day: NaiveDate,
        counter: Counter,
    ) -> Result<(), StoreError> {
        let key = HistoryKey::new(day, experiment, variant);
        self.store.increment(self.shard, &key, counter)
    }
}
