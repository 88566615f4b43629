//! Statistics aggregation: per-variant counter sums for one experiment.

use crate::{ExperimentIdentity, ShardLocator, Store, StoreError, VariantStats};

/// Result of reading an experiment's aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregate {
    /// No history rows at all: the experiment has not been provisioned yet.
    ///
    /// This is a cold-start signal, not an error.
    Empty,
    /// One row per variant with at least one history row, ordered by variant id.
    Rows(Vec<VariantStats>),
}

impl Aggregate {
    pub fn is_empty(&self) -> bool {
        matches!(self, Aggregate::Empty)
    }

    pub fn rows(&self) -> &[VariantStats] {
        match self {
            Aggregate::Empty => &[],
            Aggregate::Rows(rows) => rows,
        }
    }

    pub fn into_rows(self) -> Vec<VariantStats> {
        match self {
            Aggregate::Empty => Vec::new(),
            Aggregate::Rows(rows) => rows,
        }
    }
}

/// Sum every variant's history counters across all recorded days.
pub fn aggregate_variants<S: Store + ?Sized>(
    store: &S,
    shard: ShardLocator,
    experiment: &ExperimentIdentity,
) -> Result<Aggregate, StoreError> {
    let rows = store.variant_totals(shard, &experiment.key)?;
    if rows.is_empty() {
        Ok(Aggregate::Empty)
    } else {
        Ok(Aggregate::Rows(rows))
    }
}
