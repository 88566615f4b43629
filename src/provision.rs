//! Lazy, idempotent provisioning of experiment, variant and history rows.
//!
//! Provisioning runs when an experiment has no history rows yet, or when a page is
//! attached to a rotator. There are no locks: concurrent first requests for the same
//! experiment all run these steps, and correctness comes from every write being
//! duplicate-tolerant.
//!
//! 1. Read the rotator's member pages. A triggering page must be one of them.
//! 2. Insert the experiment row; if it already exists, read it back (lost race, not an error).
//! 3. First writer: create a variant and a zero-counter history row for every member page.
//! 4. Otherwise: ensure the variant + history row for the triggering page, or for every
//!    member page when there is no trigger (the selection path re-syncs membership).
//!
//! Member pages whose id cannot form an unambiguous variant id are skipped with a warning.
//!
//! Steps are checked against a [`Deadline`]; a timed-out attempt leaves only rows that an
//! idempotent replay will complete.

use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::{
    validate_page_id, EngineError, ExperimentIdentity, ExperimentRecord, HistoryKey,
    PageDirectory, ShardLocator, Store, StoreError, VariantRecord,
};

/// Upper bound on a provisioning attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// No deadline.
    pub const fn never() -> Self {
        Self(None)
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    fn check(
        &self,
        experiment: &ExperimentIdentity,
        stage: &'static str,
    ) -> Result<(), EngineError> {
        if self.is_expired() {
            return Err(EngineError::DeadlineExceeded {
                experiment: experiment.id.to_string(),
                stage,
            });
        }
        Ok(())
    }
}

/// What a provisioning pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// This call inserted the experiment row (first writer).
    pub created_experiment: bool,
    /// Pages that were ensured as variants, in order.
    pub pages: Vec<String>,
    pub variants_created: usize,
    pub history_rows_created: usize,
}

/// Provisions experiments against a store.
#[derive(Debug)]
pub struct Provisioner<'a, S: ?Sized> {
    store: &'a S,
    shard: ShardLocator,
    day: NaiveDate,
    deadline: Deadline,
}

impl<'a, S> Provisioner<'a, S>
where
    S: Store + PageDirectory + ?Sized,
{
    pub fn new(store: &'a S, shard: ShardLocator, day: NaiveDate, deadline: Deadline) -> Self {
        Self {
            store,
            shard,
            day,
            deadline,
        }
    }

    /// Run the provisioning steps for `experiment`.
    ///
    /// `trigger` is the page whose attachment caused this call, if any. It must be a
    /// member of the rotator; otherwise nothing is written and `NotFound` is returned.
    pub fn provision(
        &self,
        experiment: &ExperimentIdentity,
        trigger: Option<&str>,
    ) -> Result<ProvisionReport, EngineError> {
        let fail = |source: StoreError| EngineError::Provisioning {
            experiment: experiment.id.to_string(),
            source,
        };

        self.deadline.check(experiment, "members")?;
        let members = self.member_pages(experiment).map_err(fail)?;
        if let Some(page) = trigger {
            validate_page_id(page)?;
            if !members.iter().any(|m| m == page) {
                return Err(EngineError::NotFound {
                    entity: "rotator member",
                    key: page.to_string(),
                });
            }
        }

        self.deadline.check(experiment, "experiment")?;
        let created = self
            .store
            .insert_experiment(&ExperimentRecord::new(experiment))
            .map_err(fail)?;
        if !created {
            // Someone else provisioned it; it must be readable now.
            let existing = self.store.experiment(&experiment.key).map_err(fail)?;
            if existing.is_none() {
                return Err(fail(StoreError::Invalid(format!(
                    "experiment {} rejected as duplicate but not found",
                    experiment.id
                ))));
            }
        }

        let pages = match (created, trigger) {
            (false, Some(page)) => vec![page.to_string()],
            _ => members,
        };

        let mut report = ProvisionReport {
            created_experiment: created,
            ..ProvisionReport::default()
        };
        for page in pages {
            self.deadline.check(experiment, "variants")?;
            let variant = VariantRecord::new(experiment, &page);
            if self.store.insert_variant(&variant).map_err(fail)? {
                report.variants_created += 1;
            }
            let key = HistoryKey::new(self.day, &experiment.id, &variant.id);
            if self.store.insert_history(self.shard, &key).map_err(fail)? {
                report.history_rows_created += 1;
            }
            debug!(experiment = %experiment.id, variant = %variant.id, "variant ensured");
            report.pages.push(page);
        }

        info!(
            experiment = %experiment.id,
            shard = %self.shard,
            created = created,
            variants_created = report.variants_created,
            history_rows_created = report.history_rows_created,
            "experiment provisioned"
        );
        Ok(report)
    }

    fn member_pages(&self, experiment: &ExperimentIdentity) -> Result<Vec<String>, StoreError> {
        let mut pages = self.store.rotator_pages(&experiment.rotator_id)?;
        pages.retain(|page| match validate_page_id(page) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    rotator = %experiment.rotator_id,
                    page = %page,
                    error = %e,
                    "member page skipped"
                );
                false
            }
        });
        Ok(pages)
    }
}
