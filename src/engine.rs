//! The selection engine: the "front door" for serving a rotator.
//!
//! [`Engine::select_variant`] runs the whole pipeline for one request:
//!
//! ```text
//! derive identity → route shard → aggregate
//!     → (empty) provision → aggregate again
//!     → resolve objective → select → record impression
//! ```
//!
//! The engine holds no per-request mutable state. It is `Send + Sync` and meant to be
//! shared (e.g. behind an `Arc`) by every request handler in the process; the only
//! shared mutable resource is the store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rand::Rng;
use tracing::debug;

use crate::{
    aggregate_variants, derive_experiment, resolve_objective, select_variant, validate_page_id,
    Aggregate, Decision, Deadline, EngineError, ExperimentId, ExperimentIdentity,
    ExperimentStatus, Objective, PageDirectory, ProvisionReport, Provisioner, Recorder,
    SelectionConfig, ShardLocator, ShardRouter, Store, VariantId, WriteStatus,
    DEFAULT_SHARD_COUNT,
};

// ============================================================================
// Configuration
// ============================================================================

/// Engine configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    /// Number of history shards. Must not exceed the store's shard count.
    pub shard_count: u32,
    /// Explore/exploit policy parameters.
    pub selection: SelectionConfig,
    /// Upper bound on one provisioning attempt, in milliseconds. `0` disables the bound.
    pub provision_timeout_ms: u64,
    /// Record an impression for every selection.
    ///
    /// Turn off for dry runs (previews, offline replays) that must not move counters.
    pub record_impressions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            selection: SelectionConfig::default(),
            provision_timeout_ms: 5_000,
            record_impressions: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.shard_count == 0 {
            return Err(EngineError::InvalidConfig(
                "shard_count must be at least 1".to_string(),
            ));
        }
        self.selection.validate().map_err(EngineError::InvalidConfig)
    }

    /// Set the shard count.
    pub fn shards(mut self, shard_count: u32) -> Self {
        self.shard_count = shard_count;
        self
    }

    /// Set the provisioning timeout.
    pub fn provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    fn deadline(&self) -> Deadline {
        if self.provision_timeout_ms == 0 {
            Deadline::never()
        } else {
            Deadline::after(Duration::from_millis(self.provision_timeout_ms))
        }
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Source of the engine's calendar day (history rows are per day).
pub trait Clock: Send + Sync + fmt::Debug {
    fn today(&self) -> NaiveDate;
}

/// The process's local date.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn today(&self) -> NaiveDate {
        chrono::Local::now().date_naive()
    }
}

/// A pinned date, for tests and replays.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

// ============================================================================
// Selection
// ============================================================================

/// Output of [`Engine::select_variant`].
#[derive(Debug, Clone)]
pub struct Selection {
    pub experiment: ExperimentId,
    pub shard: ShardLocator,
    pub decision: Decision,
    /// Whether the impression was counted.
    pub impression: WriteStatus,
    /// Present when this request provisioned (or re-synced) the experiment.
    pub provisioned: Option<ProvisionReport>,
}

impl Selection {
    /// The served variant.
    pub fn variant(&self) -> &VariantId {
        &self.decision.chosen
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Adaptive variant selection over a shared store.
///
/// ```rust
/// use std::sync::Arc;
/// use rotor::{Engine, EngineConfig, MemoryStore};
///
/// let store = Arc::new(MemoryStore::default());
/// store.attach_member("r_1", "p_1").unwrap();
/// store.attach_member("r_1", "p_2").unwrap();
///
/// let engine = Engine::new(store, EngineConfig::default()).unwrap();
/// let sel = engine.select_variant("r_1", "spring-sale").unwrap();
/// assert!(sel.variant().as_str().starts_with("v_1_spring-sale_"));
/// ```
#[derive(Debug)]
pub struct Engine<S: ?Sized> {
    store: Arc<S>,
    router: ShardRouter,
    cfg: EngineConfig,
    clock: Arc<dyn Clock>,
}

impl<S: ?Sized> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            router: self.router,
            cfg: self.cfg.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S> Engine<S>
where
    S: Store + PageDirectory + ?Sized,
{
    /// Create an engine. Fails on invalid config or a store with too few shards.
    pub fn new(store: Arc<S>, cfg: EngineConfig) -> Result<Self, EngineError> {
        cfg.validate()?;
        if store.shard_count() < cfg.shard_count {
            return Err(EngineError::InvalidConfig(format!(
                "store holds {} shards but config routes over {}",
                store.shard_count(),
                cfg.shard_count
            )));
        }
        Ok(Self {
            router: ShardRouter::new(cfg.shard_count)?,
            store,
            cfg,
            clock: Arc::new(LocalClock),
        })
    }

    /// Replace the clock (defaults to [`LocalClock`]).
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Experiment identity and shard for `(rotator_id, campaign)`.
    pub fn locate(
        &self,
        rotator_id: &str,
        campaign: &str,
    ) -> Result<(ExperimentIdentity, ShardLocator), EngineError> {
        let experiment = derive_experiment(rotator_id, campaign)?;
        let shard = self.router.route(&experiment.id);
        Ok((experiment, shard))
    }

    /// Pick the variant to serve and record its impression.
    ///
    /// Uses the thread-local RNG; see [`select_variant_with`](Self::select_variant_with)
    /// for a caller-supplied one.
    pub fn select_variant(
        &self,
        rotator_id: &str,
        campaign: &str,
    ) -> Result<Selection, EngineError> {
        self.select_variant_with(&mut rand::rng(), rotator_id, campaign)
    }

    /// [`select_variant`](Self::select_variant) with an explicit RNG.
    pub fn select_variant_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        rotator_id: &str,
        campaign: &str,
    ) -> Result<Selection, EngineError> {
        let (experiment, shard) = self.locate(rotator_id, campaign)?;
        let today = self.clock.today();
        debug!(experiment = %experiment.id, shard = %shard, "selecting variant");

        let mut provisioned = None;
        let mut agg = aggregate_variants(&*self.store, shard, &experiment)?;
        if agg.is_empty() {
            let report = Provisioner::new(&*self.store, shard, today, self.cfg.deadline())
                .provision(&experiment, None)?;
            provisioned = Some(report);
            agg = aggregate_variants(&*self.store, shard, &experiment)?;
        }

        let rows = agg.into_rows();
        let resolution = resolve_objective(&rows);
        let decision = select_variant(rng, &rows, &resolution, &self.cfg.selection).ok_or_else(
            || EngineError::NoVariants {
                experiment: experiment.id.to_string(),
            },
        )?;
        debug!(
            experiment = %experiment.id,
            objective = %decision.objective,
            path = ?decision.path,
            chosen = %decision.chosen,
            "variant selected"
        );

        let impression = if self.cfg.record_impressions {
            Recorder::new(&*self.store, shard).record_impression_tolerant(
                &experiment.id,
                &decision.chosen,
                today,
            )
        } else {
            WriteStatus::Skipped
        };

        Ok(Selection {
            experiment: experiment.id,
            shard,
            decision,
            impression,
            provisioned,
        })
    }

    /// Ensure `page_id` is an arm of the `(rotator_id, campaign)` experiment.
    ///
    /// Creates the experiment (and every current member) when it does not exist yet.
    pub fn attach_page(
        &self,
        rotator_id: &str,
        campaign: &str,
        page_id: &str,
    ) -> Result<ProvisionReport, EngineError> {
        validate_page_id(page_id)?;
        let (experiment, shard) = self.locate(rotator_id, campaign)?;
        Provisioner::new(&*self.store, shard, self.clock.today(), self.cfg.deadline())
            .provision(&experiment, Some(page_id))
    }

    /// Count one conversion at `stage` for a variant of `(rotator_id, campaign)`, today.
    ///
    /// The variant must already be an arm of the experiment; conversions never create one.
    pub fn record_conversion(
        &self,
        rotator_id: &str,
        campaign: &str,
        variant: &VariantId,
        stage: Objective,
    ) -> Result<(), EngineError> {
        let (experiment, shard) = self.locate(rotator_id, campaign)?;
        if !experiment.owns(variant) {
            return Err(EngineError::invalid(
                "variant",
                format!("{variant} is not a variant of {}", experiment.id),
            ));
        }
        let provisioned = self
            .store
            .variant(&variant.key())?
            .is_some_and(|rec| rec.experiment_key == experiment.key);
        if !provisioned {
            return Err(EngineError::NotFound {
                entity: "variant",
                key: variant.to_string(),
            });
        }
        Recorder::new(&*self.store, shard)
            .record_conversion(&experiment.id, variant, stage, self.clock.today())
            .map_err(EngineError::from)
    }

    /// Current per-variant aggregates, without provisioning or recording anything.
    pub fn stats(&self, rotator_id: &str, campaign: &str) -> Result<Aggregate, EngineError> {
        let (experiment, shard) = self.locate(rotator_id, campaign)?;
        Ok(aggregate_variants(&*self.store, shard, &experiment)?)
    }

    /// Change an experiment's status.
    pub fn set_status(
        &self,
        rotator_id: &str,
        campaign: &str,
        status: ExperimentStatus,
    ) -> Result<(), EngineError> {
        let (experiment, _) = self.locate(rotator_id, campaign)?;
        if self.store.set_experiment_status(&experiment.key, status)? {
            Ok(())
        } else {
            Err(EngineError::NotFound {
                entity: "experiment",
                key: experiment.id.to_string(),
            })
        }
    }
}
