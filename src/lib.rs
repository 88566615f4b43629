//! `rotor`: adaptive page rotation with lazily provisioned, sharded experiments.
//!
//! A **rotator** is a page that, when served, shows one of several member pages. Each
//! `(rotator, campaign)` pair is an **experiment**; each member page is a **variant**
//! (an arm). Every request picks one variant and counts an impression; conversions are
//! counted per funnel stage (`cta → lead → mql → prospek → purchase`) as they happen.
//!
//! The engine learns which variant converts best without anyone configuring the
//! experiment:
//!
//! - **Lazy provisioning**: the first request for an unseen `(rotator, campaign)` creates
//!   the experiment, a variant per member page, and zero-counter history rows. Every write
//!   is duplicate-tolerant, so concurrent first requests converge without locks.
//! - **Sharded history**: per-day counters live in one of N history tables chosen by a
//!   stable hash of the experiment id ([`ShardRouter`]).
//! - **Adaptive objective**: the optimized stage is the deepest one every variant has
//!   reached ([`resolve_objective`]); variants that never produced a CTA are forced.
//! - **Explore/exploit**: greedy when the leader's confidence interval is tight (with
//!   probability `exploit_probability`), otherwise Thompson sampling over Beta posteriors
//!   ([`select_variant`]).
//!
//! **Entry points:**
//! - [`Engine`]: selection, conversion recording, page attachment, over any [`Store`].
//! - [`RotationService`]: URL → page resolution with a TTL cache in front of the engine.
//! - [`MemoryStore`] and (feature `sqlite`) [`SqliteStore`]: storage backends.
//!
//! **Determinism:** every stochastic entry point has a `*_with` form taking a caller RNG.
//! With a seeded `StdRng` the same aggregates produce the same decision.
//!
//! **Non-goals:**
//! - Page/rotator CRUD (pages are read through [`PageDirectory`]).
//! - Rendering, HTTP transport, authentication.
//! - Contextual bandits, multi-tenant quotas.
//!
//! # Logging
//!
//! The crate emits `tracing` events (provisioning at `info`, per-request decisions at
//! `debug`, degraded writes at `warn`) and never installs a subscriber.

#![forbid(unsafe_code)]

mod aggregate;
pub use aggregate::*;

mod decision;
pub use decision::*;

mod engine;
pub use engine::*;

mod error;
pub use error::*;

mod identity;
pub use identity::*;

mod normal;
pub use normal::*;

mod objective;
pub use objective::*;

mod policy;
pub use policy::*;

mod provision;
pub use provision::*;

mod recorder;
pub use recorder::*;

mod resolve;
pub use resolve::*;

mod shard;
pub use shard::*;

mod store;
pub use store::*;

#[cfg(feature = "sqlite")]
mod sqlite;
#[cfg(feature = "sqlite")]
pub use sqlite::*;

pub mod thompson;

/// Per-stage event counts for one variant (one day, or summed over days).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FunnelCounters {
    pub impression: u64,
    pub cta: u64,
    pub lead: u64,
    pub mql: u64,
    pub prospek: u64,
    pub purchase: u64,
}

impl FunnelCounters {
    /// Value of one counter.
    pub fn get(&self, counter: Counter) -> u64 {
        match counter {
            Counter::Impression => self.impression,
            Counter::Stage(stage) => stage.count(self),
        }
    }

    /// Increment one counter by 1 (saturating).
    pub fn bump(&mut self, counter: Counter) {
        let slot = match counter {
            Counter::Impression => &mut self.impression,
            Counter::Stage(Objective::Cta) => &mut self.cta,
            Counter::Stage(Objective::Lead) => &mut self.lead,
            Counter::Stage(Objective::Mql) => &mut self.mql,
            Counter::Stage(Objective::Prospek) => &mut self.prospek,
            Counter::Stage(Objective::Purchase) => &mut self.purchase,
        };
        *slot = slot.saturating_add(1);
    }

    /// Add `other` into `self` field by field (saturating).
    pub fn accumulate(&mut self, other: &FunnelCounters) {
        self.impression = self.impression.saturating_add(other.impression);
        self.cta = self.cta.saturating_add(other.cta);
        self.lead = self.lead.saturating_add(other.lead);
        self.mql = self.mql.saturating_add(other.mql);
        self.prospek = self.prospek.saturating_add(other.prospek);
        self.purchase = self.purchase.saturating_add(other.purchase);
    }
}

/// One history counter: impressions, or a funnel stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Counter {
    Impression,
    Stage(Objective),
}

impl Counter {
    /// Storage column name.
    pub const fn column(self) -> &'static str {
        match self {
            Counter::Impression => "impression",
            Counter::Stage(stage) => stage.name(),
        }
    }
}

/// Aggregated counters for one variant.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VariantStats {
    pub variant_id: VariantId,
    pub counters: FunnelCounters,
}
