//! Persistence contract and an in-memory backend.
//!
//! The engine needs three things from storage:
//! - duplicate-tolerant inserts for experiment, variant and history rows
//!   (`Ok(false)` means "already there", never an error),
//! - a grouped sum of history counters per variant for one experiment,
//! - an atomic insert-or-increment of one counter on a variant's day row.
//!
//! History rows are addressed by [`ShardLocator`]; a backend owns `shard_count` parallel
//! history tables and rejects locators outside that range.
//!
//! [`MemoryStore`] implements the contract behind one mutex. It is the reference backend
//! for tests and embedding; see `SqliteStore` (feature `sqlite`) for a durable one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDate;

use crate::{
    ContentKey, Counter, ExperimentId, ExperimentIdentity, FunnelCounters, ShardLocator,
    StoreError, VariantId, VariantStats,
};

/// A servable page. Owned by the page CRUD layer; read-only here.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageRecord {
    pub page_id: String,
    pub url: String,
    pub is_rotator: bool,
    pub user_id: u64,
    pub site_id: u64,
}

impl PageRecord {
    /// Lookup key for this page's URL.
    pub fn url_key(&self) -> ContentKey {
        ContentKey::of(&self.url)
    }
}

/// Lifecycle state of an experiment. The only field mutated after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExperimentStatus {
    Active,
    Paused,
}

impl ExperimentStatus {
    pub const fn code(self) -> i64 {
        match self {
            ExperimentStatus::Active => 1,
            ExperimentStatus::Paused => 0,
        }
    }

    pub const fn from_code(code: i64) -> Self {
        if code == 0 {
            ExperimentStatus::Paused
        } else {
            ExperimentStatus::Active
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExperimentRecord {
    pub id: ExperimentId,
    pub key: ContentKey,
    pub campaign: String,
    pub rotator_id: String,
    pub rotator_key: ContentKey,
    pub status: ExperimentStatus,
}

impl ExperimentRecord {
    /// Fresh, active row for a derived identity.
    pub fn new(identity: &ExperimentIdentity) -> Self {
        Self {
            id: identity.id.clone(),
            key: identity.key.clone(),
            campaign: identity.campaign.clone(),
            rotator_id: identity.rotator_id.clone(),
            rotator_key: identity.rotator_key.clone(),
            status: ExperimentStatus::Active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VariantRecord {
    pub id: VariantId,
    pub key: ContentKey,
    pub experiment_id: ExperimentId,
    pub experiment_key: ContentKey,
    pub page_id: String,
    pub page_key: ContentKey,
}

impl VariantRecord {
    /// Row for `page_id` as an arm of `identity`.
    pub fn new(identity: &ExperimentIdentity, page_id: &str) -> Self {
        let id = identity.variant(page_id);
        Self {
            key: id.key(),
            id,
            experiment_id: identity.id.clone(),
            experiment_key: identity.key.clone(),
            page_id: page_id.to_string(),
            page_key: ContentKey::of(page_id),
        }
    }
}

/// Address of one variant-day history row.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HistoryKey {
    pub day: NaiveDate,
    pub experiment_id: ExperimentId,
    pub experiment_key: ContentKey,
    pub variant_id: VariantId,
    pub variant_key: ContentKey,
}

impl HistoryKey {
    pub fn new(day: NaiveDate, experiment_id: &ExperimentId, variant_id: &VariantId) -> Self {
        Self {
            day,
            experiment_key: experiment_id.key(),
            experiment_id: experiment_id.clone(),
            variant_key: variant_id.key(),
            variant_id: variant_id.clone(),
        }
    }
}

/// Persistence operations the engine depends on.
///
/// Implementations must be safe to call concurrently from many threads; every write is
/// individually idempotent or atomic.
pub trait Store: Send + Sync {
    /// Number of history shards this backend holds.
    fn shard_count(&self) -> u32;

    /// Insert an experiment row. `Ok(false)` when a row with the same key already exists.
    fn insert_experiment(&self, rec: &ExperimentRecord) -> Result<bool, StoreError>;

    fn experiment(&self, key: &ContentKey) -> Result<Option<ExperimentRecord>, StoreError>;

    /// Update an experiment's status. `Ok(false)` when no such experiment exists.
    fn set_experiment_status(
        &self,
        key: &ContentKey,
        status: ExperimentStatus,
    ) -> Result<bool, StoreError>;

    /// Insert a variant row. `Ok(false)` when it already exists.
    fn insert_variant(&self, rec: &VariantRecord) -> Result<bool, StoreError>;

    fn variant(&self, key: &ContentKey) -> Result<Option<VariantRecord>, StoreError>;

    /// Variants of one experiment, ordered by variant id.
    fn variants(&self, experiment_key: &ContentKey) -> Result<Vec<VariantRecord>, StoreError>;

    /// Insert a zero-counter history row. `Ok(false)` when it already exists.
    fn insert_history(&self, shard: ShardLocator, key: &HistoryKey) -> Result<bool, StoreError>;

    /// Atomically create-or-increment one counter of a history row by 1.
    fn increment(
        &self,
        shard: ShardLocator,
        key: &HistoryKey,
        counter: Counter,
    ) -> Result<(), StoreError>;

    /// Counter sums per variant across all days, ordered by variant id.
    ///
    /// Variants without any history row are absent.
    fn variant_totals(
        &self,
        shard: ShardLocator,
        experiment_key: &ContentKey,
    ) -> Result<Vec<VariantStats>, StoreError>;

    /// Counters of a single variant-day row.
    fn history(
        &self,
        shard: ShardLocator,
        variant_key: &ContentKey,
        day: NaiveDate,
    ) -> Result<Option<FunnelCounters>, StoreError>;
}

/// Read-side view of pages and rotator membership.
pub trait PageDirectory: Send + Sync {
    fn page_by_url_key(&self, url_key: &ContentKey) -> Result<Option<PageRecord>, StoreError>;

    /// Member page ids of a rotator, ordered by page id.
    fn rotator_pages(&self, rotator_id: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone)]
struct HistoryRow {
    key: HistoryKey,
    counters: FunnelCounters,
}

#[derive(Debug, Default)]
struct MemoryState {
    pages: BTreeMap<ContentKey, PageRecord>,
    members: BTreeMap<String, BTreeSet<String>>,
    experiments: BTreeMap<ContentKey, ExperimentRecord>,
    variants: BTreeMap<ContentKey, VariantRecord>,
    shards: Vec<BTreeMap<(ContentKey, NaiveDate), HistoryRow>>,
}

/// In-memory [`Store`] + [`PageDirectory`].
#[derive(Debug)]
pub struct MemoryStore {
    shard_count: u32,
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Store with `shard_count` history shards (minimum 1).
    pub fn new(shard_count: u32) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shard_count,
            state: Mutex::new(MemoryState {
                shards: vec![BTreeMap::new(); shard_count as usize],
                ..MemoryState::default()
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store mutex poisoned".to_string()))
    }

    fn check_shard(&self, shard: ShardLocator) -> Result<usize, StoreError> {
        if shard.index() < self.shard_count {
            Ok(shard.index() as usize)
        } else {
            Err(StoreError::UnknownShard {
                shard: shard.index(),
                shard_count: self.shard_count,
            })
        }
    }

    /// Upsert a page (seeding helper; page CRUD lives elsewhere).
    pub fn put_page(&self, page: &PageRecord) -> Result<(), StoreError> {
        self.lock()?.pages.insert(page.url_key(), page.clone());
        Ok(())
    }

    /// Attach a page to a rotator's member set. Idempotent.
    pub fn attach_member(&self, rotator_id: &str, page_id: &str) -> Result<(), StoreError> {
        self.lock()?
            .members
            .entry(rotator_id.to_string())
            .or_default()
            .insert(page_id.to_string());
        Ok(())
    }

    /// Number of experiment rows (all experiments).
    pub fn experiment_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.experiments.len())
    }

    /// Number of history rows in one shard.
    pub fn history_row_count(&self, shard: ShardLocator) -> Result<usize, StoreError> {
        let idx = self.check_shard(shard)?;
        Ok(self.lock()?.shards[idx].len())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(crate::DEFAULT_SHARD_COUNT)
    }
}

impl Store for MemoryStore {
    fn shard_count(&self) -> u32 {
        self.shard_count
    }

    fn insert_experiment(&self, rec: &ExperimentRecord) -> Result<bool, StoreError> {
        let mut st = self.lock()?;
        if st.experiments.contains_key(&rec.key) {
            return Ok(false);
        }
        st.experiments.insert(rec.key.clone(), rec.clone());
        Ok(true)
    }

    fn experiment(&self, key: &ContentKey) -> Result<Option<ExperimentRecord>, StoreError> {
        Ok(self.lock()?.experiments.get(key).cloned())
    }

    fn set_experiment_status(
        &self,
        key: &ContentKey,
        status: ExperimentStatus,
    ) -> Result<bool, StoreError> {
        let mut st = self.lock()?;
        match st.experiments.get_mut(key) {
            Some(e) => {
                e.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn insert_variant(&self, rec: &VariantRecord) -> Result<bool, StoreError> {
        let mut st = self.lock()?;
        if st.variants.contains_key(&rec.key) {
            return Ok(false);
        }
        st.variants.insert(rec.key.clone(), rec.clone());
        Ok(true)
    }

    fn variant(&self, key: &ContentKey) -> Result<Option<VariantRecord>, StoreError> {
        Ok(self.lock()?.variants.get(key).cloned())
    }

    fn variants(&self, experiment_key: &ContentKey) -> Result<Vec<VariantRecord>, StoreError> {
        let st = self.lock()?;
        let mut out: Vec<VariantRecord> = st
            .variants
            .values()
            .filter(|v| &v.experiment_key == experiment_key)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn insert_history(&self, shard: ShardLocator, key: &HistoryKey) -> Result<bool, StoreError> {
        let idx = self.check_shard(shard)?;
        let mut st = self.lock()?;
        let slot = (key.variant_key.clone(), key.day);
        if st.shards[idx].contains_key(&slot) {
            return Ok(false);
        }
        st.shards[idx].insert(
            slot,
            HistoryRow {
                key: key.clone(),
                counters: FunnelCounters::default(),
            },
        );
        Ok(true)
    }

    fn increment(
        &self,
        shard: ShardLocator,
        key: &HistoryKey,
        counter: Counter,
    ) -> Result<(), StoreError> {
        let idx = self.check_shard(shard)?;
        let mut st = self.lock()?;
        let row = st.shards[idx]
            .entry((key.variant_key.clone(), key.day))
            .or_insert_with(|| HistoryRow {
                key: key.clone(),
                counters: FunnelCounters::default(),
            });
        row.counters.bump(counter);
        Ok(())
    }

    fn variant_totals(
        &self,
        shard: ShardLocator,
        experiment_key: &ContentKey,
    ) -> Result<Vec<VariantStats>, StoreError> {
        let idx = self.check_shard(shard)?;
        let st = self.lock()?;
        let mut sums: BTreeMap<VariantId, FunnelCounters> = BTreeMap::new();
        for row in st.shards[idx].values() {
            if &row.key.experiment_key != experiment_key {
                continue;
            }
            sums.entry(row.key.variant_id.clone())
                .or_default()
                .accumulate(&row.counters);
        }
        Ok(sums
            .into_iter()
            .map(|(variant_id, counters)| VariantStats {
                variant_id,
                counters,
            })
            .collect())
    }

    fn history(
        &self,
        shard: ShardLocator,
        variant_key: &ContentKey,
        day: NaiveDate,
    ) -> Result<Option<FunnelCounters>, StoreError> {
        let idx = self.check_shard(shard)?;
        let st = self.lock()?;
        Ok(st.shards[idx]
            .get(&(variant_key.clone(), day))
            .map(|r| r.counters))
    }
}

impl PageDirectory for MemoryStore {
    fn page_by_url_key(&self, url_key: &ContentKey) -> Result<Option<PageRecord>, StoreError> {
        Ok(self.lock()?.pages.get(url_key).cloned())
    }

    fn rotator_pages(&self, rotator_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()?
            .members
            .get(rotator_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }
}
