//! End-to-end scenarios: cold start, steady state, deep funnels, concurrency.

use std::sync::Arc;
use std::thread;

use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rotor::{
    derive_experiment, resolve_objective, ContentKey, Counter, DecisionPath, Engine,
    EngineConfig, ErrorKind, ExperimentRecord, ExperimentStatus, FixedClock, FunnelCounters,
    HistoryKey, MemoryStore, Objective, PageDirectory, PageRecord, Recorder, ShardLocator,
    ShardRouter, Store, StoreError, VariantRecord, VariantStats, WriteStatus,
};

const SHARDS: u32 = 16;

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 10, 1).unwrap()
}

fn engine_over<S: Store + PageDirectory>(store: Arc<S>, cfg: EngineConfig) -> Engine<S> {
    Engine::new(store, cfg.shards(SHARDS))
        .unwrap()
        .with_clock(FixedClock(today()))
}

fn memory_with_members(rotator: &str, pages: &[&str]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new(SHARDS));
    for p in pages {
        store.attach_member(rotator, p).unwrap();
    }
    store
}

/// Provision `page` as an arm, then write its counts directly through the recorder.
fn seed<S: Store + PageDirectory>(
    engine: &Engine<S>,
    rotator: &str,
    campaign: &str,
    page: &str,
    impressions: u64,
    stages: &[(Objective, u64)],
) {
    engine.attach_page(rotator, campaign, page).unwrap();
    let (exp, shard) = engine.locate(rotator, campaign).unwrap();
    let variant = exp.variant(page);
    let rec = Recorder::new(&**engine.store(), shard);
    for _ in 0..impressions {
        rec.record_impression(&exp.id, &variant, today()).unwrap();
    }
    for &(stage, n) in stages {
        for _ in 0..n {
            rec.record_conversion(&exp.id, &variant, stage, today())
                .unwrap();
        }
    }
}

// ---------------------------------------------------------------------------
// Scenario A: steady state, clear leader
// ---------------------------------------------------------------------------

#[test]
fn clear_leader_is_served_most_of_the_time() {
    let store = memory_with_members("r_10", &["p_1", "p_2"]);
    let cfg = EngineConfig {
        record_impressions: false,
        ..EngineConfig::default()
    };
    let engine = engine_over(store, cfg);
    seed(&engine, "r_10", "launch", "p_1", 100, &[(Objective::Cta, 50)]);
    seed(&engine, "r_10", "launch", "p_2", 100, &[(Objective::Cta, 10)]);

    let leader = engine.locate("r_10", "launch").unwrap().0.variant("p_1");
    let mut rng = StdRng::seed_from_u64(2024);
    let trials = 2_000;
    let mut wins = 0;
    for _ in 0..trials {
        let sel = engine.select_variant_with(&mut rng, "r_10", "launch").unwrap();
        assert_eq!(sel.decision.objective, Objective::Cta);
        assert!(sel.provisioned.is_none());
        // 100 impressions per arm keep the greedy margin far above the exploit threshold.
        assert_eq!(sel.decision.path, DecisionPath::Explore);
        if sel.variant() == &leader {
            wins += 1;
        }
    }
    let frac = wins as f64 / trials as f64;
    assert!(frac >= 0.9, "leader served {frac:.3} of the time");
}

// ---------------------------------------------------------------------------
// Scenario B: brand-new rotator
// ---------------------------------------------------------------------------

#[test]
fn new_rotator_provisions_every_member_and_forces_one() {
    let store = memory_with_members("r_20", &["p_1", "p_2", "p_3"]);
    let engine = engine_over(Arc::clone(&store), EngineConfig::default());

    let mut rng = StdRng::seed_from_u64(7);
    let sel = engine.select_variant_with(&mut rng, "r_20", "fresh").unwrap();

    let report = sel.provisioned.clone().unwrap();
    assert!(report.created_experiment);
    assert_eq!(report.variants_created, 3);
    assert_eq!(report.history_rows_created, 3);
    assert_eq!(store.history_row_count(sel.shard).unwrap(), 3);
    assert_eq!(sel.decision.path, DecisionPath::Forced);

    let (exp, _) = engine.locate("r_20", "fresh").unwrap();
    let members: Vec<_> = ["p_1", "p_2", "p_3"].iter().map(|p| exp.variant(p)).collect();
    assert!(members.contains(sel.variant()));
    assert_eq!(sel.impression, WriteStatus::Recorded);

    let rows = engine.stats("r_20", "fresh").unwrap().into_rows();
    let total: u64 = rows.iter().map(|r| r.counters.impression).sum();
    assert_eq!(total, 1);
}

#[test]
fn page_attached_later_joins_the_experiment() {
    let store = memory_with_members("r_21", &["p_1"]);
    let engine = engine_over(Arc::clone(&store), EngineConfig::default());
    engine.select_variant("r_21", "late").unwrap();

    store.attach_member("r_21", "p_2").unwrap();
    let report = engine.attach_page("r_21", "late", "p_2").unwrap();
    assert!(!report.created_experiment);
    assert_eq!(report.variants_created, 1);

    // The new page has no CTA yet, so it is forced next.
    let sel = engine.select_variant("r_21", "late").unwrap();
    assert_eq!(sel.decision.path, DecisionPath::Forced);
    assert_eq!(
        sel.variant(),
        &engine.locate("r_21", "late").unwrap().0.variant("p_2")
    );
}

#[test]
fn attaching_a_non_member_page_is_rejected() {
    let store = memory_with_members("r_22", &["p_1"]);
    let engine = engine_over(Arc::clone(&store), EngineConfig::default());

    let err = engine.attach_page("r_22", "x", "p_typo").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(store.experiment_count().unwrap(), 0);

    engine.select_variant("r_22", "x").unwrap();
    assert!(engine.attach_page("r_22", "x", "p_typo").is_err());
    let (exp, _) = engine.locate("r_22", "x").unwrap();
    assert_eq!(store.variants(&exp.key).unwrap().len(), 1);
}

#[test]
fn conversion_before_first_selection_does_not_block_provisioning() {
    let store = memory_with_members("r_23", &["p_1", "p_2"]);
    let engine = engine_over(Arc::clone(&store), EngineConfig::default());
    let (exp, _) = engine.locate("r_23", "promo").unwrap();

    let err = engine
        .record_conversion("r_23", "promo", &exp.variant("p_999"), Objective::Cta)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let members = [exp.variant("p_1"), exp.variant("p_2")];
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..50 {
        let sel = engine.select_variant_with(&mut rng, "r_23", "promo").unwrap();
        assert!(members.contains(sel.variant()), "served {}", sel.variant());
    }
    assert_eq!(store.experiment_count().unwrap(), 1);
    assert_eq!(store.variants(&exp.key).unwrap().len(), 2);
}

#[test]
fn overlapping_rotator_ids_keep_separate_arms() {
    // r_a + b + p_c_d would read as v_a_b_c_d, the same id as r_a_b + c + p_d.
    let store = memory_with_members("r_a", &["p_c_d", "p_e"]);
    store.attach_member("r_a_b", "p_d").unwrap();
    let engine = engine_over(Arc::clone(&store), EngineConfig::default());

    let first = engine.select_variant("r_a", "b").unwrap();
    assert_eq!(first.variant().as_str(), "v_a_b_e");
    let second = engine.select_variant("r_a_b", "c").unwrap();
    assert_eq!(second.variant().as_str(), "v_a_b_c_d");

    assert_eq!(store.experiment_count().unwrap(), 2);
    for (rotator, campaign) in [("r_a", "b"), ("r_a_b", "c")] {
        let (exp, _) = engine.locate(rotator, campaign).unwrap();
        assert_eq!(store.variants(&exp.key).unwrap().len(), 1);
    }
}

// ---------------------------------------------------------------------------
// Scenario C: deep funnel
// ---------------------------------------------------------------------------

#[test]
fn deepest_common_stage_is_the_objective() {
    let store = memory_with_members("r_30", &["p_1", "p_2"]);
    let cfg = EngineConfig {
        record_impressions: false,
        ..EngineConfig::default()
    };
    let engine = engine_over(store, cfg);
    seed(
        &engine,
        "r_30",
        "deep",
        "p_1",
        40,
        &[(Objective::Cta, 20), (Objective::Lead, 5), (Objective::Purchase, 2)],
    );
    seed(
        &engine,
        "r_30",
        "deep",
        "p_2",
        40,
        &[(Objective::Cta, 30), (Objective::Purchase, 1)],
    );

    let rows = engine.stats("r_30", "deep").unwrap().into_rows();
    let resolution = resolve_objective(&rows);
    assert_eq!(resolution.objective, Objective::Purchase);
    assert!(resolution.forced.is_none());

    let sel = engine.select_variant("r_30", "deep").unwrap();
    assert_eq!(sel.decision.objective, Objective::Purchase);
    assert_ne!(sel.decision.path, DecisionPath::Forced);
}

#[test]
fn conversions_through_the_engine_unlock_deeper_objectives() {
    let store = memory_with_members("r_31", &["p_1", "p_2"]);
    let engine = engine_over(store, EngineConfig::default());
    let (exp, _) = engine.locate("r_31", "funnel").unwrap();
    engine.select_variant("r_31", "funnel").unwrap();

    for page in ["p_1", "p_2"] {
        let v = exp.variant(page);
        engine
            .record_conversion("r_31", "funnel", &v, Objective::Cta)
            .unwrap();
        engine
            .record_conversion("r_31", "funnel", &v, Objective::Lead)
            .unwrap();
    }
    let sel = engine.select_variant("r_31", "funnel").unwrap();
    assert_eq!(sel.decision.objective, Objective::Lead);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn concurrent_first_requests_converge() {
    let pages = ["p_1", "p_2", "p_3", "p_4"];
    let store = memory_with_members("r_40", &pages);
    let engine = engine_over(Arc::clone(&store), EngineConfig::default());

    let threads = 8;
    let per_thread = 25;
    thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                for _ in 0..per_thread {
                    let sel = engine.select_variant("r_40", "race").unwrap();
                    assert_eq!(sel.impression, WriteStatus::Recorded);
                }
            });
        }
    });

    let (exp, shard) = engine.locate("r_40", "race").unwrap();
    assert_eq!(store.experiment_count().unwrap(), 1);
    assert_eq!(store.variants(&exp.key).unwrap().len(), pages.len());
    assert_eq!(store.history_row_count(shard).unwrap(), pages.len());

    let total: u64 = engine
        .stats("r_40", "race")
        .unwrap()
        .rows()
        .iter()
        .map(|r| r.counters.impression)
        .sum();
    assert_eq!(total, (threads * per_thread) as u64);
}

#[test]
fn concurrent_increments_are_never_lost() {
    let store = MemoryStore::new(SHARDS);
    let exp = derive_experiment("r_41", "hot").unwrap();
    let shard = ShardRouter::new(SHARDS).unwrap().route(&exp.id);
    let variant = exp.variant("p_1");

    let threads = 8;
    let per_thread = 500;
    thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                let rec = Recorder::new(&store, shard);
                for _ in 0..per_thread {
                    rec.record_impression(&exp.id, &variant, today()).unwrap();
                }
            });
        }
    });

    let counters = store.history(shard, &variant.key(), today()).unwrap().unwrap();
    assert_eq!(counters.impression, (threads * per_thread) as u64);
}

// ---------------------------------------------------------------------------
// Degraded writes
// ---------------------------------------------------------------------------

/// Delegates to a [`MemoryStore`] but fails every counter increment.
struct NoIncrements(MemoryStore);

impl Store for NoIncrements {
    fn shard_count(&self) -> u32 {
        self.0.shard_count()
    }
    fn insert_experiment(&self, rec: &ExperimentRecord) -> Result<bool, StoreError> {
        self.0.insert_experiment(rec)
    }
    fn experiment(&self, key: &ContentKey) -> Result<Option<ExperimentRecord>, StoreError> {
        self.0.experiment(key)
    }
    fn set_experiment_status(
        &self,
        key: &ContentKey,
        status: ExperimentStatus,
    ) -> Result<bool, StoreError> {
        self.0.set_experiment_status(key, status)
    }
    fn insert_variant(&self, rec: &VariantRecord) -> Result<bool, StoreError> {
        self.0.insert_variant(rec)
    }
    fn variant(&self, key: &ContentKey) -> Result<Option<VariantRecord>, StoreError> {
        self.0.variant(key)
    }
    fn variants(&self, experiment_key: &ContentKey) -> Result<Vec<VariantRecord>, StoreError> {
        self.0.variants(experiment_key)
    }
    fn insert_history(&self, shard: ShardLocator, key: &HistoryKey) -> Result<bool, StoreError> {
        self.0.insert_history(shard, key)
    }
    fn increment(&self, _: ShardLocator, _: &HistoryKey, _: Counter) -> Result<(), StoreError> {
        Err(StoreError::Db("counter table locked".into()))
    }
    fn variant_totals(
        &self,
        shard: ShardLocator,
        experiment_key: &ContentKey,
    ) -> Result<Vec<VariantStats>, StoreError> {
        self.0.variant_totals(shard, experiment_key)
    }
    fn history(
        &self,
        shard: ShardLocator,
        variant_key: &ContentKey,
        day: NaiveDate,
    ) -> Result<Option<FunnelCounters>, StoreError> {
        self.0.history(shard, variant_key, day)
    }
}

impl PageDirectory for NoIncrements {
    fn page_by_url_key(&self, url_key: &ContentKey) -> Result<Option<PageRecord>, StoreError> {
        self.0.page_by_url_key(url_key)
    }
    fn rotator_pages(&self, rotator_id: &str) -> Result<Vec<String>, StoreError> {
        self.0.rotator_pages(rotator_id)
    }
}

#[test]
fn failed_impression_write_still_returns_selection() {
    let inner = MemoryStore::new(SHARDS);
    inner.attach_member("r_50", "p_1").unwrap();
    inner.attach_member("r_50", "p_2").unwrap();
    let engine = engine_over(Arc::new(NoIncrements(inner)), EngineConfig::default());

    let sel = engine.select_variant("r_50", "flaky").unwrap();
    assert!(sel.impression.is_degraded());
    assert!(sel.provisioned.is_some());
    assert_eq!(sel.decision.path, DecisionPath::Forced);
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use rotor::SqliteStore;

    fn sqlite_with_members(rotator: &str, pages: &[&str]) -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::open_in_memory(SHARDS).unwrap());
        for p in pages {
            store.attach_member(rotator, p).unwrap();
        }
        store
    }

    #[test]
    fn cold_start_and_replay_on_sqlite() {
        let store = sqlite_with_members("r_60", &["p_1", "p_2", "p_3"]);
        let engine = engine_over(Arc::clone(&store), EngineConfig::default());
        let first = engine.select_variant("r_60", "sql").unwrap();
        assert_eq!(first.provisioned.as_ref().unwrap().variants_created, 3);

        let second = engine.select_variant("r_60", "sql").unwrap();
        assert!(second.provisioned.is_none());

        let (exp, _) = engine.locate("r_60", "sql").unwrap();
        assert_eq!(store.variants(&exp.key).unwrap().len(), 3);
        let rows = engine.stats("r_60", "sql").unwrap().into_rows();
        assert_eq!(rows.iter().map(|r| r.counters.impression).sum::<u64>(), 2);
    }

    #[test]
    fn concurrent_selections_on_sqlite() {
        let store = sqlite_with_members("r_61", &["p_1", "p_2"]);
        let engine = engine_over(Arc::clone(&store), EngineConfig::default());
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..20 {
                        engine.select_variant("r_61", "sqlrace").unwrap();
                    }
                });
            }
        });
        let (exp, _) = engine.locate("r_61", "sqlrace").unwrap();
        assert_eq!(store.variants(&exp.key).unwrap().len(), 2);
        let rows = engine.stats("r_61", "sqlrace").unwrap().into_rows();
        assert_eq!(rows.iter().map(|r| r.counters.impression).sum::<u64>(), 80);
    }
}
