//! Property tests for identity, routing, objective resolution and the selection policy.

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rotor::{
    derive_experiment, derive_variant, margin_of_error, resolve_objective, select_variant,
    DecisionPath, FunnelCounters, Objective, SelectionConfig, ShardRouter, VariantId,
    VariantStats,
};

fn rotator() -> impl Strategy<Value = String> {
    "[a-z0-9_]{1,12}".prop_map(|b| format!("r_{b}"))
}

fn campaign() -> impl Strategy<Value = String> {
    "[a-z0-9-]{1,16}"
}

fn counters() -> impl Strategy<Value = FunnelCounters> {
    (0u64..500, 0u64..4, 0u64..4, 0u64..4, 0u64..4, 0u64..4).prop_map(
        |(impression, cta, lead, mql, prospek, purchase)| FunnelCounters {
            impression,
            cta,
            lead,
            mql,
            prospek,
            purchase,
        },
    )
}

fn rows(max: usize) -> impl Strategy<Value = Vec<VariantStats>> {
    prop::collection::vec(counters(), 1..max).prop_map(|cs| {
        cs.into_iter()
            .enumerate()
            .map(|(i, counters)| VariantStats {
                variant_id: VariantId::from_stored(format!("v_1_c_{i:03}")),
                counters,
            })
            .collect()
    })
}

// ---------------------------------------------------------------------------
// Identity and routing
// ---------------------------------------------------------------------------

proptest! {
    /// Same inputs always derive the same ids, keys and shard.
    #[test]
    fn identity_and_shard_are_deterministic(
        r in rotator(),
        c in campaign(),
        page in "[0-9]{1,6}",
        shards in 1u32..256,
    ) {
        let a = derive_experiment(&r, &c).unwrap();
        let b = derive_experiment(&r, &c).unwrap();
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.variant(&format!("p_{page}")), b.variant(&page));

        let router = ShardRouter::new(shards).unwrap();
        let shard = router.route(&a.id);
        prop_assert!(shard.index() < shards);
        prop_assert_eq!(shard, router.route(&b.id));
    }

    /// Distinct `(rotator, campaign)` pairs never share an experiment id.
    #[test]
    fn experiment_ids_are_injective(
        r1 in rotator(), c1 in campaign(),
        r2 in rotator(), c2 in campaign(),
    ) {
        let a = derive_experiment(&r1, &c1).unwrap();
        let b = derive_experiment(&r2, &c2).unwrap();
        prop_assert_eq!(a.id == b.id, r1 == r2 && c1 == c2);
    }

    /// A page body containing `_` is rejected rather than folded into the variant id.
    #[test]
    fn underscored_page_ids_are_rejected(
        r in rotator(),
        c in campaign(),
        head in "[a-z0-9]{1,4}",
        tail in "[a-z0-9_]{0,4}",
    ) {
        let page = format!("p_{head}_{tail}");
        prop_assert!(derive_variant(&r, &c, &page).is_err());
    }

    /// Distinct `(rotator, campaign, page)` triples never share a variant id.
    ///
    /// Small alphabets so that near-collisions like `r_a` + `b` vs `r_a_b` are common.
    #[test]
    fn variant_ids_are_injective(
        r1 in "r_[ab_]{1,4}", c1 in "[ab]{1,3}", p1 in "[ab]{1,2}",
        r2 in "r_[ab_]{1,4}", c2 in "[ab]{1,3}", p2 in "[ab]{1,2}",
    ) {
        let a = derive_variant(&r1, &c1, &format!("p_{p1}")).unwrap();
        let b = derive_variant(&r2, &c2, &format!("p_{p2}")).unwrap();
        prop_assert_eq!(a == b, r1 == r2 && c1 == c2 && p1 == p2);
        let owner = derive_experiment(&r2, &c2).unwrap();
        prop_assert_eq!(owner.owns(&a), r1 == r2 && c1 == c2);
    }

    /// Variants derived from an experiment are owned by it.
    #[test]
    fn derived_variants_are_owned(r in rotator(), c in campaign(), page in "[a-z0-9]{1,8}") {
        let e = derive_experiment(&r, &c).unwrap();
        prop_assert!(e.owns(&e.variant(&page)));
    }
}

// ---------------------------------------------------------------------------
// Objective resolution
// ---------------------------------------------------------------------------

proptest! {
    /// The resolved stage is ready for every row, and no deeper stage is.
    #[test]
    fn objective_is_deepest_ready_stage(rows in rows(6)) {
        let res = resolve_objective(&rows);
        let ready = |o: Objective| rows.iter().all(|r| o.count(&r.counters) >= 1);
        if res.objective != Objective::Cta {
            prop_assert!(ready(res.objective));
        }
        for deeper in Objective::ALL.into_iter().filter(|o| *o > res.objective) {
            prop_assert!(!ready(deeper), "{deeper} is ready but {} was chosen", res.objective);
        }
    }

    /// A row is forced iff some row has zero CTA, and it is the last such row.
    #[test]
    fn forced_is_last_zero_cta_row(rows in rows(6)) {
        let res = resolve_objective(&rows);
        let expected = rows
            .iter()
            .rev()
            .find(|r| r.counters.cta == 0)
            .map(|r| r.variant_id.clone());
        prop_assert_eq!(res.forced, expected);
    }
}

// ---------------------------------------------------------------------------
// Selection policy
// ---------------------------------------------------------------------------

proptest! {
    /// The chosen arm is always one of the input rows; forced resolutions are honored.
    #[test]
    fn selection_stays_within_arms(rows in rows(8), seed in any::<u64>()) {
        let res = resolve_objective(&rows);
        let mut rng = StdRng::seed_from_u64(seed);
        let d = select_variant(&mut rng, &rows, &res, &SelectionConfig::default()).unwrap();
        prop_assert!(rows.iter().any(|r| r.variant_id == d.chosen));
        prop_assert_eq!(d.objective, res.objective);
        match &res.forced {
            Some(f) => {
                prop_assert_eq!(&d.chosen, f);
                prop_assert_eq!(d.path, DecisionPath::Forced);
            }
            None => prop_assert_ne!(d.path, DecisionPath::Forced),
        }
    }

    /// Same aggregates and seed give the same decision.
    #[test]
    fn selection_is_reproducible(rows in rows(8), seed in any::<u64>()) {
        let res = resolve_objective(&rows);
        let cfg = SelectionConfig::default();
        let a = select_variant(&mut StdRng::seed_from_u64(seed), &rows, &res, &cfg).unwrap();
        let b = select_variant(&mut StdRng::seed_from_u64(seed), &rows, &res, &cfg).unwrap();
        prop_assert_eq!(a.chosen, b.chosen);
        prop_assert_eq!(a.path, b.path);
    }

    /// Exploit only ever happens when the greedy margin is within the threshold.
    #[test]
    fn exploit_requires_tight_margin(rows in rows(5), seed in any::<u64>()) {
        let res = resolve_objective(&rows);
        let cfg = SelectionConfig::default();
        let d = select_variant(&mut StdRng::seed_from_u64(seed), &rows, &res, &cfg).unwrap();
        if d.path == DecisionPath::Exploit {
            let m = d.greedy_margin().unwrap();
            prop_assert!(m <= cfg.margin_threshold);
        }
    }

    /// The margin shrinks as trials grow at a fixed rate.
    #[test]
    fn margin_shrinks_with_trials(n in 10u64..10_000, k in 2u64..50) {
        let s = n / 2;
        let wide = margin_of_error(s, n, 0.95);
        let narrow = margin_of_error(s * k, n * k, 0.95);
        prop_assert!(narrow < wide);
    }
}
