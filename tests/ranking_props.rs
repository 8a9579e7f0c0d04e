//! Property tests for the pure scoring and ranking layers.

use std::collections::BTreeMap;

use proptest::prelude::*;
use ucbrank::{
    find_hellinger_ucb, hellinger_squared, hellinger_ucb, rank_articles, time_index, ArmCounts,
    ArmId, Error, DEFAULT_TOLERANCE,
};

fn stats_strategy(n: usize) -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((0u64..200, 0u64..200), n)
}

// ---------------------------------------------------------------------------
// Distance and root-finder
// ---------------------------------------------------------------------------

#[test]
fn distance_endpoints() {
    assert_eq!(hellinger_squared(0.0, 1.0), 1.0);
    assert_eq!(hellinger_squared(1.0, 0.0), 1.0);
    assert_eq!(hellinger_squared(0.0, 0.0), 0.0);
    assert_eq!(hellinger_squared(1.0, 1.0), 0.0);
}

proptest! {
    #[test]
    fn distance_is_zero_only_on_the_diagonal(p in 0.0f64..=1.0, q in 0.0f64..=1.0) {
        let d = hellinger_squared(p, q);
        prop_assert!((d - hellinger_squared(q, p)).abs() < 1e-12);
        if (p - q).abs() > 1e-3 {
            prop_assert!(d > 0.0);
        }
    }

    #[test]
    fn root_finder_is_monotone_in_budget(
        p_hat in 0.0f64..=1.0,
        a in 0.0f64..=1.0,
        b in 0.0f64..=1.0,
    ) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(
            find_hellinger_ucb(p_hat, lo, DEFAULT_TOLERANCE)
                <= find_hellinger_ucb(p_hat, hi, DEFAULT_TOLERANCE)
        );
    }
}

// ---------------------------------------------------------------------------
// Score
// ---------------------------------------------------------------------------

#[test]
fn score_rejects_constants_outside_range() {
    for c in [0.1, 0.6] {
        assert!(matches!(
            hellinger_ucb(4, 1, 10.0, c),
            Err(Error::Configuration(_))
        ));
    }
    for c in [0.3, 0.5] {
        assert!(hellinger_ucb(4, 1, 10.0, c).is_ok());
    }
}

proptest! {
    #[test]
    fn cold_arms_always_score_one(t in 1.0f64..1e7, c in 0.2501f64..=0.5) {
        prop_assert_eq!(hellinger_ucb(0, 0, t, c).unwrap(), 1.0);
    }

    #[test]
    fn more_data_at_the_same_rate_never_widens_the_bound(
        n in 1u64..50,
        frac in 0.0f64..=1.0,
        k in 2u64..6,
        t in 1.0f64..5_000.0,
    ) {
        let s = ((n as f64) * frac).floor() as u64;
        let few = hellinger_ucb(n, s, t, 0.3).unwrap();
        let many = hellinger_ucb(n * k, s * k, t, 0.3).unwrap();
        prop_assert!(many <= few + 1e-6, "few={} many={}", few, many);
    }
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

#[test]
fn tied_cold_arms_keep_input_order_ahead_of_a_warm_arm() {
    let mut stats = BTreeMap::new();
    stats.insert(ArmId(10), ArmCounts::new(0, 0));
    stats.insert(ArmId(20), ArmCounts::new(0, 0));
    stats.insert(ArmId(30), ArmCounts::new(10, 9));
    let ranked = rank_articles(&[ArmId(10), ArmId(20), ArmId(30)], &stats, 10.0, 0.3).unwrap();
    assert_eq!(
        ranked.iter().map(|(a, _)| *a).collect::<Vec<_>>(),
        vec![ArmId(10), ArmId(20), ArmId(30)]
    );
    assert_eq!(ranked[0].1, 1.0);
    assert_eq!(ranked[1].1, 1.0);
    assert!(ranked[2].1 < 1.0);
}

proptest! {
    /// The output is a permutation of the input, sorted descending, with ties
    /// in input order.
    #[test]
    fn ranking_is_a_stable_descending_permutation(raw in stats_strategy(12)) {
        let arms: Vec<ArmId> = (0..raw.len() as i64).map(ArmId).collect();
        let stats: BTreeMap<ArmId, ArmCounts> = arms
            .iter()
            .zip(&raw)
            .map(|(a, &(n, s))| (*a, ArmCounts::new(n, s.min(n))))
            .collect();
        let t = time_index(&arms, &stats);
        let ranked = rank_articles(&arms, &stats, t, 0.26).unwrap();

        prop_assert_eq!(ranked.len(), arms.len());
        let mut seen: Vec<ArmId> = ranked.iter().map(|(a, _)| *a).collect();
        seen.sort();
        prop_assert_eq!(&seen, &arms);

        for w in ranked.windows(2) {
            prop_assert!(w[0].1 >= w[1].1);
            if w[0].1 == w[1].1 {
                prop_assert!(w[0].0 < w[1].0, "tie broke input order");
            }
        }
    }

    #[test]
    fn ranking_is_deterministic(raw in stats_strategy(8), rev in any::<bool>()) {
        let mut arms: Vec<ArmId> = (0..raw.len() as i64).map(ArmId).collect();
        if rev {
            arms.reverse();
        }
        let stats: BTreeMap<ArmId, ArmCounts> = (0..raw.len())
            .map(|i| (ArmId(i as i64), ArmCounts::new(raw[i].0, raw[i].1)))
            .collect();
        let a = rank_articles(&arms, &stats, 50.0, 0.4).unwrap();
        let b = rank_articles(&arms, &stats, 50.0, 0.4).unwrap();
        prop_assert_eq!(a, b);
    }
}
