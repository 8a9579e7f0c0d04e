//! Hellinger geometry for Bernoulli arms.
//!
//! The confidence region around an empirical click rate `p̂` is the set of
//! Bernoulli parameters `q` whose squared Hellinger distance to `p̂` stays under
//! an exploration budget `α`. Its upper end is the arm's UCB.

/// Default bisection tolerance for [`find_hellinger_ucb`].
pub const DEFAULT_TOLERANCE: f64 = 1e-6;

/// Hard cap on bisection steps.
///
/// Width halves every step, so 64 steps exhaust `f64` precision on `[0, 1]`
/// even for a tolerance below machine epsilon.
const MAX_BISECTION_STEPS: u32 = 64;

#[inline]
fn clamp_unit(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

/// Bhattacharyya coefficient between `Bernoulli(p)` and `Bernoulli(q)`.
#[inline]
fn bernoulli_bhattacharyya(p: f64, q: f64) -> f64 {
    let bc = (p * q).sqrt() + ((1.0 - p) * (1.0 - q)).sqrt();
    // Clamp to guard against tiny floating error (e.g. 1 + 1e-16).
    bc.clamp(0.0, 1.0)
}

/// Squared Hellinger distance between two Bernoulli parameters:
/// `H²(p, q) = 1 − (√(p·q) + √((1−p)·(1−q)))`.
///
/// Both inputs are clamped into `[0, 1]` first (NaN is treated as `0`), so the
/// result is always in `[0, 1]`. Symmetric; zero on the diagonal; exactly `1`
/// for `{p, q} = {0, 1}`.
///
/// ```rust
/// use ucbrank::hellinger_squared;
///
/// assert_eq!(hellinger_squared(0.0, 1.0), 1.0);
/// assert!(hellinger_squared(0.3, 0.3).abs() < 1e-12);
/// ```
#[must_use]
pub fn hellinger_squared(p: f64, q: f64) -> f64 {
    let p = clamp_unit(p);
    let q = clamp_unit(q);
    1.0 - bernoulli_bhattacharyya(p, q)
}

/// Largest `q ∈ [0, 1]` with `H²(p̂, q) ≤ α`, found by bisection to within `tol`.
///
/// The feasible set is an interval containing `p̂` (the distance is zero there
/// and grows monotonically away from it), so the search runs over `[p̂, 1]`:
/// a feasible midpoint raises the lower bound, an infeasible one lowers the
/// upper bound. Returns the last feasible lower bound once the interval width
/// is at most `tol`. The upper end `1` itself is never probed, so the result
/// is `1.0` only when `p̂ = 1`; otherwise it lies within `tol` below the bound.
///
/// - `p_hat` is clamped into `[0, 1]`.
/// - `alpha < 0` or NaN is treated as `0` (the bound collapses to `p̂`).
/// - A non-finite or non-positive `tol` falls back to [`DEFAULT_TOLERANCE`].
///
/// The result is non-decreasing in `alpha` for a fixed `p_hat`.
#[must_use]
pub fn find_hellinger_ucb(p_hat: f64, alpha: f64, tol: f64) -> f64 {
    let p_hat = clamp_unit(p_hat);
    let alpha = if alpha.is_nan() { 0.0 } else { alpha.max(0.0) };
    let tol = if tol.is_finite() && tol > 0.0 {
        tol
    } else {
        DEFAULT_TOLERANCE
    };

    let mut low = p_hat;
    let mut high = 1.0_f64;
    let mut steps = 0;
    while (high - low) > tol && steps < MAX_BISECTION_STEPS {
        let mid = 0.5 * (low + high);
        if mid <= low || mid >= high {
            break;
        }
        if hellinger_squared(p_hat, mid) <= alpha {
            low = mid;
        } else {
            high = mid;
        }
        steps += 1;
    }
    low
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn extremes_are_maximally_distant() {
        assert_eq!(hellinger_squared(0.0, 1.0), 1.0);
        assert_eq!(hellinger_squared(1.0, 0.0), 1.0);
    }

    #[test]
    fn out_of_range_inputs_are_clamped() {
        assert_eq!(hellinger_squared(-3.0, 7.0), hellinger_squared(0.0, 1.0));
        assert_eq!(hellinger_squared(f64::NAN, 0.0), 0.0);
    }

    #[test]
    fn zero_budget_returns_empirical_rate() {
        let q = find_hellinger_ucb(0.4, 0.0, DEFAULT_TOLERANCE);
        assert!((q - 0.4).abs() <= 1e-6, "q={q}");
    }

    #[test]
    fn full_budget_approaches_one_from_below() {
        for p_hat in [0.0, 0.9] {
            let q = find_hellinger_ucb(p_hat, 1.0, DEFAULT_TOLERANCE);
            assert!(q < 1.0 && 1.0 - q <= DEFAULT_TOLERANCE, "q={q}");
        }
        assert_eq!(find_hellinger_ucb(1.0, 0.0, DEFAULT_TOLERANCE), 1.0);
    }

    #[test]
    fn bound_sits_on_the_constraint_boundary() {
        let p_hat = 0.2;
        let alpha = 0.05;
        let q = find_hellinger_ucb(p_hat, alpha, 1e-9);
        assert!(q > p_hat);
        assert!(hellinger_squared(p_hat, q) <= alpha);
        // A step just past the bound violates the constraint.
        assert!(hellinger_squared(p_hat, q + 1e-6) > alpha);
    }

    #[test]
    fn high_empirical_rates_keep_an_optimistic_bound() {
        // The bound never drops below the empirical rate, even for p̂ > 0.5.
        let q = find_hellinger_ucb(0.9, 0.01, DEFAULT_TOLERANCE);
        assert!(q >= 0.9, "q={q}");
        assert!(q < 1.0);
    }

    #[test]
    fn degenerate_tolerance_still_terminates() {
        let q = find_hellinger_ucb(0.3, 0.02, 0.0);
        assert!((0.3..=1.0).contains(&q));
        let q = find_hellinger_ucb(0.3, 0.02, 1e-300);
        assert!((0.3..=1.0).contains(&q));
    }

    proptest! {
        #[test]
        fn distance_is_symmetric_and_bounded(p in 0.0f64..=1.0, q in 0.0f64..=1.0) {
            let a = hellinger_squared(p, q);
            let b = hellinger_squared(q, p);
            prop_assert!((a - b).abs() < 1e-12);
            prop_assert!((0.0..=1.0).contains(&a));
        }

        #[test]
        fn distance_vanishes_on_diagonal(p in 0.0f64..=1.0) {
            prop_assert!(hellinger_squared(p, p).abs() < 1e-12);
        }

        #[test]
        fn ucb_is_monotone_in_alpha(
            p_hat in 0.0f64..=1.0,
            a1 in 0.0f64..=1.0,
            a2 in 0.0f64..=1.0,
        ) {
            let (lo, hi) = if a1 <= a2 { (a1, a2) } else { (a2, a1) };
            let q_lo = find_hellinger_ucb(p_hat, lo, DEFAULT_TOLERANCE);
            let q_hi = find_hellinger_ucb(p_hat, hi, DEFAULT_TOLERANCE);
            prop_assert!(
                q_lo <= q_hi,
                "p_hat={} lo={} hi={} q_lo={} q_hi={}",
                p_hat,
                lo,
                hi,
                q_lo,
                q_hi
            );
        }

        #[test]
        fn ucb_is_feasible_and_optimistic(p_hat in 0.0f64..=1.0, alpha in 0.0f64..=1.0) {
            let q = find_hellinger_ucb(p_hat, alpha, DEFAULT_TOLERANCE);
            prop_assert!((0.0..=1.0).contains(&q));
            prop_assert!(q >= p_hat);
            prop_assert!(hellinger_squared(p_hat, q) <= alpha + 1e-12);
        }
    }
}
