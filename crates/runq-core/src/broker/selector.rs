use rand::Rng;

use crate::broker::weight::WeightedQueue;

/// Weighted random pick among candidate queues. Returns the index of the
/// chosen queue, or `None` when there are no candidates.
///
/// Negative and NaN weights count as zero. If no candidate has positive
/// weight (or the total overflows) the last candidate is chosen.
pub fn select<R: Rng + ?Sized>(candidates: &[WeightedQueue], rng: &mut R) -> Option<usize> {
    let last = candidates.len().checked_sub(1)?;
    let total: f64 = candidates.iter().map(|c| c.weight.max(0.0)).sum();
    if !total.is_finite() || total <= 0.0 {
        return Some(last);
    }

    let mut draw = rng.random::<f64>() * total;
    for (i, candidate) in candidates.iter().enumerate() {
        let w = candidate.weight.max(0.0);
        if draw < w {
            return Some(i);
        }
        draw -= w;
    }
    // Float rounding can leave a sliver past the final bucket.
    Some(
        candidates
            .iter()
            .rposition(|c| c.weight > 0.0)
            .unwrap_or(last),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::weight::weight;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn wq(queue: &str, weight: f64) -> WeightedQueue {
        WeightedQueue {
            queue: queue.to_string(),
            weight,
        }
    }

    #[test]
    fn empty_candidates_select_nothing() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(select(&[], &mut rng), None);
    }

    #[test]
    fn zero_total_falls_back_to_last() {
        let mut rng = StdRng::seed_from_u64(1);
        let c = [wq("a", 0.0), wq("b", 0.0), wq("c", -3.0)];
        assert_eq!(select(&c, &mut rng), Some(2));

        let c = [wq("a", f64::NAN), wq("b", f64::NAN)];
        assert_eq!(select(&c, &mut rng), Some(1));
    }

    #[test]
    fn zero_weight_is_never_drawn_when_others_are_positive() {
        let mut rng = StdRng::seed_from_u64(7);
        let c = [wq("full", 0.0), wq("free", 0.2)];
        for _ in 0..1_000 {
            assert_eq!(select(&c, &mut rng), Some(1));
        }
    }

    #[test]
    fn free_queue_wins_more_often_at_equal_age() {
        let now = 1_000;
        let oldest = 999;
        let full = wq("full", weight(now, oldest, Some(4), 4));
        let free = wq("free", weight(now, oldest, Some(4), 0));
        let c = [full, free];

        let mut rng = StdRng::seed_from_u64(42);
        let mut wins = [0u32; 2];
        for _ in 0..10_000 {
            if let Some(i) = select(&c, &mut rng) {
                wins[i] += 1;
            }
        }
        // Weights 0.8 and 1.0: the free queue should take ~55% of draws.
        assert!(wins[1] > wins[0], "free {} vs full {}", wins[1], wins[0]);
        assert!(wins[0] > 3_500, "the full queue is still served: {}", wins[0]);
    }

    #[test]
    fn draws_follow_weight_proportions() {
        let c = [wq("a", 1.0), wq("b", 3.0)];
        let mut rng = StdRng::seed_from_u64(3);
        let mut b_wins = 0u32;
        for _ in 0..20_000 {
            if select(&c, &mut rng) == Some(1) {
                b_wins += 1;
            }
        }
        let share = f64::from(b_wins) / 20_000.0;
        assert!((share - 0.75).abs() < 0.02, "b share {share}");
    }

    proptest! {
        #[test]
        fn pick_is_always_a_candidate(
            weights in proptest::collection::vec(-10.0f64..1e6, 1..32),
            seed in any::<u64>(),
        ) {
            let c: Vec<WeightedQueue> = weights
                .iter()
                .enumerate()
                .map(|(i, w)| wq(&format!("q{i}"), *w))
                .collect();
            let mut rng = StdRng::seed_from_u64(seed);
            let picked = select(&c, &mut rng);
            prop_assert!(matches!(picked, Some(i) if i < c.len()));
            if let Some(i) = picked {
                let any_positive = c.iter().any(|q| q.weight > 0.0);
                if any_positive {
                    prop_assert!(c[i].weight > 0.0);
                }
            }
        }
    }
}
