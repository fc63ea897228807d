use rand::Rng;

/// Pick an index from `weights` with probability proportional to its weight,
/// using the thread-local RNG. Returns `None` when there is nothing to pick.
pub fn pick_weighted(weights: &[u32]) -> Option<usize> {
    pick_weighted_with(&mut rand::thread_rng(), weights)
}

/// Weighted pick with an explicit RNG.
///
/// A single candidate is returned without drawing. Otherwise a value is drawn
/// uniformly from `[0, sum)` and weights are subtracted in ascending order
/// until the draw goes negative; the weight that crossed zero wins. The
/// caller's slice is never reordered. Zero weights are treated as 1.
pub fn pick_weighted_with<R: Rng + ?Sized>(rng: &mut R, weights: &[u32]) -> Option<usize> {
    match weights.len() {
        0 => return None,
        1 => return Some(0),
        _ => {}
    }

    let mut ranked: Vec<(i64, usize)> = weights
        .iter()
        .enumerate()
        .map(|(idx, &w)| (i64::from(w.max(1)), idx))
        .collect();
    ranked.sort_by_key(|&(w, _)| w);

    let total: i64 = ranked.iter().map(|&(w, _)| w).sum();
    let mut draw = rng.gen_range(0..total);

    for &(weight, idx) in &ranked {
        draw -= weight;
        if draw < 0 {
            return Some(idx);
        }
    }

    // Unreachable while draw < total.
    ranked.last().map(|&(_, idx)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_empty_and_single() {
        assert_eq!(pick_weighted(&[]), None);
        assert_eq!(pick_weighted(&[42]), Some(0));
    }

    #[test]
    fn test_distribution_follows_weights() {
        let mut rng = StdRng::seed_from_u64(7);
        let weights = [5, 10, 20];
        let mut counts = [0usize; 3];
        for _ in 0..7000 {
            let idx = pick_weighted_with(&mut rng, &weights).unwrap();
            counts[idx] += 1;
        }

        // Expected 1000 / 2000 / 4000.
        let ratio_1 = counts[1] as f64 / counts[0] as f64;
        let ratio_2 = counts[2] as f64 / counts[0] as f64;
        assert!((1.6..2.4).contains(&ratio_1), "ratio 1 was {}", ratio_1);
        assert!((3.2..4.8).contains(&ratio_2), "ratio 2 was {}", ratio_2);
    }

    #[test]
    fn test_input_is_not_reordered() {
        let mut rng = StdRng::seed_from_u64(1);
        let weights = vec![30, 1, 5];
        let before = weights.clone();
        for _ in 0..100 {
            let idx = pick_weighted_with(&mut rng, &weights).unwrap();
            assert!(idx < 3);
        }
        assert_eq!(weights, before);
    }

    #[test]
    fn test_heavy_weight_dominates() {
        let mut rng = StdRng::seed_from_u64(99);
        let weights = [1, 1000];
        let heavy = (0..1000)
            .filter(|_| pick_weighted_with(&mut rng, &weights) == Some(1))
            .count();
        assert!(heavy > 950);
    }
}
