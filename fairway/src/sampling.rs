//! Weighted random ordering for partition peeks.

use rand::Rng;

/// Returns a permutation of `items` drawn without replacement, where an
/// item's chance of appearing earlier is proportional to its weight.
///
/// Each item gets the key `-ln(U)/w` for an independent uniform `U`, and the
/// permutation is the ascending key order (Efraimidis-Spirakis sampling).
/// Weights at or below zero degrade to the smallest positive weight.
pub(crate) fn weighted_permutation<T, R, F>(rng: &mut R, items: Vec<T>, weight: F) -> Vec<T>
where
    R: Rng + ?Sized,
    F: Fn(&T) -> f64,
{
    let mut keyed: Vec<(f64, T)> = items
        .into_iter()
        .map(|item| {
            let w = weight(&item).max(f64::MIN_POSITIVE);
            let u: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
            ((-u.ln()) / w, item)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    keyed.into_iter().map(|(_, item)| item).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_permutation_preserves_members() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut out = weighted_permutation(&mut rng, vec![1, 2, 3, 4, 5], |_| 1.0);
        out.sort();
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_heavier_items_come_first_more_often() {
        // One light item against two heavy ones: over many draws the light
        // item should lead rarely, the heavy ones often.
        let mut rng = StdRng::seed_from_u64(42);
        let (mut a, mut b, mut c) = (0u32, 0u32, 0u32);
        for _ in 0..1000 {
            let order = weighted_permutation(
                &mut rng,
                vec![("a", 1.0), ("b", 10.0), ("c", 10.0)],
                |(_, w)| *w,
            );
            match order[0].0 {
                "a" => a += 1,
                "b" => b += 1,
                _ => c += 1,
            }
        }
        assert!(a < 250, "light item led {a} of 1000 draws");
        assert!(b > 300, "heavy item b led only {b} of 1000 draws");
        assert!(c > 300, "heavy item c led only {c} of 1000 draws");
    }

    #[test]
    fn test_zero_weight_is_tolerated() {
        let mut rng = StdRng::seed_from_u64(7);
        let out = weighted_permutation(&mut rng, vec![("x", 0.0), ("y", 5.0)], |(_, w)| *w);
        assert_eq!(out.len(), 2);
    }
}
