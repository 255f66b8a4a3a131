//! Question sampling for new exams.

use rand::seq::SliceRandom;
use rand::Rng;

/// Pick `count` distinct items: shuffle a copy, then take the front.
///
/// Returns fewer than `count` only when `items` is shorter.
pub fn sample<T: Clone, R: Rng + ?Sized>(items: &[T], count: usize, rng: &mut R) -> Vec<T> {
    let mut pool = items.to_vec();
    pool.shuffle(rng);
    pool.truncate(count);
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    #[test]
    fn count_larger_than_pool_returns_everything() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut got = sample(&[1, 2, 3], 10, &mut rng);
        got.sort();
        assert_eq!(got, vec![1, 2, 3]);
    }

    proptest! {
        #[test]
        fn same_seed_same_sample(seed in any::<u64>(), n in 1usize..40, k in 0usize..40) {
            let items: Vec<usize> = (0..n).collect();
            let a = sample(&items, k, &mut StdRng::seed_from_u64(seed));
            let b = sample(&items, k, &mut StdRng::seed_from_u64(seed));
            prop_assert_eq!(a, b);
        }

        #[test]
        fn exact_count_without_repeats(seed in any::<u64>(), n in 1usize..40, k in 0usize..40) {
            let items: Vec<usize> = (0..n).collect();
            let got = sample(&items, k, &mut StdRng::seed_from_u64(seed));
            prop_assert_eq!(got.len(), k.min(n));
            let distinct: BTreeSet<_> = got.iter().collect();
            prop_assert_eq!(distinct.len(), got.len());
            prop_assert!(got.iter().all(|x| *x < n));
        }
    }
}
