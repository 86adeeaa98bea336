//! Input relation generation.
//!
//! R gets a shuffled permutation of the dense key domain `1..=|R|`. Uniform
//! S is built from whole shuffled permutations of that domain (plus a
//! shuffled remainder), so every build key appears `|S| / |R|` or
//! `|S| / |R| + 1` times. Skewed S draws Zipf-distributed ranks and maps
//! them through a shuffled copy of the domain, so the popular keys are
//! scattered across it rather than clustered at its low end.
//!
//! Payloads are always the key, which keeps checksums reproducible across
//! runs and machines.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Zipf};

use crate::error::{Error, Result};
use crate::{Key, RelId, Relation, Tuple};

fn permutation(n: usize, rng: &mut ChaCha8Rng) -> Vec<Tuple> {
    let mut tuples: Vec<Tuple> = (1..=n as Key).map(|k| Tuple::new(k, k)).collect();
    tuples.shuffle(rng);
    tuples
}

/// Build side: a shuffled permutation of `1..=size`.
pub fn primary_keys(size: usize, seed: u64) -> Relation {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Relation::new(RelId::R, permutation(size, &mut rng))
}

/// Uniform probe side over a build side of `r_size` keys.
pub fn foreign_keys(r_size: usize, s_size: usize, seed: u64) -> Relation {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut tuples = Vec::with_capacity(s_size);

    for _ in 0..s_size / r_size {
        tuples.extend(permutation(r_size, &mut rng));
    }
    tuples.extend(permutation(s_size % r_size, &mut rng));

    Relation::new(RelId::S, tuples)
}

/// Zipf-skewed probe side with exponent `skew`.
pub fn zipf_keys(r_size: usize, s_size: usize, skew: f64, seed: u64) -> Result<Relation> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let mut domain: Vec<Key> = (1..=r_size as Key).collect();
    domain.shuffle(&mut rng);

    let ranks = Zipf::new(r_size as f64, skew)
        .map_err(|e| Error::InvalidSkew { value: skew, reason: e.to_string() })?;

    let tuples = (0..s_size)
        .map(|_| {
            let rank = ranks.sample(&mut rng) as usize;
            let key = domain[rank - 1];
            Tuple::new(key, key)
        })
        .collect();

    Ok(Relation::new(RelId::S, tuples))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_keys_are_a_permutation() {
        let rel = primary_keys(1000, 7);
        let mut keys: Vec<Key> = rel.tuples.iter().map(|t| t.key).collect();
        keys.sort_unstable();
        assert_eq!(keys, (1..=1000).collect::<Vec<_>>());
    }

    #[test]
    fn primary_keys_are_shuffled() {
        let rel = primary_keys(1000, 7);
        let sorted = rel.tuples.windows(2).all(|w| w[0].key < w[1].key);
        assert!(!sorted);
    }

    #[test]
    fn payloads_equal_keys() {
        for rel in [primary_keys(64, 1), foreign_keys(64, 200, 2)] {
            assert!(rel.tuples.iter().all(|t| t.payload == t.key));
        }
    }

    #[test]
    fn foreign_key_frequencies() {
        // |S| = 2|R| + 5: keys 1..=5 appear three times, the rest twice.
        let rel = foreign_keys(100, 205, 3);
        let mut freq = vec![0u32; 101];
        for t in &rel.tuples {
            freq[t.key as usize] += 1;
        }
        for k in 1..=100usize {
            let want = 2 + (k <= 5) as u32;
            assert_eq!(freq[k], want, "key {k}");
        }
    }

    #[test]
    fn zipf_keys_stay_in_domain() {
        let rel = zipf_keys(256, 4096, 1.2, 9).unwrap();
        assert_eq!(rel.len(), 4096);
        assert!(rel.tuples.iter().all(|t| (1..=256).contains(&t.key)));
    }

    #[test]
    fn zipf_concentrates_mass() {
        let rel = zipf_keys(1024, 1 << 14, 1.2, 11).unwrap();
        let mut freq = vec![0u32; 1025];
        for t in &rel.tuples {
            freq[t.key as usize] += 1;
        }
        let max = *freq.iter().max().unwrap() as usize;
        // The hottest key is far above the uniform expectation of 16.
        assert!(max > rel.len() / 100, "max frequency {max} too flat for z=1.2");
    }

    #[test]
    fn generation_is_deterministic() {
        assert_eq!(primary_keys(512, 5).tuples, primary_keys(512, 5).tuples);
        assert_eq!(foreign_keys(512, 2048, 6).tuples, foreign_keys(512, 2048, 6).tuples);
        assert_eq!(
            zipf_keys(512, 2048, 0.9, 8).unwrap().tuples,
            zipf_keys(512, 2048, 0.9, 8).unwrap().tuples
        );
    }

    #[test]
    fn invalid_skew_is_an_error() {
        assert!(zipf_keys(512, 1024, -1.0, 1).is_err());
    }
}
