use crate::frame::{ARB_ID_MAX, MAX_DATA_LEN};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaChaRng;

/// Deterministic random source for the `random` and `mutate` fuzz modes.
/// Seeded once per run; every generated frame is a pure function of the seed
/// and how many draws happened before it, which is what makes runs
/// reproducible from the recorded seed.
#[derive(Debug)]
pub struct Mutator<R: Rng> {
    rng: R,
}

impl Mutator<ChaChaRng> {
    /// Creates a mutator from the run's recorded seed.
    #[must_use]
    pub fn from_seed(seed: u64) -> Self {
        Self::new(ChaChaRng::seed_from_u64(seed))
    }
}

impl<R: Rng> Mutator<R> {
    /// Creates a new Mutator
    pub fn new(rng: R) -> Mutator<R> {
        Mutator { rng }
    }

    /// Draws an arbitration ID uniformly from `min..=max` (clamped to the
    /// 29 bit range).
    pub fn random_id(&mut self, min: u32, max: u32) -> u32 {
        let max = max.min(ARB_ID_MAX);
        let min = min.min(max);
        self.rng.random_range(min..=max)
    }

    /// Draws a payload with a uniform length from `min_len..=max_len`
    /// (clamped to 8) and uniform byte values.
    pub fn random_payload(&mut self, min_len: usize, max_len: usize) -> Vec<u8> {
        let max_len = max_len.min(MAX_DATA_LEN);
        let min_len = min_len.min(max_len);
        let len = self.rng.random_range(min_len..=max_len);
        (0..len).map(|_| self.rng.random::<u8>()).collect()
    }

    /// Returns a value between min and max
    pub fn gen_range(&mut self, min: usize, max: usize) -> usize {
        self.rng.random_range(min..max)
    }

    /// Returns a boolean value indicating whether or not the chance event occurred
    pub fn gen_chance(&mut self, chance_percentage: f64) -> bool {
        if chance_percentage <= 0.0 {
            false
        } else if chance_percentage >= 1.0 {
            true
        } else {
            self.rng.random_bool(chance_percentage)
        }
    }

    /// Direct access to the underlying generator, used to randomize the free
    /// nibbles of a [`crate::mask::NibbleMask`].
    pub fn rng(&mut self) -> &mut R {
        &mut self.rng
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Mutator::from_seed(0xC0FFEE);
        let mut b = Mutator::from_seed(0xC0FFEE);
        for _ in 0..256 {
            assert_eq!(a.random_id(0, 0x7FF), b.random_id(0, 0x7FF));
            assert_eq!(a.random_payload(0, 8), b.random_payload(0, 8));
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Mutator::from_seed(1);
        let mut b = Mutator::from_seed(2);
        let a_seq: Vec<_> = (0..64).map(|_| a.random_id(0, ARB_ID_MAX)).collect();
        let b_seq: Vec<_> = (0..64).map(|_| b.random_id(0, ARB_ID_MAX)).collect();
        assert_ne!(a_seq, b_seq);
    }

    #[test]
    fn payload_respects_length_bounds() {
        let mut m = Mutator::from_seed(7);
        for _ in 0..128 {
            let p = m.random_payload(2, 5);
            assert!((2..=5).contains(&p.len()));
        }
        // bounds above the CAN limit are clamped
        let p = m.random_payload(12, 99);
        assert_eq!(p.len(), 8);
    }

    #[test]
    fn chance_edges_are_deterministic() {
        let mut m = Mutator::from_seed(0);
        assert!(!m.gen_chance(0.0));
        assert!(m.gen_chance(1.0));
    }
}
