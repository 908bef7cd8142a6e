use log::debug;
use rand::Rng;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MutatorError {
    #[error("iteration {iteration} exceeds available values")]
    Exhausted { iteration: u64 },
}

/// Produces one fuzzed candidate from a seed per call.
///
/// # Type Parameters
/// * `R`: The random number generator used for mutation decisions.
pub trait Mutator<R: Rng + ?Sized> {
    fn name(&self) -> &'static str;

    /// Returns the next candidate derived from `seed`.
    fn mutate(&mut self, seed: &[u8], rng: &mut R) -> Result<Vec<u8>, MutatorError>;
}

/// Randomly selects a single byte and adds a small random value to it.
///
/// An empty seed is first extended with a single zero byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlipSingleByteMutator;

impl<R: Rng + ?Sized> Mutator<R> for FlipSingleByteMutator {
    fn name(&self) -> &'static str {
        "flip-byte"
    }

    fn mutate(&mut self, seed: &[u8], rng: &mut R) -> Result<Vec<u8>, MutatorError> {
        let mut bytes = seed.to_vec();
        if bytes.is_empty() {
            bytes.push(0);
        }
        let delta = rng.random_range(1u8..=15u8);
        let index = rng.random_range(0..bytes.len());
        bytes[index] = bytes[index].wrapping_add(delta);
        Ok(bytes)
    }
}

/// Sweeps every value 0..=255 through every byte position in turn.
///
/// Iteration `t` sets position `t / 256` to `t % 256`. Positions are either
/// every offset of the seed or the union of configured inclusive ranges.
#[derive(Debug, Clone, Default)]
pub struct WaveMutator {
    ranges: Option<Vec<(usize, usize)>>,
    tries: u64,
}

impl WaveMutator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ranges(ranges: Vec<(usize, usize)>) -> Self {
        Self {
            ranges: Some(ranges),
            tries: 0,
        }
    }

    pub fn tries(&self) -> u64 {
        self.tries
    }

    /// Byte offset swept in `slot`, or `None` once every position of a
    /// `len`-byte seed has been used. Ranges are clipped to the seed.
    fn position(&self, slot: u64, len: usize) -> Option<usize> {
        let Some(ranges) = &self.ranges else {
            return usize::try_from(slot).ok().filter(|&p| p < len);
        };
        let mut remaining = slot;
        for &(start, end) in ranges {
            if start >= len || end < start {
                continue;
            }
            let end = end.min(len - 1);
            let width = (end - start) as u64 + 1;
            if remaining < width {
                return Some(start + remaining as usize);
            }
            remaining -= width;
        }
        None
    }
}

impl<R: Rng + ?Sized> Mutator<R> for WaveMutator {
    fn name(&self) -> &'static str {
        "wave"
    }

    fn mutate(&mut self, seed: &[u8], _rng: &mut R) -> Result<Vec<u8>, MutatorError> {
        let iteration = self.tries;
        let Some(position) = self.position(iteration / 256, seed.len()) else {
            return Err(MutatorError::Exhausted { iteration });
        };
        let value = (iteration % 256) as u8;

        let mut bytes = seed.to_vec();
        bytes[position] = value;
        self.tries += 1;
        debug!("wave: set byte 0x{position:02x} to 0x{value:02x}");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn flip_single_byte_changes_exactly_one_byte() {
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);
        let seed = vec![0x41u8; 16];
        for _ in 0..100 {
            let out = FlipSingleByteMutator.mutate(&seed, &mut rng).unwrap();
            assert_eq!(out.len(), seed.len());
            let changed = out.iter().zip(&seed).filter(|(a, b)| a != b).count();
            assert_eq!(changed, 1);
        }
    }

    #[test]
    fn flip_single_byte_grows_empty_seed() {
        let mut rng = ChaCha8Rng::from_seed([1u8; 32]);
        let out = FlipSingleByteMutator.mutate(&[], &mut rng).unwrap();
        assert_eq!(out.len(), 1);
        assert_ne!(out[0], 0);
    }

    #[test]
    fn wave_sweeps_positions_in_order() {
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);
        let mut wave = WaveMutator::new();
        let seed = [0xAAu8, 0xBB];

        assert_eq!(wave.mutate(&seed, &mut rng).unwrap(), vec![0x00, 0xBB]);
        assert_eq!(wave.mutate(&seed, &mut rng).unwrap(), vec![0x01, 0xBB]);
        for _ in 2..256 {
            wave.mutate(&seed, &mut rng).unwrap();
        }
        assert_eq!(wave.mutate(&seed, &mut rng).unwrap(), vec![0xAA, 0x00]);
        assert_eq!(wave.tries(), 257);
    }

    #[test]
    fn wave_is_exhausted_after_last_position() {
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);
        let mut wave = WaveMutator::new();
        let seed = [0u8];
        for _ in 0..256 {
            wave.mutate(&seed, &mut rng).unwrap();
        }
        assert_eq!(
            wave.mutate(&seed, &mut rng),
            Err(MutatorError::Exhausted { iteration: 256 })
        );
    }

    #[test]
    fn wave_honours_range_list() {
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);
        let mut wave = WaveMutator::with_ranges(vec![(2, 2), (5, 6), (40, 50)]);
        let seed = [0xFFu8; 8];
        let positions: Vec<_> = (0..4).map(|slot| wave.position(slot, seed.len())).collect();
        assert_eq!(positions, vec![Some(2), Some(5), Some(6), None]);

        let first = wave.mutate(&seed, &mut rng).unwrap();
        assert_eq!(first[2], 0);
        assert_eq!(first.iter().filter(|b| **b != 0xFF).count(), 1);
    }

    #[test]
    fn wave_clips_oversized_ranges_to_the_seed() {
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);
        let mut wave = WaveMutator::with_ranges(vec![(0, 4), (10, usize::MAX)]);
        let seed = [0x11u8; 16];
        assert_eq!(wave.position(4, seed.len()), Some(4));
        assert_eq!(wave.position(5, seed.len()), Some(10));
        assert_eq!(wave.position(10, seed.len()), Some(15));
        assert_eq!(wave.position(11, seed.len()), None);
        assert_eq!(wave.position(u64::MAX / 256, seed.len()), None);

        for _ in 0..11 * 256 {
            wave.mutate(&seed, &mut rng).unwrap();
        }
        assert_eq!(
            wave.mutate(&seed, &mut rng),
            Err(MutatorError::Exhausted { iteration: 11 * 256 })
        );
    }

    #[test]
    fn wave_without_ranges_covers_a_large_seed_lazily() {
        let wave = WaveMutator::new();
        let len = 8 * 1024 * 1024;
        assert_eq!(wave.position(len as u64 - 1, len), Some(len - 1));
        assert_eq!(wave.position(len as u64, len), None);
    }
}
