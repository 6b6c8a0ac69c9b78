//! Deterministic random-seed derivation
//!
//! A run starts from a single root seed which is split exactly once into
//! independent init/train/eval/decode keys. Keys are move-only: splitting
//! consumes the parent, so the same key cannot be split twice.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ExecutionMode;
use crate::types::{ProcessIndex, Step};

const TAG_SPLIT: u64 = 0x5350_4c49_5400_0000;
const TAG_FOLD: u64 = 0x464f_4c44_0000_0000;
const TAG_FORK: u64 = 0x464f_524b_0000_0000;

/// An opaque 128-bit PRNG key
#[derive(Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrngKey {
    words: [u64; 2],
}

impl PrngKey {
    /// Root key for a run
    pub fn from_seed(seed: u64) -> Self {
        Self {
            words: [seed, seed.rotate_left(32) ^ 0x9e37_79b9_7f4a_7c15],
        }
    }

    /// Raw key words, for logging and provenance
    pub fn words(&self) -> [u64; 2] {
        self.words
    }

    /// Split into `N` independent keys, consuming this one
    pub fn split<const N: usize>(self) -> [PrngKey; N] {
        let mut rng = self.derive_rng(TAG_SPLIT, N as u64);
        std::array::from_fn(|_| PrngKey {
            words: [rng.next_u64(), rng.next_u64()],
        })
    }

    /// Derive a key for `data` (a step or a process index) without consuming this one
    pub fn fold_in(&self, data: u64) -> PrngKey {
        let mut rng = self.derive_rng(TAG_FOLD, data);
        PrngKey {
            words: [rng.next_u64(), rng.next_u64()],
        }
    }

    /// Turn the key into a random generator
    pub fn into_rng(self) -> ChaCha8Rng {
        self.derive_rng(0, 0)
    }

    fn derive_rng(&self, tag: u64, data: u64) -> ChaCha8Rng {
        let mut seed = [0u8; 32];
        seed[..8].copy_from_slice(&self.words[0].to_le_bytes());
        seed[8..16].copy_from_slice(&self.words[1].to_le_bytes());
        seed[16..24].copy_from_slice(&tag.to_le_bytes());
        seed[24..].copy_from_slice(&data.to_le_bytes());
        ChaCha8Rng::from_seed(seed)
    }
}

/// A sub-stream bound to one purpose (train, eval or decode)
#[derive(Debug)]
pub struct SeedStream {
    mode: ExecutionMode,
    base: PrngKey,
}

impl SeedStream {
    /// Bind `key` to this process.
    ///
    /// Sharded execution shares one global stream. Replicated execution fixes a
    /// per-process stream for the whole run.
    pub fn new(key: PrngKey, mode: ExecutionMode, process_index: ProcessIndex) -> Self {
        let base = match mode {
            ExecutionMode::Sharded => key,
            ExecutionMode::Replicated => key.fold_in(process_index as u64),
        };
        Self { mode, base }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Key for one step of this stream
    pub fn key_for_step(&self, step: Step) -> PrngKey {
        self.base.fold_in(step)
    }

    /// Independent child stream, e.g. one per registered eval program
    pub fn fork(&self, index: usize) -> SeedStream {
        let mut rng = self.base.derive_rng(TAG_FORK, index as u64);
        SeedStream {
            mode: self.mode,
            base: PrngKey {
                words: [rng.next_u64(), rng.next_u64()],
            },
        }
    }

    pub fn base_words(&self) -> [u64; 2] {
        self.base.words()
    }
}

/// All keys derived from the root seed of a run
#[derive(Debug)]
pub struct RunSeeds {
    /// Key used to initialize a fresh train state
    pub init: PrngKey,
    pub train: SeedStream,
    pub eval: SeedStream,
    pub decode: SeedStream,
}

impl RunSeeds {
    /// Split the root seed once into init/train/eval/decode
    pub fn derive(root_seed: u64, mode: ExecutionMode, process_index: ProcessIndex) -> Self {
        let [init, train, eval, decode] = PrngKey::from_seed(root_seed).split::<4>();
        let seeds = Self {
            init,
            train: SeedStream::new(train, mode, process_index),
            eval: SeedStream::new(eval, mode, process_index),
            decode: SeedStream::new(decode, mode, process_index),
        };

        info!(
            root_seed,
            ?mode,
            train = ?seeds.train.base_words(),
            eval = ?seeds.eval.base_words(),
            decode = ?seeds.decode.base_words(),
            "Derived run seed streams"
        );

        seeds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_split_is_deterministic() {
        let a = PrngKey::from_seed(7).split::<3>();
        let b = PrngKey::from_seed(7).split::<3>();
        assert_eq!(a, b);
        assert_ne!(a[0], a[1]);
        assert_ne!(a[1], a[2]);
    }

    #[test]
    fn test_different_roots_differ() {
        let a = PrngKey::from_seed(1).split::<2>();
        let b = PrngKey::from_seed(2).split::<2>();
        assert_ne!(a, b);
    }

    #[test]
    fn test_run_seeds_reproducible() {
        let first = RunSeeds::derive(42, ExecutionMode::Sharded, 0);
        let second = RunSeeds::derive(42, ExecutionMode::Sharded, 0);

        assert_eq!(first.init, second.init);
        for step in [0, 1, 17, 1000] {
            assert_eq!(first.train.key_for_step(step), second.train.key_for_step(step));
            assert_eq!(first.eval.key_for_step(step), second.eval.key_for_step(step));
            assert_eq!(first.decode.key_for_step(step), second.decode.key_for_step(step));
        }

        let mut r1 = first.train.key_for_step(3).into_rng();
        let mut r2 = second.train.key_for_step(3).into_rng();
        let x: Vec<f32> = (0..8).map(|_| r1.gen()).collect();
        let y: Vec<f32> = (0..8).map(|_| r2.gen()).collect();
        assert_eq!(x, y);
    }

    #[test]
    fn test_sharded_stream_is_global() {
        let a = RunSeeds::derive(5, ExecutionMode::Sharded, 0);
        let b = RunSeeds::derive(5, ExecutionMode::Sharded, 3);
        assert_eq!(a.train.key_for_step(9), b.train.key_for_step(9));
    }

    #[test]
    fn test_replicated_stream_is_per_process() {
        let a = RunSeeds::derive(5, ExecutionMode::Replicated, 0);
        let b = RunSeeds::derive(5, ExecutionMode::Replicated, 1);
        assert_ne!(a.train.key_for_step(9), b.train.key_for_step(9));
        // init key is shared so every process starts from the same state
        assert_eq!(a.init, b.init);
    }

    #[test]
    fn test_purposes_are_independent() {
        let seeds = RunSeeds::derive(11, ExecutionMode::Sharded, 0);
        assert_ne!(seeds.train.key_for_step(0), seeds.eval.key_for_step(0));
        assert_ne!(seeds.eval.key_for_step(0), seeds.decode.key_for_step(0));
        assert_ne!(seeds.eval.fork(0).key_for_step(0), seeds.eval.fork(1).key_for_step(0));
    }
}
