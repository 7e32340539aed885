//! Randomness for account-number suffixes.
//!
//! RULE: Components never call a platform RNG directly.
//! Suffixes are drawn through a `SuffixSource` so tests can pin the stream
//! (and force collisions) with a seeded generator.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use std::sync::Mutex;

/// Characters an account-number suffix is drawn from. Excludes 0/O and 1/I
/// so numbers survive being read aloud.
const SUFFIX_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";
pub const SUFFIX_LEN: usize = 8;

pub trait SuffixSource: Send + Sync {
    /// Draw one `SUFFIX_LEN`-character suffix.
    fn next_suffix(&self) -> String;
}

fn draw<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

/// Production source backed by the thread-local OS-seeded generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngSuffixes;

impl SuffixSource for ThreadRngSuffixes {
    fn next_suffix(&self) -> String {
        draw(&mut rand::thread_rng())
    }
}

/// Deterministic source for tests. Two sources with the same seed yield the
/// same sequence of suffixes.
pub struct SeededSuffixes {
    inner: Mutex<Pcg64Mcg>,
}

impl SeededSuffixes {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Mutex::new(Pcg64Mcg::seed_from_u64(seed)),
        }
    }
}

impl SuffixSource for SeededSuffixes {
    fn next_suffix(&self) -> String {
        let mut rng = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        draw(&mut *rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_sources_repeat() {
        let a = SeededSuffixes::new(7);
        let b = SeededSuffixes::new(7);
        for _ in 0..5 {
            assert_eq!(a.next_suffix(), b.next_suffix());
        }
    }

    #[test]
    fn suffix_uses_alphabet() {
        let s = ThreadRngSuffixes.next_suffix();
        assert_eq!(s.len(), SUFFIX_LEN);
        assert!(s.bytes().all(|b| SUFFIX_ALPHABET.contains(&b)));
    }
}
