//! Single entry point for seeded randomness.
//!
//! All draws in [`crate::sampler`] flow through [`new_rng`] so that a given
//! seed and a given catalog reproduce the same selection (testable property
//! 3 — MH acceptance is a pure function of `(cur, nxt, ..., rng_draw)`).

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

pub fn new_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}
