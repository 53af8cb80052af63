//! Deterministic randomness for tests

use rand::rngs::StdRng;
use rand::SeedableRng;

/// Seed used by [`seeded_rng`]
pub const TEST_SEED: u64 = 0x7D_6A_2D;

/// A `StdRng` seeded with [`TEST_SEED`]
pub fn seeded_rng() -> StdRng {
    seeded_rng_from(TEST_SEED)
}

/// A `StdRng` seeded with `seed`
pub fn seeded_rng_from(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}
