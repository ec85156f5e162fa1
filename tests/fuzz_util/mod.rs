#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, Copy)]
pub struct FuzzParams {
    pub seed: u64,
    pub steps: usize,
    pub key_space: u64,
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse::<u64>().ok()
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse::<usize>().ok()
}

fn mix_seed(mut seed: u64, tag: &str) -> u64 {
    for (i, b) in tag.as_bytes().iter().enumerate() {
        seed ^= (*b as u64) << ((i % 8) * 8);
        seed = seed.rotate_left(13).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    }
    seed
}

/// Per-test parameters, overridable with `ROWCACHE_FUZZ_SEED`,
/// `ROWCACHE_FUZZ_STEPS` and `ROWCACHE_FUZZ_KEY_SPACE`.
pub fn params(test_tag: &str, default_steps: usize, default_key_space: u64) -> FuzzParams {
    let base_seed = env_u64("ROWCACHE_FUZZ_SEED").unwrap_or(0x5EED_CAFE_F00D_0001);
    FuzzParams {
        seed: mix_seed(base_seed, test_tag),
        steps: env_usize("ROWCACHE_FUZZ_STEPS").unwrap_or(default_steps),
        key_space: env_u64("ROWCACHE_FUZZ_KEY_SPACE")
            .unwrap_or(default_key_space)
            .max(1),
    }
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Random key bytes: either an encoded integer or a short string.
pub fn choose_key(rng: &mut StdRng, key_space: u64) -> Vec<u8> {
    let n = rng.gen_range(0..key_space);
    if rng.gen_bool(0.5) {
        (n as i64).to_be_bytes().to_vec()
    } else {
        format!("key-{n}").into_bytes()
    }
}

/// Random value payload of 0..=max_len bytes.
pub fn choose_value(rng: &mut StdRng, max_len: usize) -> Vec<u8> {
    let len = rng.gen_range(0..=max_len);
    (0..len).map(|_| rng.gen::<u8>()).collect()
}
