//! Random fixtures for tests and local seeding

use rand::Rng;
use rand::seq::SliceRandom;

use crate::currency::SUPPORTED_CURRENCIES;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Random integer in `[min, max]`
pub fn random_int(min: i64, max: i64) -> i64 {
    rand::thread_rng().gen_range(min..=max)
}

/// Random lowercase string of length `n`
pub fn random_string(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

pub fn random_owner() -> String {
    random_string(6)
}

pub fn random_money() -> i64 {
    random_int(0, 1000)
}

pub fn random_currency() -> String {
    SUPPORTED_CURRENCIES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(crate::currency::USD)
        .to_string()
}

pub fn random_email() -> String {
    format!("{}@test.com", random_string(6))
}
