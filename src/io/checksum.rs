use std::hash::Hasher;

use siphasher::sip128::{Hasher128, SipHasher13};

/// Streaming 128-bit SipHash. Fast, non-cryptographic, stable across
/// machines of the same endianness.
pub struct Hash128 {
    hasher: SipHasher13,
}

impl Hash128 {
    pub fn new() -> Self {
        Self { hasher: SipHasher13::new() }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.write(bytes);
    }

    pub fn finish(&self) -> u128 {
        self.hasher.finish128().as_u128()
    }
}

impl Default for Hash128 {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot 128-bit hash of a byte slice.
pub fn siphash128(data: &[u8]) -> u128 {
    let mut h = Hash128::new();
    h.update(data);
    h.finish()
}

/// The two 64-bit halves of a 128-bit hash.
pub fn split128(h: u128) -> (u64, u64) {
    ((h >> 64) as u64, h as u64)
}
