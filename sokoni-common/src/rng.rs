//! Random number generation utilities.

use rand_core::impls;
pub use rand_core::{CryptoRng, RngCore, SeedableRng};
use ring::rand::SecureRandom;

/// A succinct trait alias for a Cryptographically Secure PRNG.
pub trait Crng: RngCore + CryptoRng {}

impl<R: RngCore + CryptoRng> Crng for R {}

/// A compatibility wrapper so we can use `ring`'s PRG with `rand` traits.
#[derive(Clone, Debug)]
pub struct SysRng(ring::rand::SystemRandom);

impl SysRng {
    pub fn new() -> Self {
        Self(ring::rand::SystemRandom::new())
    }
}

impl Default for SysRng {
    fn default() -> Self {
        Self::new()
    }
}

/// [`ring::rand::SystemRandom`] is a cryptographically secure PRG.
impl CryptoRng for SysRng {}

impl RngCore for SysRng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        impls::next_u32_via_fill(self)
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        impls::next_u64_via_fill(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill(dest).expect("os rng failed")
    }

    fn try_fill_bytes(
        &mut self,
        dest: &mut [u8],
    ) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// A small, fast, _non-cryptographic_ rng used as a deterministic RNG for
/// tests. Xorshift with a 64-bit state.
#[derive(Clone, Debug)]
pub struct SmallRng(u64);

impl SmallRng {
    pub fn new() -> Self {
        Self(0x5eed_f00d_dead_beef)
    }

    pub fn from_u64(seed: u64) -> Self {
        // Zero is a fixed point of xorshift; remap it.
        if seed == 0 {
            Self::new()
        } else {
            Self(seed)
        }
    }
}

impl Default for SmallRng {
    fn default() -> Self {
        Self::new()
    }
}

/// Only a [`CryptoRng`] in the technical-trait sense; never use outside tests.
#[cfg(any(test, feature = "test-utils"))]
impl CryptoRng for SmallRng {}

impl RngCore for SmallRng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        // xorshift64
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    #[inline]
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        impls::fill_bytes_via_next(self, dest);
    }

    #[inline]
    fn try_fill_bytes(
        &mut self,
        dest: &mut [u8],
    ) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn small_rng_is_deterministic() {
        let mut a = SmallRng::from_u64(7);
        let mut b = SmallRng::from_u64(7);
        for _ in 0..64 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn small_rng_zero_seed_is_remapped() {
        let mut rng = SmallRng::from_u64(0);
        assert_ne!(rng.next_u64(), 0);
    }

    #[test]
    fn sys_rng_fills() {
        let mut rng = SysRng::new();
        let mut buf = [0u8; 32];
        rng.fill_bytes(&mut buf);
        assert_ne!(buf, [0u8; 32]);
    }
}
