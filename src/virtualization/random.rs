use rand::{rngs::StdRng, SeedableRng};
use sha1::{Digest, Sha1};

use crate::cil::Token;

/// Derives independent, reproducible random generators per method.
///
/// Each method's generator is seeded from SHA-1 over the module seed, the
/// protection id and the method token. The output for a method therefore does
/// not depend on which worker thread processes it or in which order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomSource {
    seed: u64,
}

impl RandomSource {
    /// Creates a source from the module-wide seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        RandomSource { seed }
    }

    /// Returns the generator for `method` under protection `id`.
    #[must_use]
    pub fn for_method(&self, id: &str, method: Token) -> StdRng {
        let mut hasher = Sha1::new();
        hasher.update(self.seed.to_le_bytes());
        hasher.update(id.as_bytes());
        hasher.update(method.to_le_bytes());
        let digest = hasher.finalize();

        let mut seed = [0u8; 32];
        for (i, byte) in seed.iter_mut().enumerate() {
            *byte = digest[i % digest.len()] ^ (i as u8);
        }
        StdRng::from_seed(seed)
    }
}
