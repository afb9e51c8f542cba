//! Invertible key expressions shared by the switch predicates.
//!
//! A [`KeyCipher`] is a short sequence of bijective 32-bit operations. The mangler
//! labels dispatch cases with logical keys and makes every unit exit push
//! `encode(key)`; the dispatcher runs `decode` at runtime to recover the case
//! index. Because every step is a bijection on `u32`, the composition is one too,
//! and distinct keys can never collide.

use rand::{rngs::StdRng, Rng};

/// One bijective step on a 32-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherOp {
    /// `v ^ k`
    Xor(u32),
    /// `v + k` (wrapping)
    Add(u32),
    /// `v * k` (wrapping); `k` is odd
    Mul(u32),
    /// `v.rotate_left(r)`, `0 < r < 32`
    RotateLeft(u32),
    /// `!v`
    Not,
}

impl CipherOp {
    /// Applies the step.
    #[must_use]
    pub fn apply(self, value: u32) -> u32 {
        match self {
            CipherOp::Xor(k) => value ^ k,
            CipherOp::Add(k) => value.wrapping_add(k),
            CipherOp::Mul(k) => value.wrapping_mul(k),
            CipherOp::RotateLeft(r) => value.rotate_left(r),
            CipherOp::Not => !value,
        }
    }

    /// Returns the step that undoes this one.
    #[must_use]
    pub fn inverse(self) -> CipherOp {
        match self {
            CipherOp::Xor(k) => CipherOp::Xor(k),
            CipherOp::Add(k) => CipherOp::Add(k.wrapping_neg()),
            CipherOp::Mul(k) => CipherOp::Mul(mul_inverse(k)),
            CipherOp::RotateLeft(r) => CipherOp::RotateLeft((32 - r % 32) % 32),
            CipherOp::Not => CipherOp::Not,
        }
    }

    /// Returns `true` if the step can be expressed with plain IL arithmetic.
    #[must_use]
    pub fn is_il_expressible(self) -> bool {
        !matches!(self, CipherOp::RotateLeft(_))
    }
}

/// Multiplicative inverse of an odd number modulo 2^32 (Newton iteration).
fn mul_inverse(k: u32) -> u32 {
    let mut x = k;
    for _ in 0..5 {
        x = x.wrapping_mul(2u32.wrapping_sub(k.wrapping_mul(x)));
    }
    x
}

/// Which steps a generated cipher may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSet {
    /// Steps expressible as inline IL
    Il,
    /// All steps
    Native,
}

/// An invertible expression over 32-bit integers.
///
/// # Examples
///
/// ```rust
/// use cilvirt::virtualization::{CipherOp, KeyCipher};
///
/// let cipher = KeyCipher::new(vec![CipherOp::Xor(0x5a5a), CipherOp::Mul(7), CipherOp::Not]);
/// for key in 0..16 {
///     assert_eq!(cipher.decode(cipher.encode(key)), key);
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCipher {
    ops: Vec<CipherOp>,
}

impl KeyCipher {
    /// Creates a cipher applying `ops` in order when encoding.
    ///
    /// Even multipliers are made odd so the cipher stays bijective.
    #[must_use]
    pub fn new(ops: Vec<CipherOp>) -> Self {
        let ops = ops
            .into_iter()
            .map(|op| match op {
                CipherOp::Mul(k) => CipherOp::Mul(k | 1),
                other => other,
            })
            .collect();
        KeyCipher { ops }
    }

    /// Encoding steps, in application order.
    #[must_use]
    pub fn ops(&self) -> &[CipherOp] {
        &self.ops
    }

    /// Decoding steps, in application order.
    #[must_use]
    pub fn decode_ops(&self) -> Vec<CipherOp> {
        self.ops.iter().rev().map(|op| op.inverse()).collect()
    }

    /// Maps a logical key to the value a unit exit pushes.
    #[must_use]
    pub fn encode(&self, key: u32) -> u32 {
        self.ops.iter().fold(key, |v, op| op.apply(v))
    }

    /// Maps a pushed value back to its logical key.
    #[must_use]
    pub fn decode(&self, value: u32) -> u32 {
        self.decode_ops().into_iter().fold(value, |v, op| op.apply(v))
    }
}

/// Source of key ciphers for switch predicates.
///
/// Shared read-only by every method of a module, hence `Send + Sync`. All
/// randomness comes from the caller's per-method generator.
pub trait DynCipherService: Send + Sync {
    /// Generates a fresh cipher restricted to `ops`.
    fn generate(&self, rng: &mut StdRng, ops: OpSet) -> KeyCipher;
}

/// Default cipher service: two to four random steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynCipher;

impl DynCipherService for DynCipher {
    fn generate(&self, rng: &mut StdRng, ops: OpSet) -> KeyCipher {
        let kinds = match ops {
            OpSet::Il => 4,
            OpSet::Native => 5,
        };
        let len = rng.random_range(2..=4);
        let mut steps = Vec::with_capacity(len);
        while steps.len() < len {
            let step = match rng.random_range(0..kinds) {
                0 => CipherOp::Xor(rng.random()),
                1 => CipherOp::Add(rng.random()),
                2 => CipherOp::Mul(rng.random::<u32>() | 1),
                3 => CipherOp::Not,
                _ => CipherOp::RotateLeft(rng.random_range(1..32)),
            };
            // two consecutive nots cancel out
            if step == CipherOp::Not && steps.last() == Some(&CipherOp::Not) {
                continue;
            }
            steps.push(step);
        }
        KeyCipher::new(steps)
    }
}
