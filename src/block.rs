//! A 128-bit [`Block`] type, the unit of AES encryption.
//!
//! Operations on [`Block`]s will use SIMD instructions where possible.
use std::ops::{BitXor, BitXorAssign};

use aes::cipher::{self, array::sizes};
use bytemuck::{Pod, Zeroable};
use rand::{Rng, distr::StandardUniform, prelude::Distribution};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use wide::u8x16;

/// A 128-bit block. Uses SIMD operations where available.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, Pod, Zeroable)]
#[repr(transparent)]
pub struct Block(u8x16);

impl Block {
    /// All bits set to 0.
    pub const ZERO: Self = Self(u8x16::ZERO);

    /// 16 bytes in a Block.
    pub const BYTES: usize = 16;
    /// 128 bits in a block.
    pub const BITS: usize = 128;

    /// Create a new block from bytes.
    #[inline]
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(u8x16::new(bytes))
    }

    /// The counter block for the `counter`-th block of a keystream.
    ///
    /// The counter is stored little endian in the 16 bytes of the block.
    #[inline]
    pub const fn counter(counter: u64) -> Self {
        Self::new((counter as u128).to_le_bytes())
    }

    /// The block holding `value` in big endian byte order.
    #[inline]
    pub const fn from_be_u128(value: u128) -> Self {
        Self::new(value.to_be_bytes())
    }

    /// The bytes of the block read as a big endian number.
    #[inline]
    pub fn to_be_u128(&self) -> u128 {
        u128::from_be_bytes(*self.as_bytes())
    }

    /// Bytes of the block.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_array_ref()
    }

    /// Iterator over the bits of the block, most significant bit of the first byte first.
    ///
    /// This is the bit order in which blocks enter the secret-shared AES circuit.
    pub fn bits_msb_first(&self) -> impl Iterator<Item = bool> + use<> {
        let bytes = *self.as_bytes();
        (0..Self::BITS).map(move |i| (bytes[i / 8] >> (7 - i % 8)) & 1 == 1)
    }
}

impl BitXor for Block {
    type Output = Self;

    #[inline]
    fn bitxor(self, rhs: Self) -> Self {
        Self(self.0 ^ rhs.0)
    }
}

impl BitXorAssign for Block {
    #[inline]
    fn bitxor_assign(&mut self, rhs: Self) {
        *self = *self ^ rhs;
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        u128::from(*self).ct_eq(&u128::from(*other)).into()
    }
}

impl Eq for Block {}

impl Distribution<Block> for StandardUniform {
    #[inline]
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Block {
        let mut bytes = [0; 16];
        rng.fill_bytes(&mut bytes);
        Block::new(bytes)
    }
}

impl AsRef<[u8]> for Block {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl From<Block> for cipher::Array<u8, sizes::U16> {
    #[inline]
    fn from(value: Block) -> Self {
        Self(*value.as_bytes())
    }
}

impl From<cipher::Array<u8, sizes::U16>> for Block {
    #[inline]
    fn from(value: cipher::Array<u8, sizes::U16>) -> Self {
        Self::new(value.0)
    }
}

impl From<[u8; 16]> for Block {
    #[inline]
    fn from(value: [u8; 16]) -> Self {
        Self::new(value)
    }
}

impl From<Block> for [u8; 16] {
    fn from(value: Block) -> Self {
        *value.as_bytes()
    }
}

impl From<u128> for Block {
    /// Little endian, like [`Block::counter`].
    #[inline]
    fn from(value: u128) -> Self {
        Self::new(value.to_le_bytes())
    }
}

impl From<Block> for u128 {
    #[inline]
    fn from(value: Block) -> Self {
        u128::from_le_bytes(*value.as_bytes())
    }
}

impl From<[u64; 2]> for Block {
    #[inline]
    fn from(value: [u64; 2]) -> Self {
        bytemuck::must_cast(value)
    }
}
