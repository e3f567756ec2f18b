//! AES-128 in counter mode: the key schedule, plain row encryption and the tables shared with the
//! secret-shared decryption circuit.
//!
//! Rows are encrypted with the [aes](`aes`) crate. The key schedule is computed here because the
//! round keys themselves are fed into the secret-shared circuit.

use aes::{
    Aes128,
    cipher::{Array, BlockCipherEncrypt, KeyInit},
};
use serde::{Deserialize, Serialize};

use crate::block::Block;

/// Number of round keys of AES-128, including the cipher key itself.
pub const ROUND_KEYS: usize = 11;

/// The AES reduction polynomial `x^8 + x^4 + x^3 + x + 1` without its top bit.
pub(crate) const REDUCTION: u8 = 0x1b;

/// Multiplication in GF(2^8) modulo the AES polynomial.
pub(crate) const fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0;
    while b != 0 {
        if b & 1 == 1 {
            product ^= a;
        }
        let carry = a & 0x80 != 0;
        a <<= 1;
        if carry {
            a ^= REDUCTION;
        }
        b >>= 1;
    }
    product
}

/// Multiplicative inverse in GF(2^8) as `x^254`, mapping 0 to 0.
pub(crate) const fn gf_inv(x: u8) -> u8 {
    let mut result = 1;
    let mut base = x;
    let mut exp = 254u8;
    while exp != 0 {
        if exp & 1 == 1 {
            result = gf_mul(result, base);
        }
        base = gf_mul(base, base);
        exp >>= 1;
    }
    result
}

/// The affine transformation applied after inversion in the S-box.
pub(crate) const fn affine(b: u8) -> u8 {
    b ^ b.rotate_left(1) ^ b.rotate_left(2) ^ b.rotate_left(3) ^ b.rotate_left(4) ^ 0x63
}

const fn sbox() -> [u8; 256] {
    let mut table = [0; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = affine(gf_inv(i as u8));
        i += 1;
    }
    table
}

/// The AES S-box.
pub const SBOX: [u8; 256] = sbox();

const RCON: [u8; 10] = [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x1b, 0x36];

/// The 11 round keys of an AES-128 key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandedKey([Block; ROUND_KEYS]);

impl ExpandedKey {
    /// Expands a 16-byte AES-128 key.
    pub fn new(key: [u8; 16]) -> Self {
        let mut words = [[0u8; 4]; 4 * ROUND_KEYS];
        for (word, bytes) in words.iter_mut().zip(key.chunks_exact(4)) {
            word.copy_from_slice(bytes);
        }
        for i in 4..words.len() {
            let mut temp = words[i - 1];
            if i % 4 == 0 {
                temp.rotate_left(1);
                temp = temp.map(|b| SBOX[b as usize]);
                temp[0] ^= RCON[i / 4 - 1];
            }
            for (j, byte) in temp.iter().enumerate() {
                words[i][j] = words[i - 4][j] ^ byte;
            }
        }
        let mut round_keys = [Block::ZERO; ROUND_KEYS];
        for (round_key, chunk) in round_keys.iter_mut().zip(words.chunks_exact(4)) {
            let mut bytes = [0; 16];
            for (dst, word) in bytes.chunks_exact_mut(4).zip(chunk) {
                dst.copy_from_slice(word);
            }
            *round_key = Block::new(bytes);
        }
        Self(round_keys)
    }

    /// Expands a fresh random key.
    pub fn random() -> Self {
        Self::new(rand::random())
    }

    /// The original (unexpanded) cipher key.
    pub fn cipher_key(&self) -> [u8; 16] {
        *self.0[0].as_bytes()
    }

    /// All round keys, starting with the cipher key.
    pub fn round_keys(&self) -> &[Block; ROUND_KEYS] {
        &self.0
    }

    /// The bits of all round keys, most significant bit of each byte first.
    pub fn bits_msb_first(&self) -> Vec<bool> {
        self.0.iter().flat_map(Block::bits_msb_first).collect()
    }

    /// Encrypts a single block without the [aes](`aes`) crate, using the expanded round keys.
    pub fn encrypt_block(&self, block: Block) -> Block {
        let mut state = *block.as_bytes();
        add_round_key(&mut state, &self.0[0]);
        for round in 1..ROUND_KEYS {
            for b in state.iter_mut() {
                *b = SBOX[*b as usize];
            }
            state = shift_rows(state);
            if round + 1 < ROUND_KEYS {
                mix_columns(&mut state);
            }
            add_round_key(&mut state, &self.0[round]);
        }
        Block::new(state)
    }
}

fn add_round_key(state: &mut [u8; 16], key: &Block) {
    for (s, k) in state.iter_mut().zip(key.as_bytes()) {
        *s ^= k;
    }
}

/// The state byte that ShiftRows moves to position `i`.
///
/// Row `r` of the column-major state is rotated left by `r`.
pub(crate) const fn shift_rows_source(i: usize) -> usize {
    let (row, col) = (i % 4, i / 4);
    row + 4 * ((col + row) % 4)
}

fn shift_rows(state: [u8; 16]) -> [u8; 16] {
    std::array::from_fn(|i| state[shift_rows_source(i)])
}

fn mix_columns(state: &mut [u8; 16]) {
    for col in state.chunks_exact_mut(4) {
        let a = [col[0], col[1], col[2], col[3]];
        for (r, out) in col.iter_mut().enumerate() {
            *out = gf_mul(a[r], 2)
                ^ gf_mul(a[(r + 1) % 4], 3)
                ^ a[(r + 2) % 4]
                ^ a[(r + 3) % 4];
        }
    }
}

/// Encrypts equally wide rows in counter mode.
///
/// Row `r` (counted from `first_row`) uses the counters `r * blocks_per_row + j` for its
/// `blocks_per_row = ceil(width / 16)` keystream blocks. The keystream of the final block is
/// truncated to the row width.
pub fn ctr_encrypt_rows<R: AsRef<[u8]>>(
    key: &ExpandedKey,
    rows: &[R],
    width: usize,
    first_row: u64,
) -> Vec<Vec<u8>> {
    let blocks_per_row = width.div_ceil(Block::BYTES);
    let aes = Aes128::new(&Array(key.cipher_key()));
    let first_counter = first_row * blocks_per_row as u64;
    let mut keystream: Vec<aes::Block> = (0..(rows.len() * blocks_per_row) as u64)
        .map(|i| Block::counter(first_counter + i).into())
        .collect();
    for chunk in keystream.chunks_mut(AES_PAR_BLOCKS) {
        aes.encrypt_blocks(chunk);
    }
    rows.iter()
        .zip(keystream.chunks(blocks_per_row.max(1)))
        .map(|(row, pad)| {
            row.as_ref()
                .iter()
                .zip(pad.iter().flat_map(|b| b.0))
                .map(|(plain, pad)| plain ^ pad)
                .collect()
        })
        .collect()
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
// https://github.com/RustCrypto/block-ciphers/blob/4da9b802de52a3326fdc74d559caddd57042fed2/aes/src/ni.rs#L43
const AES_PAR_BLOCKS: usize = 9;
#[cfg(target_arch = "aarch64")]
// https://github.com/RustCrypto/block-ciphers/blob/4da9b802de52a3326fdc74d559caddd57042fed2/aes/src/armv8.rs#L32
const AES_PAR_BLOCKS: usize = 21;
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
const AES_PAR_BLOCKS: usize = 4;

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn hex(s: &str) -> [u8; 16] {
        let mut out = [0; 16];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).unwrap();
        }
        out
    }

    #[test]
    fn sbox_entries() {
        assert_eq!(SBOX[0x00], 0x63);
        assert_eq!(SBOX[0x01], 0x7c);
        assert_eq!(SBOX[0x53], 0xed);
        assert_eq!(SBOX[0xff], 0x16);
    }

    #[test]
    fn fips_197_key_expansion() {
        let key = ExpandedKey::new(hex("2b7e151628aed2a6abf7158809cf4f3c"));
        let round_keys = key.round_keys();
        assert_eq!(
            round_keys[1],
            Block::new(hex("a0fafe1788542cb123a339392a6c7605"))
        );
        assert_eq!(
            round_keys[10],
            Block::new(hex("d014f9a8c9ee2589e13f0cc8b6630ca6"))
        );
        assert_eq!(key.cipher_key(), hex("2b7e151628aed2a6abf7158809cf4f3c"));
    }

    #[test]
    fn fips_197_encryption() {
        let key = ExpandedKey::new(hex("2b7e151628aed2a6abf7158809cf4f3c"));
        let ciphertext = key.encrypt_block(Block::new(hex("3243f6a8885a308d313198a2e0370734")));
        assert_eq!(
            ciphertext,
            Block::new(hex("3925841d02dc09fbdc118597196a0b32"))
        );
    }

    #[test]
    fn counter_mode_uses_row_positions() {
        let key = ExpandedKey::random();
        let rows = vec![vec![0u8; 20]; 3];
        let all = ctr_encrypt_rows(&key, &rows, 20, 0);
        let tail = ctr_encrypt_rows(&key, &rows[1..], 20, 1);
        assert_eq!(&all[1..], &tail[..]);
        // zero plaintext exposes the keystream
        let expected = key.encrypt_block(Block::counter(2 * 2 + 1));
        assert_eq!(&all[2][16..], &expected.as_bytes()[..4]);
    }

    proptest! {
        #[test]
        fn software_aes_matches_aes_crate(key: [u8; 16], block: [u8; 16]) {
            let expanded = ExpandedKey::new(key);
            let mut expected = Array(block);
            Aes128::new(&Array(key)).encrypt_block(&mut expected);
            prop_assert_eq!(expanded.encrypt_block(Block::new(block)), Block::from(expected));
        }

        #[test]
        fn counter_mode_is_an_involution(rows in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 37), 1..5)) {
            let key = ExpandedKey::random();
            let encrypted = ctr_encrypt_rows(&key, &rows, 37, 5);
            prop_assert_eq!(ctr_encrypt_rows(&key, &encrypted, 37, 5), rows);
        }
    }
}
