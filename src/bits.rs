//! Helpers for moving between bytes, bit planes and packed 64-bit words.

/// Number of bits needed to address `n` distinct positions (`ceil(log2(n))`).
///
/// A single position needs no bits at all.
pub fn index_width(n: usize) -> usize {
    if n <= 1 {
        0
    } else {
        (usize::BITS - (n - 1).leading_zeros()) as usize
    }
}

/// Packs bits into 64-bit words, LSB of the first word first.
pub(crate) fn pack(bits: &[bool]) -> Vec<u64> {
    bits.chunks(64)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u64, |w, (i, &b)| w | ((b as u64) << i))
        })
        .collect()
}

/// Unpacks the first `len` bits of `words`, the inverse of [`pack`].
pub(crate) fn unpack(words: &[u64], len: usize) -> Vec<bool> {
    (0..len).map(|i| (words[i / 64] >> (i % 64)) & 1 == 1).collect()
}

/// The number of 64-bit words needed to pack `len` bits.
pub(crate) fn words_for(len: usize) -> usize {
    len.div_ceil(64)
}

/// Splits equally wide rows into bit planes, bit `j` (LSB first) of byte `i` landing in plane
/// `8 * i + j`.
pub(crate) fn rows_to_planes_lsb(rows: &[&[u8]], width: usize) -> Vec<Vec<bool>> {
    (0..8 * width)
        .map(|plane| {
            rows.iter()
                .map(|row| (row[plane / 8] >> (plane % 8)) & 1 == 1)
                .collect()
        })
        .collect()
}

/// Reassembles rows from LSB-first bit planes, the inverse of [`rows_to_planes_lsb`].
pub(crate) fn planes_to_rows_lsb(planes: &[Vec<bool>], batch: usize) -> Vec<Vec<u8>> {
    (0..batch)
        .map(|row| {
            planes
                .chunks(8)
                .map(|byte| {
                    byte.iter()
                        .enumerate()
                        .fold(0u8, |acc, (j, plane)| acc | ((plane[row] as u8) << j))
                })
                .collect()
        })
        .collect()
}

/// Splits rows into bit planes MSB first, zero-padding each row to a multiple of 16 bytes.
///
/// Bit `7 - j` of byte `i` lands in plane `8 * i + j`, matching the bit order of an AES block.
pub(crate) fn rows_to_planes_msb_padded(rows: &[&[u8]], width: usize) -> Vec<Vec<bool>> {
    let padded = 16 * width.div_ceil(16);
    (0..8 * padded)
        .map(|plane| {
            rows.iter()
                .map(|row| match row.get(plane / 8) {
                    Some(byte) if plane / 8 < width => (byte >> (7 - plane % 8)) & 1 == 1,
                    _ => false,
                })
                .collect()
        })
        .collect()
}
