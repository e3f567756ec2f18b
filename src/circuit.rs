//! AES-128 in counter mode as a boolean circuit over secret-shared bits.
//!
//! The S-box computes the inverse in GF(2^8) as `x^254` with four multiplications, squaring is
//! linear and therefore free. All S-boxes of a round are evaluated together, so that a round
//! costs four rounds of communication regardless of the number of blocks and rows.

use tracing::{Level, instrument};

use crate::{
    aes_ctr::{ROUND_KEYS, affine, gf_mul, shift_rows_source},
    block::Block,
    channel::Channel,
    secret::{Error, SecretBit, SecretBitString, Session},
};

/// A secret byte, least significant bit first.
type Byte = [SecretBit; 8];

/// Images of the basis `1 << i` under squaring.
const SQUARES: [u8; 8] = {
    let mut images = [0; 8];
    let mut i = 0;
    while i < 8 {
        images[i] = gf_mul(1 << i, 1 << i);
        i += 1;
    }
    images
};

/// Images of the basis `1 << i` under the linear part of the S-box affine map.
const AFFINE_LINEAR: [u8; 8] = {
    let mut images = [0; 8];
    let mut i = 0;
    while i < 8 {
        images[i] = affine(1 << i) ^ affine(0);
        i += 1;
    }
    images
};

/// Decrypts AES-128 CTR ciphertexts inside the secret-sharing runtime.
///
/// All inputs use the bit order of [`Block::bits_msb_first`]: 128 planes per block, the most
/// significant bit of each byte first.
#[derive(Debug, Clone, Copy, Default)]
pub struct AesCircuitCtr;

impl AesCircuitCtr {
    /// Decrypts `ciphertext` (a multiple of 128 planes) with the expanded `key` (1408 planes)
    /// and one counter block per ciphertext block.
    #[instrument(level = Level::DEBUG, skip_all, fields(planes = ciphertext.width(), batch = ciphertext.batch_size()), err)]
    pub async fn decrypt<C: Channel>(
        &self,
        session: &Session<C>,
        ciphertext: &SecretBitString,
        key: &SecretBitString,
        counters: &SecretBitString,
    ) -> Result<SecretBitString, Error> {
        let padded = Block::BITS * ciphertext.width().div_ceil(Block::BITS);
        if ciphertext.width() != padded {
            return Err(Error::WidthMismatch {
                expected: padded,
                actual: ciphertext.width(),
            });
        }
        if key.width() != ROUND_KEYS * Block::BITS {
            return Err(Error::WidthMismatch {
                expected: ROUND_KEYS * Block::BITS,
                actual: key.width(),
            });
        }
        if counters.width() != ciphertext.width() {
            return Err(Error::WidthMismatch {
                expected: ciphertext.width(),
                actual: counters.width(),
            });
        }
        for batch in [key.batch_size(), counters.batch_size()] {
            if batch != ciphertext.batch_size() {
                return Err(Error::BatchMismatch {
                    expected: ciphertext.batch_size(),
                    actual: batch,
                });
            }
        }
        let keystream = encrypt(session, key, counters).await?;
        ciphertext.xor(&keystream)
    }
}

async fn encrypt<C: Channel>(
    session: &Session<C>,
    key: &SecretBitString,
    counters: &SecretBitString,
) -> Result<SecretBitString, Error> {
    let round_keys = to_bytes(key);
    let mut state = to_bytes(counters);
    add_round_key(&mut state, &round_keys[..16]);
    for round in 1..ROUND_KEYS {
        state = sub_bytes(session, &state).await?;
        state = state
            .chunks_exact(16)
            .flat_map(|block| (0..16).map(move |i| block[shift_rows_source(i)].clone()))
            .collect();
        if round + 1 < ROUND_KEYS {
            mix_columns(&mut state);
        }
        add_round_key(&mut state, &round_keys[16 * round..16 * (round + 1)]);
    }
    let planes = state
        .into_iter()
        .flat_map(|byte| byte.into_iter().rev())
        .collect();
    SecretBitString::from_planes(planes, counters.batch_size())
}

fn to_bytes(bits: &SecretBitString) -> Vec<Byte> {
    bits.planes()
        .chunks_exact(8)
        .map(|msb_first| std::array::from_fn(|j| msb_first[7 - j].clone()))
        .collect()
}

fn add_round_key(state: &mut [Byte], round_key: &[Byte]) {
    for block in state.chunks_exact_mut(16) {
        for (byte, key) in block.iter_mut().zip(round_key) {
            for (bit, key) in byte.iter_mut().zip(key) {
                *bit ^= key;
            }
        }
    }
}

fn xor(a: &Byte, b: &Byte) -> Byte {
    std::array::from_fn(|i| &a[i] ^ &b[i])
}

/// Multiplication by `x`, reducing with the AES polynomial.
fn xtime(b: &Byte) -> Byte {
    [
        b[7].clone(),
        &b[0] ^ &b[7],
        b[1].clone(),
        &b[2] ^ &b[7],
        &b[3] ^ &b[7],
        b[4].clone(),
        b[5].clone(),
        b[6].clone(),
    ]
}

fn mix_columns(state: &mut [Byte]) {
    for col in state.chunks_exact_mut(4) {
        let doubled: Vec<Byte> = col.iter().map(xtime).collect();
        let mixed: Vec<Byte> = (0..4)
            .map(|r| {
                let (r1, r2, r3) = ((r + 1) % 4, (r + 2) % 4, (r + 3) % 4);
                let out = xor(&doubled[r], &doubled[r1]);
                let out = xor(&out, &col[r1]);
                let out = xor(&out, &col[r2]);
                xor(&out, &col[r3])
            })
            .collect();
        for (byte, mixed) in col.iter_mut().zip(mixed) {
            *byte = mixed;
        }
    }
}

/// Applies a GF(2)-linear map given by the images of the basis vectors.
fn linear(b: &Byte, images: &[u8; 8]) -> Byte {
    std::array::from_fn(|j| {
        let mut out = b[0].zeros_like();
        for (bit, image) in b.iter().zip(images) {
            if (image >> j) & 1 == 1 {
                out ^= bit;
            }
        }
        out
    })
}

fn square_n(xs: &[Byte], n: usize) -> Vec<Byte> {
    let mut xs = xs.to_vec();
    for _ in 0..n {
        xs = xs.iter().map(|x| linear(x, &SQUARES)).collect();
    }
    xs
}

async fn sub_bytes<C: Channel>(session: &Session<C>, x: &[Byte]) -> Result<Vec<Byte>, Error> {
    let x2 = square_n(x, 1);
    let x3 = gf_mul_many(session, &x2, x).await?;
    let x12 = square_n(&x3, 2);
    let x15 = gf_mul_many(session, &x12, &x3).await?;
    let x240 = square_n(&x15, 4);
    let x252 = gf_mul_many(session, &x240, &x12).await?;
    let x254 = gf_mul_many(session, &x252, &x2).await?;
    let constant = affine(0);
    Ok(x254
        .iter()
        .map(|b| {
            let mut s = linear(b, &AFFINE_LINEAR);
            for (i, bit) in s.iter_mut().enumerate() {
                *bit = bit.xor_public((constant >> i) & 1 == 1);
            }
            s
        })
        .collect())
}

/// Multiplies pairs of bytes in GF(2^8), all in one round of AND gates.
async fn gf_mul_many<C: Channel>(
    session: &Session<C>,
    xs: &[Byte],
    ys: &[Byte],
) -> Result<Vec<Byte>, Error> {
    let pairs: Vec<(&SecretBit, &SecretBit)> = xs
        .iter()
        .zip(ys)
        .flat_map(|(x, y)| (0..64).map(move |k| (&x[k / 8], &y[k % 8])))
        .collect();
    let products = session.and_many(&pairs).await?;
    Ok(products.chunks_exact(64).map(reduce).collect())
}

/// Sums the partial products `x_i & y_j` (at index `8 * i + j`) and reduces modulo the AES
/// polynomial.
fn reduce(products: &[SecretBit]) -> Byte {
    let mut c: Vec<SecretBit> = (0..15).map(|_| products[0].zeros_like()).collect();
    for (k, p) in products.iter().enumerate() {
        c[k / 8 + k % 8] ^= p;
    }
    // x^8 = x^4 + x^3 + x + 1
    for k in (8..15).rev() {
        let high = c[k].clone();
        for t in [4, 5, 7, 8] {
            c[k - t] ^= &high;
        }
    }
    std::array::from_fn(|i| c[i].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aes_ctr::{ExpandedKey, SBOX, ctr_encrypt_rows},
        bits::rows_to_planes_msb_padded,
        secret::{deal_triples, simulated_sessions},
    };

    #[test]
    fn linear_tables() {
        assert_eq!(SQUARES, [0x01, 0x04, 0x10, 0x40, 0x1b, 0x6c, 0xab, 0x9a]);
        assert_eq!(AFFINE_LINEAR[0], 0b0001_1111);
        assert_eq!(AFFINE_LINEAR[7], 0b1000_1111);
    }

    #[tokio::test]
    async fn sub_bytes_matches_sbox() {
        let inputs: Vec<u8> = (0..=255).collect();
        let (s0, s1, dealer) = simulated_sessions();
        let planes: Vec<Vec<bool>> = (0..8)
            .map(|bit| inputs.iter().map(|x| (x >> (7 - bit)) & 1 == 1).collect())
            .collect();
        let party0 = async {
            let x = SecretBitString::private_input(&s0, planes.clone(), 256).await?;
            let out = sub_bytes(&s0, &to_bytes(&x)).await?;
            let out = SecretBitString::from_planes(out[0].iter().rev().cloned().collect(), 256)?;
            let opened = out.open_to_both(&s0).await?;
            s0.finish().await?;
            Ok::<_, Error>(opened)
        };
        let party1 = async {
            let x = SecretBitString::peer_input(&s1, 8, 256).await?;
            let out = sub_bytes(&s1, &to_bytes(&x)).await?;
            let out = SecretBitString::from_planes(out[0].iter().rev().cloned().collect(), 256)?;
            let opened = out.open_to_both(&s1).await?;
            s1.finish().await?;
            Ok::<_, Error>(opened)
        };
        let (r0, r1, d) = tokio::join!(party0, party1, deal_triples(&dealer, [0, 1]));
        d.unwrap();
        r1.unwrap();
        let opened = r0.unwrap();
        for (row, x) in inputs.iter().enumerate() {
            let byte = (0..8).fold(0u8, |acc, bit| acc | ((opened[bit][row] as u8) << (7 - bit)));
            assert_eq!(byte, SBOX[*x as usize], "S-box of {x:#04x}");
        }
    }

    #[tokio::test]
    async fn decrypts_like_the_aes_crate() {
        let key = ExpandedKey::random();
        let plaintext = vec![b"sixteen byte row".to_vec(), b"another row, two".to_vec()];
        let ciphertext = ctr_encrypt_rows(&key, &plaintext, 16, 0);
        let counters: Vec<Vec<bool>> = (0..128)
            .map(|i| {
                (0..2u64)
                    .map(|row| Block::counter(row).bits_msb_first().nth(i) == Some(true))
                    .collect()
            })
            .collect();
        let rows: Vec<&[u8]> = ciphertext.iter().map(Vec::as_slice).collect();
        let ct_planes = rows_to_planes_msb_padded(&rows, 16);
        let key_planes: Vec<Vec<bool>> = key
            .bits_msb_first()
            .into_iter()
            .map(|bit| vec![bit; 2])
            .collect();

        let (s0, s1, dealer) = simulated_sessions();
        let party0 = async {
            let key = SecretBitString::private_input(&s0, key_planes, 2).await?;
            let ct = SecretBitString::peer_input(&s0, 128, 2).await?;
            let counters = SecretBitString::peer_input(&s0, 128, 2).await?;
            let plain = AesCircuitCtr.decrypt(&s0, &ct, &key, &counters).await?;
            plain.open_to_party(&s0, 1).await?;
            s0.finish().await
        };
        let party1 = async {
            let key = SecretBitString::peer_input(&s1, ROUND_KEYS * 128, 2).await?;
            let ct = SecretBitString::private_input(&s1, ct_planes, 2).await?;
            let counters = SecretBitString::private_input(&s1, counters, 2).await?;
            let plain = AesCircuitCtr.decrypt(&s1, &ct, &key, &counters).await?;
            let opened = plain.open_to_party(&s1, 1).await?;
            s1.finish().await?;
            Ok::<_, Error>(opened)
        };
        let (r0, r1, d) = tokio::join!(party0, party1, deal_triples(&dealer, [0, 1]));
        d.unwrap();
        r0.unwrap();
        let opened = r1.unwrap().unwrap();
        for (row, expected) in plaintext.iter().enumerate() {
            let decrypted: Vec<u8> = opened
                .chunks(8)
                .map(|byte| {
                    byte.iter()
                        .fold(0u8, |acc, plane| (acc << 1) | plane[row] as u8)
                })
                .collect();
            assert_eq!(&decrypted, expected);
        }
    }

    #[tokio::test]
    async fn rejects_unpadded_ciphertext() {
        let (s0, _s1, _dealer) = simulated_sessions();
        let bits = |width| {
            SecretBitString::from_local_share(&s0, vec![vec![false]; width], 1).unwrap()
        };
        let err = AesCircuitCtr
            .decrypt(&s0, &bits(100), &bits(ROUND_KEYS * 128), &bits(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::WidthMismatch {
                expected: 128,
                actual: 100
            }
        ));
    }
}
