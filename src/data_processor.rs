//! Secret-shares the payload of rows selected by the peer.
//!
//! The data owner encrypts all of its rows under a fresh AES key in counter mode and hands the
//! ciphertext to the peer, which keeps only the rows at its private indexes. Both parties then
//! decrypt the selected rows jointly inside [`AesCircuitCtr`]: the owner contributes the key,
//! the index holder the ciphertext and the counters of the original row positions. Neither
//! party learns the other's secret, and the decrypted rows stay secret-shared.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{Level, debug, instrument};

use crate::{
    aes_ctr::{ExpandedKey, ROUND_KEYS, ctr_encrypt_rows},
    bits::{planes_to_rows_lsb, rows_to_planes_lsb, rows_to_planes_msb_padded},
    block::Block,
    channel::Channel,
    circuit::AesCircuitCtr,
    secret::{self, SecretBitString, Session},
};

/// Errors that can occur while sharing rows.
#[derive(Debug)]
pub enum Error {
    /// There are no rows to process.
    EmptyRows,
    /// The rows have zero bytes.
    ZeroWidth,
    /// No rows were requested.
    ZeroOutputSize,
    /// A row does not have the same width as the first one.
    RaggedRow {
        /// The position of the offending row.
        row: usize,
        /// The width of the first row.
        expected: usize,
        /// The width of the offending row.
        actual: usize,
    },
    /// A requested index does not point into the peer's rows.
    IndexOutOfRange {
        /// The requested index.
        index: i64,
        /// The number of rows of the peer.
        rows: usize,
    },
    /// Both parties disagree on the shape of the rows.
    ShapeMismatch {
        /// This party's view.
        mine: Shape,
        /// The peer's view.
        theirs: Shape,
    },
    /// An error occurred in the secret-sharing runtime.
    Secret(secret::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::EmptyRows => f.write_str("There are no rows to process"),
            Error::ZeroWidth => f.write_str("Rows must not be empty"),
            Error::ZeroOutputSize => f.write_str("At least one row must be selected"),
            Error::RaggedRow {
                row,
                expected,
                actual,
            } => write!(f, "Row {row} has {actual} bytes instead of {expected}"),
            Error::IndexOutOfRange { index, rows } => {
                write!(f, "Index {index} is out of range for {rows} rows")
            }
            Error::ShapeMismatch { mine, theirs } => {
                write!(f, "Shape mismatch: {mine:?} vs {theirs:?}")
            }
            Error::Secret(e) => write!(f, "{e}"),
        }
    }
}

impl From<secret::Error> for Error {
    fn from(e: secret::Error) -> Self {
        Error::Secret(e)
    }
}

/// The publicly agreed shape of a row selection, compared by both parties before any bulk
/// data is exchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    /// The number of rows of the data owner.
    pub rows: usize,
    /// The width of every row in bytes.
    pub width: usize,
    /// The number of selected rows.
    pub output: usize,
}

/// Exchanges both parties' view of the shape and fails if they differ.
pub(crate) async fn agree_on_shape<C: Channel>(
    session: &Session<C>,
    mine: Shape,
) -> Result<(), Error> {
    let theirs = session.exchange("row set shape", &mine).await?;
    if theirs == mine {
        Ok(())
    } else {
        Err(Error::ShapeMismatch { mine, theirs })
    }
}

/// Selected rows, secret-shared between both parties.
///
/// Plane `8 * i + j` holds bit `j` (least significant first) of byte `i` of every row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSharedRowSet {
    bits: SecretBitString,
    width: usize,
}

impl SecretSharedRowSet {
    pub(crate) fn empty<C>(session: &Session<C>, width: usize) -> Result<Self, secret::Error> {
        Ok(Self {
            bits: SecretBitString::from_local_share(session, vec![vec![]; 8 * width], 0)?,
            width,
        })
    }

    /// The width of every row in bytes.
    pub fn width(&self) -> usize {
        self.width
    }

    /// The number of rows.
    pub fn len(&self) -> usize {
        self.bits.batch_size()
    }

    /// Whether the set has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The secret bits of the rows.
    pub fn bits(&self) -> &SecretBitString {
        &self.bits
    }

    /// Reveals the rows to `party`, which receives `Some(rows)`; the other party gets `None`.
    pub async fn open_to_party<C: Channel>(
        &self,
        session: &Session<C>,
        party: usize,
    ) -> Result<Option<Vec<Vec<u8>>>, secret::Error> {
        let planes = self.bits.open_to_party(session, party).await?;
        Ok(planes.map(|planes| planes_to_rows_lsb(&planes, self.len())))
    }
}

/// Secret-shares rows held by one party at indexes held by the other.
///
/// For every call of [`DataProcessor::process_my_data`] on one party, the other party calls
/// [`DataProcessor::process_peers_data`] at the same time.
pub trait DataProcessor {
    /// Shares `output_size` of this party's `rows`, selected by the peer.
    fn process_my_data(
        &self,
        rows: &[Vec<u8>],
        output_size: usize,
    ) -> impl Future<Output = Result<SecretSharedRowSet, Error>>;

    /// Shares the peer's rows at `indexes`, in the order of `indexes`.
    fn process_peers_data(
        &self,
        peer_row_count: usize,
        indexes: &[i64],
        row_width: usize,
    ) -> impl Future<Output = Result<SecretSharedRowSet, Error>>;
}

/// Creates one [`DataProcessor`] per protocol run.
pub trait DataProcessorFactory {
    /// The processor created by this factory.
    type Processor: DataProcessor;

    /// Creates a fresh processor.
    fn create(&self) -> Self::Processor;
}

/// Returns the common width of `rows`.
pub(crate) fn check_rows<R: AsRef<[u8]>>(rows: &[R]) -> Result<usize, Error> {
    let width = rows.first().ok_or(Error::EmptyRows)?.as_ref().len();
    if width == 0 {
        return Err(Error::ZeroWidth);
    }
    for (row, r) in rows.iter().enumerate() {
        if r.as_ref().len() != width {
            return Err(Error::RaggedRow {
                row,
                expected: width,
                actual: r.as_ref().len(),
            });
        }
    }
    Ok(width)
}

fn check_indexes(indexes: &[i64], rows: usize) -> Result<Vec<usize>, Error> {
    if indexes.is_empty() {
        return Err(Error::ZeroOutputSize);
    }
    indexes
        .iter()
        .map(|&index| match usize::try_from(index) {
            Ok(i) if i < rows => Ok(i),
            _ => Err(Error::IndexOutOfRange { index, rows }),
        })
        .collect()
}

/// The counter blocks of the row at position `index`.
pub(crate) fn row_counters(index: u64, width: usize) -> Vec<Block> {
    let blocks = width.div_ceil(Block::BYTES) as u64;
    (0..blocks).map(|j| Block::counter(index * blocks + j)).collect()
}

/// Runs the joint decryption as the party holding the key.
pub(crate) async fn decrypt_as_key_holder<C: Channel>(
    session: &Session<C>,
    circuit: &AesCircuitCtr,
    key: &ExpandedKey,
    width: usize,
    output_size: usize,
) -> Result<SecretSharedRowSet, Error> {
    let padded_bits = Block::BITS * width.div_ceil(Block::BYTES);
    let key_planes = key
        .bits_msb_first()
        .into_iter()
        .map(|bit| vec![bit; output_size])
        .collect();
    let key = SecretBitString::private_input(session, key_planes, output_size).await?;
    let ciphertext = SecretBitString::peer_input(session, padded_bits, output_size).await?;
    let counters = SecretBitString::peer_input(session, padded_bits, output_size).await?;
    finish_decryption(session, circuit, &ciphertext, &key, &counters, width).await
}

/// Runs the joint decryption as the party holding the selected ciphertext rows and the counter
/// blocks of their original positions.
pub(crate) async fn decrypt_as_index_holder<C: Channel>(
    session: &Session<C>,
    circuit: &AesCircuitCtr,
    rows: &[&[u8]],
    counters: &[Vec<Block>],
    width: usize,
) -> Result<SecretSharedRowSet, Error> {
    let output_size = rows.len();
    let padded_bits = Block::BITS * width.div_ceil(Block::BYTES);
    let key = SecretBitString::peer_input(session, ROUND_KEYS * Block::BITS, output_size).await?;
    let ciphertext_planes = rows_to_planes_msb_padded(rows, width);
    let ciphertext =
        SecretBitString::private_input(session, ciphertext_planes, output_size).await?;
    let counter_bits: Vec<Vec<bool>> = counters
        .iter()
        .map(|blocks| blocks.iter().flat_map(Block::bits_msb_first).collect())
        .collect();
    if let Some(bits) = counter_bits.iter().find(|bits| bits.len() != padded_bits) {
        return Err(secret::Error::WidthMismatch {
            expected: padded_bits,
            actual: bits.len(),
        }
        .into());
    }
    let counter_planes = (0..padded_bits)
        .map(|i| counter_bits.iter().map(|bits| bits[i]).collect())
        .collect();
    let counters = SecretBitString::private_input(session, counter_planes, output_size).await?;
    finish_decryption(session, circuit, &ciphertext, &key, &counters, width).await
}

async fn finish_decryption<C: Channel>(
    session: &Session<C>,
    circuit: &AesCircuitCtr,
    ciphertext: &SecretBitString,
    key: &SecretBitString,
    counters: &SecretBitString,
    width: usize,
) -> Result<SecretSharedRowSet, Error> {
    let decrypted = circuit.decrypt(session, ciphertext, key, counters).await?;
    // the circuit yields the most significant bit of each byte first
    let planes = decrypted.planes();
    let reordered = (0..8 * width)
        .map(|i| planes[8 * (i / 8) + (7 - i % 8)].clone())
        .collect();
    Ok(SecretSharedRowSet {
        bits: SecretBitString::from_planes(reordered, decrypted.batch_size())?,
        width,
    })
}

/// A [`DataProcessor`] that decrypts AES-CTR ciphertext inside the secret-sharing runtime.
#[derive(Debug, Clone)]
pub struct AesDataProcessor<C> {
    session: Session<C>,
    circuit: AesCircuitCtr,
}

impl<C> AesDataProcessor<C> {
    /// Creates a processor running in `session`.
    pub fn new(session: Session<C>) -> Self {
        Self {
            session,
            circuit: AesCircuitCtr,
        }
    }
}

impl<C: Channel> DataProcessor for AesDataProcessor<C> {
    #[instrument(level = Level::DEBUG, skip_all, fields(rows = rows.len(), output_size = output_size), err)]
    async fn process_my_data(
        &self,
        rows: &[Vec<u8>],
        output_size: usize,
    ) -> Result<SecretSharedRowSet, Error> {
        let width = check_rows(rows)?;
        if output_size == 0 {
            return Err(Error::ZeroOutputSize);
        }
        let shape = Shape {
            rows: rows.len(),
            width,
            output: output_size,
        };
        agree_on_shape(&self.session, shape).await?;

        let key = ExpandedKey::random();
        let ciphertext = ctr_encrypt_rows(&key, rows, width, 0);
        self.session.send_to_peer("ciphertext", &ciphertext).await?;
        debug!("sent ciphertext of {} rows", rows.len());

        decrypt_as_key_holder(&self.session, &self.circuit, &key, width, output_size).await
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(peer_row_count = peer_row_count, output_size = indexes.len()), err)]
    async fn process_peers_data(
        &self,
        peer_row_count: usize,
        indexes: &[i64],
        row_width: usize,
    ) -> Result<SecretSharedRowSet, Error> {
        if peer_row_count == 0 {
            return Err(Error::EmptyRows);
        }
        if row_width == 0 {
            return Err(Error::ZeroWidth);
        }
        let indexes = check_indexes(indexes, peer_row_count)?;
        let shape = Shape {
            rows: peer_row_count,
            width: row_width,
            output: indexes.len(),
        };
        agree_on_shape(&self.session, shape).await?;

        let session = &self.session;
        let ciphertext: Vec<Vec<u8>> = session
            .recv_vec_from_peer("ciphertext", peer_row_count)
            .await?;
        if check_rows(&ciphertext)? != row_width {
            return Err(Error::RaggedRow {
                row: 0,
                expected: row_width,
                actual: ciphertext[0].len(),
            });
        }
        let selected: Vec<&[u8]> = indexes.iter().map(|&i| ciphertext[i].as_slice()).collect();
        let counters: Vec<Vec<Block>> = indexes
            .iter()
            .map(|&i| row_counters(i as u64, row_width))
            .collect();
        debug!("selected {} of {peer_row_count} rows", selected.len());

        decrypt_as_index_holder(session, &self.circuit, &selected, &counters, row_width).await
    }
}

/// Creates [`AesDataProcessor`]s sharing a session.
#[derive(Debug, Clone)]
pub struct AesDataProcessorFactory<C> {
    session: Session<C>,
}

impl<C> AesDataProcessorFactory<C> {
    /// Creates processors running in `session`.
    pub fn new(session: Session<C>) -> Self {
        Self { session }
    }
}

impl<C: Channel> DataProcessorFactory for AesDataProcessorFactory<C> {
    type Processor = AesDataProcessor<C>;

    fn create(&self) -> AesDataProcessor<C> {
        AesDataProcessor::new(self.session.clone())
    }
}

/// Processors that reveal the rows, for testing only.
pub mod insecure {
    use super::*;

    /// Sends the owner's rows in the clear; the index holder's share is the plaintext of the
    /// selected rows, the owner's share is zero.
    #[derive(Debug, Clone)]
    pub struct DummyDataProcessor<C> {
        session: Session<C>,
    }

    impl<C> DummyDataProcessor<C> {
        /// Creates a processor running in `session`.
        pub fn new(session: Session<C>) -> Self {
            Self { session }
        }
    }

    impl<C: Channel> DataProcessor for DummyDataProcessor<C> {
        async fn process_my_data(
            &self,
            rows: &[Vec<u8>],
            output_size: usize,
        ) -> Result<SecretSharedRowSet, Error> {
            let width = check_rows(rows)?;
            if output_size == 0 {
                return Err(Error::ZeroOutputSize);
            }
            let shape = Shape {
                rows: rows.len(),
                width,
                output: output_size,
            };
            agree_on_shape(&self.session, shape).await?;
            let session = &self.session;
            session.send_to_peer("plaintext rows", &rows).await?;
            let zeros = vec![vec![false; output_size]; 8 * width];
            Ok(SecretSharedRowSet {
                bits: SecretBitString::from_local_share(session, zeros, output_size)?,
                width,
            })
        }

        async fn process_peers_data(
            &self,
            peer_row_count: usize,
            indexes: &[i64],
            row_width: usize,
        ) -> Result<SecretSharedRowSet, Error> {
            if peer_row_count == 0 {
                return Err(Error::EmptyRows);
            }
            let indexes = check_indexes(indexes, peer_row_count)?;
            let shape = Shape {
                rows: peer_row_count,
                width: row_width,
                output: indexes.len(),
            };
            agree_on_shape(&self.session, shape).await?;
            let session = &self.session;
            let rows: Vec<Vec<u8>> = session
                .recv_vec_from_peer("plaintext rows", peer_row_count)
                .await?;
            if check_rows(&rows)? != row_width {
                return Err(Error::RaggedRow {
                    row: 0,
                    expected: row_width,
                    actual: rows[0].len(),
                });
            }
            let selected: Vec<&[u8]> = indexes.iter().map(|&i| rows[i].as_slice()).collect();
            let planes = rows_to_planes_lsb(&selected, row_width);
            Ok(SecretSharedRowSet {
                bits: SecretBitString::from_local_share(session, planes, selected.len())?,
                width: row_width,
            })
        }
    }

    /// Creates [`DummyDataProcessor`]s sharing a session.
    #[derive(Debug, Clone)]
    pub struct DummyDataProcessorFactory<C> {
        session: Session<C>,
    }

    impl<C> DummyDataProcessorFactory<C> {
        /// Creates processors running in `session`.
        pub fn new(session: Session<C>) -> Self {
            Self { session }
        }
    }

    impl<C: Channel> DataProcessorFactory for DummyDataProcessorFactory<C> {
        type Processor = DummyDataProcessor<C>;

        fn create(&self) -> DummyDataProcessor<C> {
            DummyDataProcessor::new(self.session.clone())
        }
    }
}
