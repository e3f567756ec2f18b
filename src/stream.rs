//! Streaming encryption of large row sets, ahead of the joint decryption.
//!
//! Each party encrypts all of its rows with [`MyDataEncryptor`] and streams the ciphertext to
//! the peer, which keeps the rows at its private indexes with [`PeerDataCollector`]. The
//! resulting [`EncryptionResults`] and the [`ExpandedKey`] are written to files, so that the
//! joint decryption ([`UdpDecryption`]) can run later, possibly sharded across workers.

use std::{path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, trace};

use crate::{
    aes_ctr::{ExpandedKey, ctr_encrypt_rows},
    block::Block,
    channel::{self, Channel, recv_from, send_to},
    data_processor::{self, row_counters},
    secret,
};

mod app;
pub mod files;

pub use app::{UdpDecryption, UdpDecryptorApp, UdpEncryptorApp, UdpFiles};

const CIPHERTEXT_PHASE: &str = "udp ciphertext";

/// Errors that can occur while streaming, reading or writing encrypted rows.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A file could not be read or written.
    #[error("could not access {path}: {source}")]
    Io {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },
    /// A line of an index file could not be parsed.
    #[error("line {line} of {path} is malformed")]
    MalformedLine {
        /// The file.
        path: PathBuf,
        /// The line number, starting at 1.
        line: usize,
    },
    /// A global parameter is missing or not a valid size.
    #[error("global parameter `{0}` is missing or not a valid size")]
    MissingParameter(String),
    /// A JSON file could not be parsed or written.
    #[error("invalid JSON in {path}: {source}")]
    Json {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        source: serde_json::Error,
    },
    /// A binary file could not be parsed or written.
    #[error("invalid binary file {path}: {source}")]
    Bincode {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        source: bincode::Error,
    },
    /// Rows of different widths were streamed.
    #[error("row {row} has {actual} bytes instead of {expected}")]
    RaggedRows {
        /// The position of the row in the stream.
        row: u64,
        /// The width of the first row.
        expected: usize,
        /// The width of the offending row.
        actual: usize,
    },
    /// A rows to pick is beyond the peer's rows.
    #[error("index {index} is out of range for {rows} rows")]
    IndexOutOfRange {
        /// The index.
        index: u64,
        /// The number of rows of the peer.
        rows: u64,
    },
    /// The peer sent more or fewer rows than announced.
    #[error("received {received} rows, but expected {expected}")]
    RowCountMismatch {
        /// The number of rows received so far.
        received: u64,
        /// The announced number of rows.
        expected: u64,
    },
    /// No data files were given.
    #[error("no data files given")]
    NoInputFiles,
    /// The background encryption task is gone.
    #[error("the encryption task stopped unexpectedly")]
    WorkerStopped,
    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// An error occurred while trying to communicate over the channel.
    #[error(transparent)]
    Channel(#[from] channel::Error),
    /// An error occurred in the secret-sharing runtime.
    #[error(transparent)]
    Secret(#[from] secret::Error),
    /// The joint decryption failed.
    #[error(transparent)]
    DataProcessor(#[from] data_processor::Error),
}

/// The ciphertext of the peer's rows at this party's indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionResults {
    /// The ciphertext of each selected row.
    pub ciphertexts: Vec<Vec<u8>>,
    /// The counter blocks each row was encrypted with.
    pub nonces: Vec<Vec<Block>>,
    /// The position of each row among the peer's rows.
    pub indexes: Vec<u64>,
}

/// The number of rows in shard `shard` of `shards` near-equal shards of `total` rows.
///
/// The first `total % shards` shards get one row more.
pub fn shard_size(total: usize, shard: usize, shards: usize) -> usize {
    total / shards + usize::from(shard < total % shards)
}

impl EncryptionResults {
    /// The number of rows.
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Splits the rows into `shards` consecutive parts of near-equal size.
    pub fn split(self, shards: usize) -> Vec<EncryptionResults> {
        let shards = shards.max(1);
        let total = self.len();
        let mut ciphertexts = self.ciphertexts.into_iter();
        let mut nonces = self.nonces.into_iter();
        let mut indexes = self.indexes.into_iter();
        (0..shards)
            .map(|shard| {
                let n = shard_size(total, shard, shards);
                EncryptionResults {
                    ciphertexts: ciphertexts.by_ref().take(n).collect(),
                    nonces: nonces.by_ref().take(n).collect(),
                    indexes: indexes.by_ref().take(n).collect(),
                }
            })
            .collect()
    }
}

/// Encrypts this party's rows chunk by chunk and streams the ciphertext to the peer.
///
/// Rows are buffered until `chunk_size` of them are available. Full buffers are handed to a
/// background task through a channel with room for a single chunk, so that reading the next
/// chunk overlaps with encrypting and sending the previous one.
#[derive(Debug)]
pub struct MyDataEncryptor {
    key: ExpandedKey,
    chunk_size: usize,
    width: Option<usize>,
    rows: u64,
    buffer: Vec<Vec<u8>>,
    sender: Option<mpsc::Sender<Vec<Vec<u8>>>>,
    worker: Option<JoinHandle<Result<u64, Error>>>,
}

impl MyDataEncryptor {
    /// Starts the background task, sending to `peer` over `channel` with a fresh random key.
    pub fn new<C>(channel: Arc<C>, peer: usize, chunk_size: usize) -> Self
    where
        C: Channel + Send + Sync + 'static,
    {
        let key = ExpandedKey::random();
        let (sender, mut receiver) = mpsc::channel::<Vec<Vec<u8>>>(1);
        let worker = tokio::spawn(async move {
            let mut encrypted = 0u64;
            while let Some(chunk) = receiver.recv().await {
                let width = chunk.first().map_or(0, Vec::len);
                let ciphertext = ctr_encrypt_rows(&key, &chunk, width, encrypted);
                send_to(channel.as_ref(), peer, CIPHERTEXT_PHASE, &ciphertext).await?;
                encrypted += chunk.len() as u64;
                trace!(encrypted, "sent ciphertext chunk");
            }
            Ok::<_, Error>(encrypted)
        });
        Self {
            key,
            chunk_size: chunk_size.max(1),
            width: None,
            rows: 0,
            buffer: Vec::with_capacity(chunk_size.max(1)),
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// Adds a row. All rows must have the same width.
    pub async fn push_line(&mut self, row: Vec<u8>) -> Result<(), Error> {
        let expected = *self.width.get_or_insert(row.len());
        if row.len() != expected {
            return Err(Error::RaggedRows {
                row: self.rows,
                expected,
                actual: row.len(),
            });
        }
        self.buffer.push(row);
        self.rows += 1;
        if self.buffer.len() >= self.chunk_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Adds several rows.
    pub async fn push_lines(&mut self, rows: Vec<Vec<u8>>) -> Result<(), Error> {
        for row in rows {
            self.push_line(row).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Error> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
        let sender = self.sender.as_ref().ok_or(Error::WorkerStopped)?;
        if sender.send(chunk).await.is_err() {
            // the worker only stops early on errors, report those instead
            self.sender = None;
            return Err(self.join().await.err().unwrap_or(Error::WorkerStopped));
        }
        Ok(())
    }

    async fn join(&mut self) -> Result<u64, Error> {
        let worker = self.worker.take().ok_or(Error::WorkerStopped)?;
        worker.await?
    }

    /// Encrypts and sends the remaining rows, waits for the background task and returns the key
    /// that all rows were encrypted with.
    pub async fn finish(mut self) -> Result<ExpandedKey, Error> {
        self.flush().await?;
        self.sender = None;
        let encrypted = self.join().await?;
        debug!(encrypted, "finished encrypting my data");
        Ok(self.key)
    }
}

/// Receives the peer's ciphertext and keeps the rows at this party's indexes.
#[derive(Debug)]
pub struct PeerDataCollector {
    total_rows: u64,
    width: usize,
    received: u64,
    /// `(row, position)` pairs sorted by row.
    wanted: Vec<(u64, usize)>,
    next: usize,
    ciphertexts: Vec<Vec<u8>>,
    indexes: Vec<u64>,
}

impl PeerDataCollector {
    /// Prepares to receive `total_rows` rows of `width` bytes, keeping those at `indexes`.
    pub fn new(total_rows: u64, width: usize, indexes: Vec<u64>) -> Result<Self, Error> {
        if let Some(&index) = indexes.iter().find(|&&index| index >= total_rows) {
            return Err(Error::IndexOutOfRange {
                index,
                rows: total_rows,
            });
        }
        let mut wanted: Vec<(u64, usize)> = indexes.iter().copied().zip(0..).collect();
        wanted.sort_unstable();
        Ok(Self {
            total_rows,
            width,
            received: 0,
            wanted,
            next: 0,
            ciphertexts: vec![vec![]; indexes.len()],
            indexes,
        })
    }

    /// Whether all rows have been received.
    pub fn is_complete(&self) -> bool {
        self.received >= self.total_rows
    }

    /// Processes the next chunk of ciphertext rows.
    pub fn process_chunk(&mut self, chunk: Vec<Vec<u8>>) -> Result<(), Error> {
        let received = self.received + chunk.len() as u64;
        if received > self.total_rows {
            return Err(Error::RowCountMismatch {
                received,
                expected: self.total_rows,
            });
        }
        for (row, ciphertext) in (self.received..).zip(chunk) {
            if ciphertext.len() != self.width {
                return Err(Error::RaggedRows {
                    row,
                    expected: self.width,
                    actual: ciphertext.len(),
                });
            }
            while let Some(&(index, position)) = self.wanted.get(self.next) {
                if index != row {
                    break;
                }
                self.ciphertexts[position] = ciphertext.clone();
                self.next += 1;
            }
        }
        self.received = received;
        Ok(())
    }

    /// Receives chunks from `peer` until all rows are there.
    pub async fn receive_all(&mut self, channel: &impl Channel, peer: usize) -> Result<(), Error> {
        while !self.is_complete() {
            let chunk: Vec<Vec<u8>> = recv_from(channel, peer, CIPHERTEXT_PHASE).await?;
            if chunk.is_empty() {
                return Err(Error::RowCountMismatch {
                    received: self.received,
                    expected: self.total_rows,
                });
            }
            self.process_chunk(chunk)?;
            trace!(received = self.received, "received ciphertext chunk");
        }
        Ok(())
    }

    /// Returns the selected rows in the order of the indexes.
    pub fn finish(self) -> Result<EncryptionResults, Error> {
        if !self.is_complete() {
            return Err(Error::RowCountMismatch {
                received: self.received,
                expected: self.total_rows,
            });
        }
        let nonces = self
            .indexes
            .iter()
            .map(|&index| row_counters(index, self.width))
            .collect();
        Ok(EncryptionResults {
            ciphertexts: self.ciphertexts,
            nonces,
            indexes: self.indexes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SimpleChannel;

    #[test]
    fn shard_sizes_add_up() {
        assert_eq!(
            (0..3).map(|i| shard_size(10, i, 3)).collect::<Vec<_>>(),
            vec![4, 3, 3]
        );
        assert_eq!(shard_size(2, 3, 4), 0);
    }

    #[test]
    fn split_keeps_order() {
        let results = EncryptionResults {
            ciphertexts: (0..5u8).map(|i| vec![i]).collect(),
            nonces: (0..5u64).map(|i| vec![Block::counter(i)]).collect(),
            indexes: (0..5).collect(),
        };
        let shards = results.split(2);
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].indexes, vec![0, 1, 2]);
        assert_eq!(shards[1].indexes, vec![3, 4]);
        assert_eq!(shards[1].ciphertexts, vec![vec![3], vec![4]]);
        assert_eq!(shards[1].nonces[0], vec![Block::counter(3)]);
    }

    #[test]
    fn collector_picks_rows_across_chunks() {
        let mut collector = PeerDataCollector::new(6, 1, vec![4, 1, 4, 0]).unwrap();
        collector.process_chunk(vec![vec![10], vec![11]]).unwrap();
        collector.process_chunk(vec![vec![12], vec![13], vec![14]]).unwrap();
        assert!(!collector.is_complete());
        collector.process_chunk(vec![vec![15]]).unwrap();
        let results = collector.finish().unwrap();
        assert_eq!(results.ciphertexts, vec![vec![14], vec![11], vec![14], vec![10]]);
        assert_eq!(results.indexes, vec![4, 1, 4, 0]);
        assert_eq!(results.nonces[0], vec![Block::counter(4)]);
    }

    #[test]
    fn collector_rejects_bad_input() {
        assert!(matches!(
            PeerDataCollector::new(3, 1, vec![3]),
            Err(Error::IndexOutOfRange { index: 3, rows: 3 })
        ));
        let mut collector = PeerDataCollector::new(2, 2, vec![0]).unwrap();
        assert!(matches!(
            collector.process_chunk(vec![vec![1, 2], vec![3]]),
            Err(Error::RaggedRows { row: 1, .. })
        ));
        let mut collector = PeerDataCollector::new(1, 1, vec![0]).unwrap();
        assert!(matches!(
            collector.process_chunk(vec![vec![1], vec![2]]),
            Err(Error::RowCountMismatch { received: 2, expected: 1 })
        ));
    }

    #[tokio::test]
    async fn encrypted_stream_matches_single_shot_encryption() {
        let mut channels = SimpleChannel::channels(2);
        let receiver = channels.remove(1);
        let sender = Arc::new(channels.remove(0));
        let rows: Vec<Vec<u8>> = (0..23u8).map(|i| vec![i; 19]).collect();

        let mut encryptor = MyDataEncryptor::new(sender, 1, 5);
        let mut collector = PeerDataCollector::new(23, 19, vec![22, 0, 7]).unwrap();
        let produce = async {
            encryptor.push_lines(rows[..10].to_vec()).await?;
            for row in &rows[10..] {
                encryptor.push_line(row.clone()).await?;
            }
            encryptor.finish().await
        };
        let (key, received) = tokio::join!(produce, collector.receive_all(&receiver, 0));
        let key = key.unwrap();
        received.unwrap();
        let results = collector.finish().unwrap();

        let expected = ctr_encrypt_rows(&key, &rows, 19, 0);
        assert_eq!(
            results.ciphertexts,
            vec![expected[22].clone(), expected[0].clone(), expected[7].clone()]
        );
    }

    #[tokio::test]
    async fn ragged_rows_are_rejected() {
        let mut channels = SimpleChannel::channels(2);
        let mut encryptor = MyDataEncryptor::new(Arc::new(channels.remove(0)), 1, 5);
        encryptor.push_line(vec![1, 2]).await.unwrap();
        assert!(matches!(
            encryptor.push_line(vec![1]).await,
            Err(Error::RaggedRows {
                row: 1,
                expected: 2,
                actual: 1
            })
        ));
    }
}
