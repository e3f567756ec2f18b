use std::{path::PathBuf, sync::Arc};

use futures::future::{try_join, try_join_all};
use tokio::{sync::mpsc, task::spawn_blocking};
use tracing::{Level, error, info, instrument};

use super::{
    EncryptionResults, Error, MyDataEncryptor, PeerDataCollector,
    files::{
        ADV_DATA_WIDTH, ADV_ROW_COUNT, GlobalParameters, PUB_DATA_WIDTH, PUB_ROW_COUNT,
        data_file_lines, read_data_file, read_encryption_results, read_expanded_key,
        read_index_file, write_encryption_results, write_expanded_key,
    },
};
use crate::{
    aes_ctr::ExpandedKey,
    channel::Channel,
    circuit::AesCircuitCtr,
    data_processor::{
        self, SecretSharedRowSet, Shape, agree_on_shape, decrypt_as_index_holder,
        decrypt_as_key_holder,
    },
    secret::Session,
};

/// The files of one party's run.
#[derive(Debug, Clone, Default)]
pub struct UdpFiles {
    /// Index files listing the peer's rows to keep.
    pub index_files: Vec<PathBuf>,
    /// Data files holding this party's rows.
    pub data_files: Vec<PathBuf>,
    /// The JSON file with the row counts and widths of both parties.
    pub global_parameters: PathBuf,
    /// One output file per shard of the encryption results.
    pub encryption_files: Vec<PathBuf>,
    /// The output file for the key of this party's rows.
    pub expanded_key_file: PathBuf,
}

/// The first stage: encrypts this party's rows for the peer and collects the peer's rows at
/// this party's indexes.
#[derive(Debug)]
pub struct UdpEncryptorApp<C> {
    channel: Arc<C>,
    peer: usize,
    am_i_publisher: bool,
    chunk_size: usize,
}

impl<C: Channel + Send + Sync + 'static> UdpEncryptorApp<C> {
    /// Talks to `peer` over `channel`, sending rows in chunks of `chunk_size`.
    pub fn new(channel: Arc<C>, peer: usize, am_i_publisher: bool, chunk_size: usize) -> Self {
        Self {
            channel,
            peer,
            am_i_publisher,
            chunk_size,
        }
    }

    /// Runs both directions at once and writes the key and the result shards.
    #[instrument(level = Level::INFO, skip_all, fields(publisher = self.am_i_publisher), err)]
    pub async fn invoke(&self, files: &UdpFiles) -> Result<(), Error> {
        let (key, results) = try_join(
            self.process_my_data(&files.data_files),
            self.process_peer_data(&files.index_files, &files.global_parameters),
        )
        .await?;
        info!(rows = results.len(), "collected the peer's rows");

        write_expanded_key(&files.expanded_key_file, &key)?;
        let shards = results.split(files.encryption_files.len());
        for (shard, path) in shards.iter().zip(&files.encryption_files) {
            write_encryption_results(path, shard)?;
            info!(path = %path.display(), rows = shard.len(), "wrote encryption results");
        }
        Ok(())
    }

    async fn process_my_data(&self, data_files: &[PathBuf]) -> Result<ExpandedKey, Error> {
        let (first, rest) = data_files.split_first().ok_or(Error::NoInputFiles)?;
        let readers: Vec<_> = rest
            .iter()
            .cloned()
            .map(|path| spawn_blocking(move || read_data_file(&path)))
            .collect();

        let mut encryptor =
            MyDataEncryptor::new(Arc::clone(&self.channel), self.peer, self.chunk_size);
        // the first file is streamed while the others are still being read
        let (lines, mut received) = mpsc::channel(self.chunk_size.max(1));
        let first = first.clone();
        let streamer = spawn_blocking(move || {
            for line in data_file_lines(&first)? {
                if lines.blocking_send(line).is_err() {
                    break;
                }
            }
            Ok::<_, Error>(())
        });
        while let Some(line) = received.recv().await {
            encryptor.push_line(line?).await?;
        }
        streamer.await??;

        for (reader, path) in readers.into_iter().zip(rest) {
            let rows = reader.await?.inspect_err(|e| {
                error!(path = %path.display(), "could not read data file: {e}");
            })?;
            encryptor.push_lines(rows).await?;
        }
        encryptor.finish().await
    }

    async fn process_peer_data(
        &self,
        index_files: &[PathBuf],
        global_parameters: &std::path::Path,
    ) -> Result<EncryptionResults, Error> {
        let readers = index_files
            .iter()
            .cloned()
            .map(|path| spawn_blocking(move || read_index_file(&path)));
        let params = GlobalParameters::read(global_parameters)?;
        let mut indexes = vec![];
        for file in try_join_all(readers).await? {
            indexes.extend(file?);
        }

        let (rows, width) = if self.am_i_publisher {
            (ADV_ROW_COUNT, ADV_DATA_WIDTH)
        } else {
            (PUB_ROW_COUNT, PUB_DATA_WIDTH)
        };
        let (rows, width) = (params.size(rows)?, params.size(width)?);
        info!(peer_rows = rows, width, selected = indexes.len(), "receiving the peer's rows");

        let mut collector = PeerDataCollector::new(rows as u64, width, indexes)?;
        collector.receive_all(self.channel.as_ref(), self.peer).await?;
        collector.finish()
    }
}

/// The second stage: jointly decrypts rows collected by the first stage.
#[derive(Debug, Clone)]
pub struct UdpDecryption<C> {
    session: Session<C>,
    circuit: AesCircuitCtr,
}

impl<C: Channel> UdpDecryption<C> {
    /// Creates the decryption running in `session`.
    pub fn new(session: Session<C>) -> Self {
        Self {
            session,
            circuit: AesCircuitCtr,
        }
    }

    /// Shares `output_size` of this party's `row_count` rows, encrypted under `key`. The peer
    /// calls [`UdpDecryption::decrypt_peer_data`] at the same time.
    pub async fn decrypt_my_data(
        &self,
        key: &ExpandedKey,
        row_count: usize,
        width: usize,
        output_size: usize,
    ) -> Result<SecretSharedRowSet, data_processor::Error> {
        let shape = Shape {
            rows: row_count,
            width,
            output: output_size,
        };
        agree_on_shape(&self.session, shape).await?;
        if output_size == 0 {
            return Ok(SecretSharedRowSet::empty(&self.session, width)?);
        }
        decrypt_as_key_holder(&self.session, &self.circuit, key, width, output_size).await
    }

    /// Shares the peer's rows in `results`, taken from the peer's `peer_row_count` rows.
    pub async fn decrypt_peer_data(
        &self,
        results: &EncryptionResults,
        peer_row_count: usize,
        width: usize,
    ) -> Result<SecretSharedRowSet, data_processor::Error> {
        let shape = Shape {
            rows: peer_row_count,
            width,
            output: results.len(),
        };
        agree_on_shape(&self.session, shape).await?;
        if let Some((row, ciphertext)) = results
            .ciphertexts
            .iter()
            .enumerate()
            .find(|(_, ciphertext)| ciphertext.len() != width)
        {
            return Err(data_processor::Error::RaggedRow {
                row,
                expected: width,
                actual: ciphertext.len(),
            });
        }
        if let Some(&index) = results
            .indexes
            .iter()
            .find(|&&index| index >= peer_row_count as u64)
        {
            return Err(data_processor::Error::IndexOutOfRange {
                index: index as i64,
                rows: peer_row_count,
            });
        }
        if results.is_empty() {
            return Ok(SecretSharedRowSet::empty(&self.session, width)?);
        }
        let rows: Vec<&[u8]> = results.ciphertexts.iter().map(Vec::as_slice).collect();
        decrypt_as_index_holder(&self.session, &self.circuit, &rows, &results.nonces, width)
            .await
    }
}

/// Runs the second stage on the files written by [`UdpEncryptorApp`].
#[derive(Debug, Clone)]
pub struct UdpDecryptorApp<C> {
    decryption: UdpDecryption<C>,
    am_i_publisher: bool,
}

impl<C: Channel> UdpDecryptorApp<C> {
    /// Creates the app running in `session`.
    pub fn new(session: Session<C>, am_i_publisher: bool) -> Self {
        Self {
            decryption: UdpDecryption::new(session),
            am_i_publisher,
        }
    }

    /// Decrypts one shard in both directions and returns the shares of the publisher's and the
    /// partner's rows, both in the order of the partner's and the publisher's indexes.
    #[instrument(level = Level::INFO, skip_all, fields(publisher = self.am_i_publisher), err)]
    pub async fn invoke(
        &self,
        encryption_file: &std::path::Path,
        expanded_key_file: &std::path::Path,
        global_parameters: &std::path::Path,
    ) -> Result<(SecretSharedRowSet, SecretSharedRowSet), Error> {
        let results = read_encryption_results(encryption_file)?;
        let key = read_expanded_key(expanded_key_file)?;
        let params = GlobalParameters::read(global_parameters)?;
        let (pub_rows, pub_width) = (params.size(PUB_ROW_COUNT)?, params.size(PUB_DATA_WIDTH)?);
        let (adv_rows, adv_width) = (params.size(ADV_ROW_COUNT)?, params.size(ADV_DATA_WIDTH)?);

        let session = &self.decryption.session;
        let peer_shard: usize = session.exchange("shard size", &results.len()).await?;
        info!(mine = results.len(), theirs = peer_shard, "decrypting shard");

        let d = &self.decryption;
        let rows = if self.am_i_publisher {
            let publisher = d.decrypt_my_data(&key, pub_rows, pub_width, peer_shard).await?;
            let partner = d.decrypt_peer_data(&results, adv_rows, adv_width).await?;
            (publisher, partner)
        } else {
            let publisher = d.decrypt_peer_data(&results, pub_rows, pub_width).await?;
            let partner = d.decrypt_my_data(&key, adv_rows, adv_width, peer_shard).await?;
            (publisher, partner)
        };
        Ok(rows)
    }
}
