//! Runs the adapter and the data processor back to back, as in a full data processing job.

use tracing::{Level, info, instrument};

use crate::{
    adapter::{self, Adapter, AdapterFactory, NO_VALUE},
    channel::Channel,
    data_processor::{self, DataProcessor, DataProcessorFactory, SecretSharedRowSet},
    secret::{Session, Statistics},
};

/// Errors that can occur during a full run.
#[derive(Debug)]
pub enum Error {
    /// The requested synthetic data cannot be generated.
    InvalidConfig(&'static str),
    /// The adapter failed.
    Adapter(adapter::Error),
    /// The data processor failed.
    DataProcessor(data_processor::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidConfig(reason) => write!(f, "Invalid configuration: {reason}"),
            Error::Adapter(e) => write!(f, "Adapter failed: {e}"),
            Error::DataProcessor(e) => write!(f, "Data processor failed: {e}"),
        }
    }
}

impl From<adapter::Error> for Error {
    fn from(e: adapter::Error) -> Self {
        Error::Adapter(e)
    }
}

impl From<data_processor::Error> for Error {
    fn from(e: data_processor::Error) -> Self {
        Error::DataProcessor(e)
    }
}

/// One party's side of a run, creating a fresh adapter and data processor for every play.
#[derive(Debug)]
pub struct UdpProcessGame<A, D> {
    adapters: A,
    processors: D,
    am_i_publisher: bool,
}

impl<A: AdapterFactory, D: DataProcessorFactory> UdpProcessGame<A, D> {
    /// Both parties must agree on who is the publisher.
    pub fn new(adapters: A, processors: D, am_i_publisher: bool) -> Self {
        Self {
            adapters,
            processors,
            am_i_publisher,
        }
    }

    /// Turns this party's union map into its intersection map.
    pub async fn play_adapter(&self, union_map: &[i64]) -> Result<Vec<i64>, Error> {
        Ok(self.adapters.create().adapt(union_map).await?)
    }

    /// Shares the publisher's and the partner's selected rows, in this order.
    ///
    /// `indexes` are the peer's rows matching this party's rows, as returned by
    /// [`UdpProcessGame::play_adapter`].
    pub async fn play_data_processor(
        &self,
        my_rows: &[Vec<u8>],
        indexes: &[i64],
        peer_row_count: usize,
        row_width: usize,
    ) -> Result<(SecretSharedRowSet, SecretSharedRowSet), Error> {
        let processor = self.processors.create();
        let output_size = indexes.len();
        let shares = if self.am_i_publisher {
            let publisher = processor.process_my_data(my_rows, output_size).await?;
            let partner = processor
                .process_peers_data(peer_row_count, indexes, row_width)
                .await?;
            (publisher, partner)
        } else {
            let publisher = processor
                .process_peers_data(peer_row_count, indexes, row_width)
                .await?;
            let partner = processor.process_my_data(my_rows, output_size).await?;
            (publisher, partner)
        };
        Ok(shares)
    }
}

/// The shares produced by [`UdpProcessApp::run`].
#[derive(Debug, Clone)]
pub struct UdpProcessOutput {
    /// The publisher's matched rows.
    pub publisher: SecretSharedRowSet,
    /// The partner's matched rows.
    pub partner: SecretSharedRowSet,
    /// The AND gates and the traffic of this party during the run.
    pub statistics: Statistics,
}

/// Runs a game on synthetic data of a given size.
#[derive(Debug)]
pub struct UdpProcessApp<C, A, D> {
    session: Session<C>,
    game: UdpProcessGame<A, D>,
    am_i_publisher: bool,
    number_of_rows: usize,
    intersection_size: usize,
    row_size: usize,
}

impl<C: Channel, A: AdapterFactory, D: DataProcessorFactory> UdpProcessApp<C, A, D> {
    /// Creates a run over a union of `number_of_rows` slots, of which the first
    /// `intersection_size` are matched, with rows of `row_size` bytes.
    ///
    /// `session` must be the session (or a clone of it) that the game's factories compute on,
    /// its statistics are reported at the end of the run.
    pub fn new(
        session: Session<C>,
        game: UdpProcessGame<A, D>,
        number_of_rows: usize,
        intersection_size: usize,
        row_size: usize,
    ) -> Self {
        Self {
            session,
            am_i_publisher: game.am_i_publisher,
            game,
            number_of_rows,
            intersection_size,
            row_size,
        }
    }

    /// This party's union map and rows.
    ///
    /// Matched slot `i` points to row `i` on both sides, whose bytes are all `i % 256`. The
    /// unmatched slots belong to the publisher only. Both parties hold the same number of rows;
    /// rows past the intersection are random.
    pub fn generate_data(&self) -> Result<(Vec<i64>, Vec<Vec<u8>>), Error> {
        if self.intersection_size == 0 {
            return Err(Error::InvalidConfig("the intersection must not be empty"));
        }
        if self.intersection_size > self.number_of_rows {
            return Err(Error::InvalidConfig("the intersection exceeds the union"));
        }
        if self.row_size == 0 {
            return Err(Error::InvalidConfig("rows must not be empty"));
        }
        let unmatched = self.number_of_rows - self.intersection_size;
        let row_count = unmatched / 2 + self.intersection_size;

        let rows: Vec<Vec<u8>> = (0..row_count)
            .map(|i| {
                if i < self.intersection_size {
                    vec![i as u8; self.row_size]
                } else {
                    (0..self.row_size).map(|_| rand::random()).collect()
                }
            })
            .collect();
        let extra = row_count - self.intersection_size;
        let union_map = (0..self.number_of_rows)
            .map(|slot| {
                if slot < self.intersection_size {
                    slot as i64
                } else if !self.am_i_publisher {
                    NO_VALUE
                } else if extra == 0 {
                    0
                } else {
                    (self.intersection_size + (slot - self.intersection_size) % extra) as i64
                }
            })
            .collect();
        Ok((union_map, rows))
    }

    /// Generates the data and plays the game, returning the shares of the publisher's and the
    /// partner's matched rows.
    #[instrument(level = Level::INFO, skip_all, fields(publisher = self.am_i_publisher), err)]
    pub async fn run(&self) -> Result<UdpProcessOutput, Error> {
        let (union_map, rows) = self.generate_data()?;
        let start = self.session.statistics();
        info!(union_size = union_map.len(), "running the adapter");
        let indexes = self.game.play_adapter(&union_map).await?;

        info!(
            rows = rows.len(),
            intersection_size = indexes.len(),
            "running the data processor"
        );
        let (publisher, partner) = self
            .game
            .play_data_processor(&rows, &indexes, rows.len(), self.row_size)
            .await?;
        let statistics = self.session.statistics().since(&start);
        info!(
            publisher_rows = publisher.len(),
            publisher_bits = publisher.bits().width(),
            partner_rows = partner.len(),
            partner_bits = partner.bits().width(),
            and_gates = statistics.and_gates,
            bytes_sent = statistics.bytes_sent,
            bytes_received = statistics.bytes_received,
            "finished"
        );
        Ok(UdpProcessOutput {
            publisher,
            partner,
            statistics,
        })
    }
}
