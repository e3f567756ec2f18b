//! A trusted dealer handing out Beaver multiplication triples to two parties.

use futures::future::try_join;
use serde::{Deserialize, Serialize};
use tracing::{Level, debug, instrument};

use crate::{
    bits::words_for,
    channel::{self, Channel, recv_from, send_to},
};

/// What a party asks the dealer for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum TripleRequest {
    /// The given number of AND triples.
    Triples(u64),
    /// The party will not request any more triples.
    Done,
}

/// One party's shares of packed triples `(a, b, c)` with `c = a & b`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct TripleShares {
    pub(crate) a: Vec<u64>,
    pub(crate) b: Vec<u64>,
    pub(crate) c: Vec<u64>,
}

/// The dealer's answer to a [`TripleRequest`].
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum DealerReply {
    Triples(TripleShares),
    Abort(String),
}

/// Errors that can occur while executing the trusted dealer.
#[derive(Debug)]
pub enum Error {
    /// The parties requested a different number of triples.
    TripleCountMismatch(u64, u64),
    /// One party finished while the other one still requested triples.
    UnexpectedDone,
    /// An error occurred while trying to communicate over the channel.
    Channel(channel::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::TripleCountMismatch(a, b) => {
                write!(f, "Unequal number of requested triples: {a} vs {b}")
            }
            Error::UnexpectedDone => f.write_str("One party finished before the other"),
            Error::Channel(e) => write!(f, "Channel error: {e}"),
        }
    }
}

impl From<channel::Error> for Error {
    fn from(e: channel::Error) -> Self {
        Error::Channel(e)
    }
}

/// Runs the dealer until both `parties` are done, answering their triple requests.
///
/// Both parties must request the same number of triples in the same order; any disagreement
/// is reported to both of them before the dealer gives up.
#[instrument(level = Level::DEBUG, skip_all, err)]
pub async fn deal_triples(channel: &impl Channel, parties: [usize; 2]) -> Result<(), Error> {
    let [p0, p1] = parties;
    let mut served = 0u64;
    loop {
        let requests = try_join(
            recv_from::<TripleRequest>(channel, p0, "triple request"),
            recv_from::<TripleRequest>(channel, p1, "triple request"),
        )
        .await?;
        let count = match requests {
            (TripleRequest::Done, TripleRequest::Done) => {
                debug!(served, "dealer done");
                return Ok(());
            }
            (TripleRequest::Triples(a), TripleRequest::Triples(b)) if a == b => a,
            (TripleRequest::Triples(a), TripleRequest::Triples(b)) => {
                return abort(channel, parties, Error::TripleCountMismatch(a, b)).await;
            }
            _ => return abort(channel, parties, Error::UnexpectedDone).await,
        };
        let (share0, share1) = triples(count as usize);
        try_join(
            send_to(channel, p0, "triples", &DealerReply::Triples(share0)),
            send_to(channel, p1, "triples", &DealerReply::Triples(share1)),
        )
        .await?;
        served += count;
    }
}

async fn abort(channel: &impl Channel, parties: [usize; 2], e: Error) -> Result<(), Error> {
    let msg = DealerReply::Abort(e.to_string());
    try_join(
        send_to(channel, parties[0], "triples", &msg),
        send_to(channel, parties[1], "triples", &msg),
    )
    .await?;
    Err(e)
}

fn triples(count: usize) -> (TripleShares, TripleShares) {
    let words = words_for(count);
    let mut share0 = TripleShares::default();
    let mut share1 = TripleShares::default();
    for _ in 0..words {
        let (a0, a1, b0, b1, c0): (u64, u64, u64, u64, u64) = rand::random();
        let c1 = ((a0 ^ a1) & (b0 ^ b1)) ^ c0;
        share0.a.push(a0);
        share0.b.push(b0);
        share0.c.push(c0);
        share1.a.push(a1);
        share1.b.push(b1);
        share1.c.push(c1);
    }
    (share0, share1)
}
