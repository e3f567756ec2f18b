//! Two-party XOR secret sharing of batched bits.
//!
//! A [`SecretBit`] holds this party's shares of a whole batch of bits (one bit per row), a
//! [`SecretBitString`] is a list of such planes of the same batch size. XOR and NOT are local,
//! AND consumes one Beaver triple per bit, handed out by the trusted dealer in [`deal_triples`].
//! All AND gates given to a single [`Session::and_many`] call share one round of communication.

use std::{
    ops::{BitXor, BitXorAssign, Not, Range},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::future::try_join;
use serde::{Serialize, de::DeserializeOwned};
use tracing::trace;

use crate::{
    bits::{pack, unpack, words_for},
    channel::{self, Channel, SimpleChannel, check_len, recv_counted, send_counted},
};

mod dealer;

use dealer::{DealerReply, TripleRequest, TripleShares};
pub use dealer::{Error as DealerError, deal_triples};

/// Errors occurring while computing on secret-shared bits.
#[derive(Debug)]
pub enum Error {
    /// An error occurred while trying to communicate over the channel.
    Channel(channel::Error),
    /// The dealer refused to hand out triples.
    DealerAborted(String),
    /// A message from the other party or the dealer had an unexpected size.
    MalformedMessage(&'static str),
    /// Two operands have a different number of rows.
    BatchMismatch {
        /// The batch size that was expected.
        expected: usize,
        /// The batch size that was found.
        actual: usize,
    },
    /// Two operands have a different number of bit planes.
    WidthMismatch {
        /// The width that was expected.
        expected: usize,
        /// The width that was found.
        actual: usize,
    },
    /// The given party is neither this party nor its peer.
    UnknownParty(usize),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Channel(e) => write!(f, "Channel error: {e}"),
            Error::DealerAborted(reason) => write!(f, "The dealer aborted: {reason}"),
            Error::MalformedMessage(phase) => write!(f, "Malformed message during {phase}"),
            Error::BatchMismatch { expected, actual } => {
                write!(f, "Expected a batch of {expected} rows, but found {actual}")
            }
            Error::WidthMismatch { expected, actual } => {
                write!(f, "Expected {expected} bit planes, but found {actual}")
            }
            Error::UnknownParty(p) => write!(f, "Party {p} does not take part in the session"),
        }
    }
}

impl From<channel::Error> for Error {
    fn from(e: channel::Error) -> Self {
        Error::Channel(e)
    }
}

/// The AND gates evaluated and the bytes exchanged by a session, including its clones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Non-free gates, one per AND of a single bit.
    pub and_gates: u64,
    /// Serialized bytes sent to the peer and the dealer.
    pub bytes_sent: u64,
    /// Serialized bytes received from the peer and the dealer.
    pub bytes_received: u64,
}

impl Statistics {
    /// The counts accumulated after `earlier` was taken.
    pub fn since(&self, earlier: &Statistics) -> Statistics {
        Statistics {
            and_gates: self.and_gates.saturating_sub(earlier.and_gates),
            bytes_sent: self.bytes_sent.saturating_sub(earlier.bytes_sent),
            bytes_received: self.bytes_received.saturating_sub(earlier.bytes_received),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    and_gates: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// The connection of one party to its peer and to the trusted dealer.
#[derive(Debug)]
pub struct Session<C> {
    channel: Arc<C>,
    party: usize,
    peer: usize,
    dealer: usize,
    counters: Arc<Counters>,
}

impl<C> Clone for Session<C> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            party: self.party,
            peer: self.peer,
            dealer: self.dealer,
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<C> Session<C> {
    /// Creates the session of `party`, computing together with `peer` and using `dealer`.
    pub fn new(channel: Arc<C>, party: usize, peer: usize, dealer: usize) -> Self {
        Self {
            channel,
            party,
            peer,
            dealer,
            counters: Arc::default(),
        }
    }

    /// The counts of this session and all of its clones so far.
    pub fn statistics(&self) -> Statistics {
        Statistics {
            and_gates: self.counters.and_gates.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// The index of this party.
    pub fn party(&self) -> usize {
        self.party
    }

    /// The index of the other party.
    pub fn peer(&self) -> usize {
        self.peer
    }

    /// The underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// The lead party adds public constants to its shares.
    fn is_lead(&self) -> bool {
        self.party < self.peer
    }
}

impl<C: Channel> Session<C> {
    async fn send(&self, party: usize, phase: &str, msg: &impl Serialize) -> Result<(), Error> {
        let bytes = send_counted(self.channel(), party, phase, msg).await?;
        self.counters
            .bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn recv<T: DeserializeOwned>(&self, party: usize, phase: &str) -> Result<T, Error> {
        let (msg, bytes) = recv_counted(self.channel(), party, phase).await?;
        self.counters
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        Ok(msg)
    }

    /// Serializes and sends a message to the peer.
    pub async fn send_to_peer(&self, phase: &str, msg: &impl Serialize) -> Result<(), Error> {
        self.send(self.peer, phase, msg).await
    }

    /// Receives a message from the peer.
    pub async fn recv_from_peer<T: DeserializeOwned>(&self, phase: &str) -> Result<T, Error> {
        self.recv(self.peer, phase).await
    }

    /// Receives a Vec of exactly `len` elements from the peer.
    pub async fn recv_vec_from_peer<T: DeserializeOwned>(
        &self,
        phase: &str,
        len: usize,
    ) -> Result<Vec<T>, Error> {
        let v = self.recv(self.peer, phase).await?;
        Ok(check_len(v, phase, len)?)
    }

    /// Sends `msg` to the peer and receives the peer's message of the same type.
    pub async fn exchange<T: Serialize + DeserializeOwned>(
        &self,
        phase: &str,
        msg: &T,
    ) -> Result<T, Error> {
        let ((), theirs) =
            try_join(self.send_to_peer(phase, msg), self.recv_from_peer(phase)).await?;
        Ok(theirs)
    }

    /// Tells the dealer that this party will not request any more triples.
    pub async fn finish(&self) -> Result<(), Error> {
        self.send(self.dealer, "triple request", &TripleRequest::Done)
            .await
    }

    async fn triples(&self, count: usize) -> Result<[Vec<bool>; 3], Error> {
        let request = TripleRequest::Triples(count as u64);
        self.send(self.dealer, "triple request", &request).await?;
        match self.recv(self.dealer, "triples").await? {
            DealerReply::Triples(TripleShares { a, b, c }) => {
                let words = words_for(count);
                if a.len() != words || b.len() != words || c.len() != words {
                    return Err(Error::MalformedMessage("triples"));
                }
                Ok([unpack(&a, count), unpack(&b, count), unpack(&c, count)])
            }
            DealerReply::Abort(reason) => Err(Error::DealerAborted(reason)),
        }
    }

    /// ANDs each pair of bits, using a single round of communication for all of them.
    pub async fn and_many(
        &self,
        pairs: &[(&SecretBit, &SecretBit)],
    ) -> Result<Vec<SecretBit>, Error> {
        let lead = self.is_lead();
        let mut total = 0;
        for (x, y) in pairs {
            if x.len() != y.len() {
                return Err(Error::BatchMismatch {
                    expected: x.len(),
                    actual: y.len(),
                });
            }
            total += x.len();
        }
        if total == 0 {
            return Ok(pairs.iter().map(|_| SecretBit::new(lead, vec![])).collect());
        }
        trace!(total, "AND gates");
        self.counters
            .and_gates
            .fetch_add(total as u64, Ordering::Relaxed);
        let [a, b, c] = self.triples(total).await?;
        let x = pairs.iter().flat_map(|(x, _)| x.share.iter());
        let y = pairs.iter().flat_map(|(_, y)| y.share.iter());
        let d: Vec<bool> = x.zip(&a).map(|(x, a)| x ^ a).collect();
        let e: Vec<bool> = y.zip(&b).map(|(y, b)| y ^ b).collect();
        let (peer_d, peer_e): (Vec<u64>, Vec<u64>) =
            self.exchange("AND openings", &(pack(&d), pack(&e))).await?;
        if peer_d.len() != words_for(total) || peer_e.len() != words_for(total) {
            return Err(Error::MalformedMessage("AND openings"));
        }
        let peer_d = unpack(&peer_d, total);
        let peer_e = unpack(&peer_e, total);
        let mut z = (0..total).map(|i| {
            let d = d[i] ^ peer_d[i];
            let e = e[i] ^ peer_e[i];
            c[i] ^ (d & b[i]) ^ (e & a[i]) ^ (lead & d & e)
        });
        Ok(pairs
            .iter()
            .map(|(x, _)| SecretBit::new(lead, z.by_ref().take(x.len()).collect()))
            .collect())
    }

    /// ANDs two bits.
    pub async fn and(&self, x: &SecretBit, y: &SecretBit) -> Result<SecretBit, Error> {
        let mut z = self.and_many(&[(x, y)]).await?;
        z.pop().ok_or(Error::MalformedMessage("AND openings"))
    }
}

/// Creates the sessions of parties 0 and 1, connected over in-memory channels, together with
/// the channel of the trusted dealer (party 2).
pub fn simulated_sessions() -> (Session<SimpleChannel>, Session<SimpleChannel>, SimpleChannel) {
    let mut channels = SimpleChannel::channels(3);
    let dealer = channels.remove(2);
    let party1 = Session::new(Arc::new(channels.remove(1)), 1, 0, 2);
    let party0 = Session::new(Arc::new(channels.remove(0)), 0, 1, 2);
    (party0, party1, dealer)
}

/// This party's shares of a batch of secret bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretBit {
    lead: bool,
    share: Vec<bool>,
}

impl SecretBit {
    fn new(lead: bool, share: Vec<bool>) -> Self {
        Self { lead, share }
    }

    /// Wraps a local share without any interaction; the peer must wrap its share of the same bits.
    pub fn from_local_share<C>(session: &Session<C>, share: Vec<bool>) -> Self {
        Self::new(session.is_lead(), share)
    }

    /// The number of rows in the batch.
    pub fn len(&self) -> usize {
        self.share.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.share.is_empty()
    }

    /// This party's share of each bit.
    pub fn local_share(&self) -> &[bool] {
        &self.share
    }

    /// Shares of zero, with the same batch size.
    pub(crate) fn zeros_like(&self) -> Self {
        Self::new(self.lead, vec![false; self.len()])
    }

    /// XORs a public bit into every row.
    pub fn xor_public(&self, value: bool) -> Self {
        let flip = value && self.lead;
        Self::new(self.lead, self.share.iter().map(|&s| s ^ flip).collect())
    }

    /// Moves row `perm[i]` to row `i`.
    pub fn permuted(&self, perm: &[usize]) -> Self {
        Self::new(self.lead, perm.iter().map(|&i| self.share[i]).collect())
    }

    /// Keeps only the rows whose public `keep` flag is set.
    pub fn filtered(&self, keep: &[bool]) -> Self {
        let share = self
            .share
            .iter()
            .zip(keep)
            .filter_map(|(&s, &k)| k.then_some(s))
            .collect();
        Self::new(self.lead, share)
    }
}

impl BitXor for &SecretBit {
    type Output = SecretBit;

    fn bitxor(self, rhs: Self) -> SecretBit {
        debug_assert_eq!(self.len(), rhs.len());
        let share = self.share.iter().zip(&rhs.share).map(|(a, b)| a ^ b).collect();
        SecretBit::new(self.lead, share)
    }
}

impl BitXorAssign<&SecretBit> for SecretBit {
    fn bitxor_assign(&mut self, rhs: &SecretBit) {
        debug_assert_eq!(self.len(), rhs.len());
        for (a, b) in self.share.iter_mut().zip(&rhs.share) {
            *a ^= b;
        }
    }
}

impl Not for &SecretBit {
    type Output = SecretBit;

    fn not(self) -> SecretBit {
        self.xor_public(true)
    }
}

/// A list of secret bit planes, all with the same batch size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretBitString {
    planes: Vec<SecretBit>,
    batch: usize,
}

impl SecretBitString {
    /// Secret-shares this party's private `values` (one plane of `batch` bits each) with the
    /// peer, which must call [`SecretBitString::peer_input`] at the same time.
    pub async fn private_input<C: Channel>(
        session: &Session<C>,
        values: Vec<Vec<bool>>,
        batch: usize,
    ) -> Result<Self, Error> {
        if let Some(plane) = values.iter().find(|plane| plane.len() != batch) {
            return Err(Error::BatchMismatch {
                expected: batch,
                actual: plane.len(),
            });
        }
        let lead = session.is_lead();
        let mut masks = Vec::with_capacity(values.len());
        let mut planes = Vec::with_capacity(values.len());
        for plane in values {
            let mask: Vec<bool> = (0..batch).map(|_| rand::random()).collect();
            let share = plane.iter().zip(&mask).map(|(v, m)| v ^ m).collect();
            masks.push(pack(&mask));
            planes.push(SecretBit::new(lead, share));
        }
        session.send_to_peer("private input", &masks).await?;
        Ok(Self { planes, batch })
    }

    /// Receives this party's shares of `width` planes that the peer provides through
    /// [`SecretBitString::private_input`].
    pub async fn peer_input<C: Channel>(
        session: &Session<C>,
        width: usize,
        batch: usize,
    ) -> Result<Self, Error> {
        let masks: Vec<Vec<u64>> = session.recv_vec_from_peer("private input", width).await?;
        let lead = session.is_lead();
        let planes = masks
            .iter()
            .map(|words| {
                if words.len() == words_for(batch) {
                    Ok(SecretBit::new(lead, unpack(words, batch)))
                } else {
                    Err(Error::MalformedMessage("private input"))
                }
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { planes, batch })
    }

    /// Wraps local shares without any interaction; the peer must wrap its shares of the same
    /// values.
    pub fn from_local_share<C>(
        session: &Session<C>,
        planes: Vec<Vec<bool>>,
        batch: usize,
    ) -> Result<Self, Error> {
        let planes = planes
            .into_iter()
            .map(|share| SecretBit::from_local_share(session, share))
            .collect();
        Self::from_planes(planes, batch)
    }

    /// Groups planes with the same batch size.
    pub fn from_planes(planes: Vec<SecretBit>, batch: usize) -> Result<Self, Error> {
        match planes.iter().find(|plane| plane.len() != batch) {
            Some(plane) => Err(Error::BatchMismatch {
                expected: batch,
                actual: plane.len(),
            }),
            None => Ok(Self { planes, batch }),
        }
    }

    /// The number of bit planes.
    pub fn width(&self) -> usize {
        self.planes.len()
    }

    /// The number of rows in every plane.
    pub fn batch_size(&self) -> usize {
        self.batch
    }

    /// The plane at index `i`.
    pub fn plane(&self, i: usize) -> &SecretBit {
        &self.planes[i]
    }

    /// All planes.
    pub fn planes(&self) -> &[SecretBit] {
        &self.planes
    }

    /// Consumes the string, returning its planes.
    pub fn into_planes(self) -> Vec<SecretBit> {
        self.planes
    }

    /// This party's share of each plane.
    pub fn local_share(&self) -> Vec<Vec<bool>> {
        self.planes.iter().map(|p| p.share.clone()).collect()
    }

    /// The planes in `range`.
    pub fn slice(&self, range: Range<usize>) -> Self {
        Self {
            planes: self.planes[range].to_vec(),
            batch: self.batch,
        }
    }

    fn check_shape(&self, other: &Self) -> Result<(), Error> {
        if self.width() != other.width() {
            return Err(Error::WidthMismatch {
                expected: self.width(),
                actual: other.width(),
            });
        }
        if self.batch != other.batch {
            return Err(Error::BatchMismatch {
                expected: self.batch,
                actual: other.batch,
            });
        }
        Ok(())
    }

    /// XORs two strings of the same shape.
    pub fn xor(&self, other: &Self) -> Result<Self, Error> {
        self.check_shape(other)?;
        let planes = self.planes.iter().zip(&other.planes).map(|(a, b)| a ^ b).collect();
        Ok(Self {
            planes,
            batch: self.batch,
        })
    }

    /// Negates every bit.
    pub fn not(&self) -> Self {
        Self {
            planes: self.planes.iter().map(|p| !p).collect(),
            batch: self.batch,
        }
    }

    /// ANDs two strings of the same shape in one round.
    pub async fn and<C: Channel>(&self, session: &Session<C>, other: &Self) -> Result<Self, Error> {
        self.check_shape(other)?;
        let pairs: Vec<_> = self.planes.iter().zip(&other.planes).collect();
        let planes = session.and_many(&pairs).await?;
        Ok(Self {
            planes,
            batch: self.batch,
        })
    }

    /// Picks `if_true` in the rows where `cond` is set and `if_false` elsewhere.
    pub async fn select<C: Channel>(
        session: &Session<C>,
        cond: &SecretBit,
        if_true: &Self,
        if_false: &Self,
    ) -> Result<Self, Error> {
        if_true.check_shape(if_false)?;
        if cond.len() != if_true.batch {
            return Err(Error::BatchMismatch {
                expected: if_true.batch,
                actual: cond.len(),
            });
        }
        let diff = if_true.xor(if_false)?;
        let pairs: Vec<_> = diff.planes.iter().map(|d| (cond, d)).collect();
        let masked = session.and_many(&pairs).await?;
        let planes = masked
            .iter()
            .zip(&if_false.planes)
            .map(|(m, f)| m ^ f)
            .collect();
        Ok(Self {
            planes,
            batch: if_true.batch,
        })
    }

    /// Moves row `perm[i]` to row `i` in every plane.
    pub fn permuted(&self, perm: &[usize]) -> Self {
        Self {
            planes: self.planes.iter().map(|p| p.permuted(perm)).collect(),
            batch: perm.len(),
        }
    }

    /// Keeps only the rows whose public `keep` flag is set.
    pub fn filtered(&self, keep: &[bool]) -> Self {
        Self {
            planes: self.planes.iter().map(|p| p.filtered(keep)).collect(),
            batch: keep.iter().take(self.batch).filter(|k| **k).count(),
        }
    }

    /// Reveals the bits to `party` only: it receives `Some(planes)`, the other party `None`.
    pub async fn open_to_party<C: Channel>(
        &self,
        session: &Session<C>,
        party: usize,
    ) -> Result<Option<Vec<Vec<bool>>>, Error> {
        if party == session.party {
            let theirs: Vec<Vec<u64>> =
                session.recv_vec_from_peer("opening", self.width()).await?;
            self.combine(&theirs).map(Some)
        } else if party == session.peer {
            let mine: Vec<Vec<u64>> = self.planes.iter().map(|p| pack(&p.share)).collect();
            session.send_to_peer("opening", &mine).await?;
            Ok(None)
        } else {
            Err(Error::UnknownParty(party))
        }
    }

    /// Reveals the bits to both parties.
    pub async fn open_to_both<C: Channel>(
        &self,
        session: &Session<C>,
    ) -> Result<Vec<Vec<bool>>, Error> {
        let mine: Vec<Vec<u64>> = self.planes.iter().map(|p| pack(&p.share)).collect();
        let theirs = session.exchange("opening", &mine).await?;
        if theirs.len() != self.width() {
            return Err(Error::MalformedMessage("opening"));
        }
        self.combine(&theirs)
    }

    fn combine(&self, theirs: &[Vec<u64>]) -> Result<Vec<Vec<bool>>, Error> {
        self.planes
            .iter()
            .zip(theirs)
            .map(|(mine, theirs)| {
                if theirs.len() != words_for(self.batch) {
                    return Err(Error::MalformedMessage("opening"));
                }
                let theirs = unpack(theirs, self.batch);
                Ok(mine.share.iter().zip(theirs).map(|(a, b)| a ^ b).collect())
            })
            .collect()
    }
}
