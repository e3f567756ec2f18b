//! Turns the union maps of both parties into intersection maps.
//!
//! Each party knows, for every slot of the (public) union of both record sets, which of its own
//! rows belongs there. After [`Adapter::adapt`] each party knows, for each matched slot, the row
//! index of the *peer*, while the slots themselves are hidden by the shuffle.

use std::future::Future;

use tracing::{Level, debug, instrument};

use crate::{
    bits::index_width,
    channel::Channel,
    secret::{self, SecretBit, SecretBitString, Session},
    shuffle::{Shuffler, ShufflerFactory},
};

/// Marks a union slot for which a party has no row.
pub const NO_VALUE: i64 = -1;

/// Errors that can occur while adapting a union map.
#[derive(Debug)]
pub enum Error {
    /// The union map is empty.
    EmptyUnion,
    /// A slot holds a value that is neither [`NO_VALUE`] nor a non-negative row index.
    InvalidIndex {
        /// The union slot.
        slot: usize,
        /// The value found in the slot.
        value: i64,
    },
    /// The peer's union map has a different size.
    UnionSizeMismatch(usize, usize),
    /// The configured party ids do not match the session.
    PartyMismatch,
    /// An error occurred in the secret-sharing runtime.
    Secret(secret::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::EmptyUnion => f.write_str("The union map must not be empty"),
            Error::InvalidIndex { slot, value } => {
                write!(f, "Union slot {slot} holds the invalid index {value}")
            }
            Error::UnionSizeMismatch(mine, theirs) => {
                write!(f, "Unequal union sizes: {mine} vs {theirs}")
            }
            Error::PartyMismatch => f.write_str("Party ids do not match the session"),
            Error::Secret(e) => write!(f, "{e}"),
        }
    }
}

impl From<secret::Error> for Error {
    fn from(e: secret::Error) -> Self {
        Error::Secret(e)
    }
}

/// Computes a party's intersection map from its union map.
pub trait Adapter {
    /// Both parties call this with union maps of the same size. Entry `i` of the result is the
    /// peer's row index aligned with this party's `i`-th matched row.
    fn adapt(&self, union_map: &[i64]) -> impl Future<Output = Result<Vec<i64>, Error>>;
}

/// Creates one [`Adapter`] per protocol run.
pub trait AdapterFactory {
    /// The adapter created by this factory.
    type Adapter: Adapter;

    /// Creates a fresh adapter.
    fn create(&self) -> Self::Adapter;
}

/// An [`Adapter`] that shuffles the secret-shared union before revealing the matches.
///
/// Row indexes are shared with `max(ceil(log2(union size)), b0, b1)` bits, where `b0` and `b1`
/// are the bit lengths of each party's largest row index. Both parties exchange their bit length
/// in the clear, so each learns a power-of-two bound on the peer's row count. The row counts are
/// public in the data processor anyway.
#[derive(Debug)]
pub struct UnionAdapter<C, S> {
    session: Session<C>,
    am_i_party0: bool,
    party0: usize,
    party1: usize,
    shuffler: S,
}

/// Creates [`UnionAdapter`]s sharing a session and a shuffler factory.
#[derive(Debug)]
pub struct UnionAdapterFactory<C, F> {
    session: Session<C>,
    am_i_party0: bool,
    party0: usize,
    party1: usize,
    shuffler_factory: F,
}

impl<C, F> UnionAdapterFactory<C, F> {
    /// `party0` and `party1` are the ids of both parties in `session`, `am_i_party0` says which
    /// of them this party is.
    pub fn new(
        session: Session<C>,
        am_i_party0: bool,
        party0: usize,
        party1: usize,
        shuffler_factory: F,
    ) -> Self {
        Self {
            session,
            am_i_party0,
            party0,
            party1,
            shuffler_factory,
        }
    }
}

impl<C: Channel, F: ShufflerFactory> AdapterFactory for UnionAdapterFactory<C, F> {
    type Adapter = UnionAdapter<C, F::Shuffler>;

    fn create(&self) -> Self::Adapter {
        UnionAdapter {
            session: self.session.clone(),
            am_i_party0: self.am_i_party0,
            party0: self.party0,
            party1: self.party1,
            shuffler: self.shuffler_factory.create(),
        }
    }
}

/// This party's existence flags and the number of bits needed for its largest row index.
fn existence_flags(union_map: &[i64]) -> Result<(Vec<bool>, usize), Error> {
    let mut bits = 0;
    let mut exists = Vec::with_capacity(union_map.len());
    for (slot, &value) in union_map.iter().enumerate() {
        match value {
            NO_VALUE => exists.push(false),
            0.. => {
                exists.push(true);
                bits = bits.max((i64::BITS - value.leading_zeros()) as usize);
            }
            _ => return Err(Error::InvalidIndex { slot, value }),
        }
    }
    Ok((exists, bits))
}

/// Splits the row indexes into `width` bit planes, LSB first. Empty slots are all zero.
fn index_planes(union_map: &[i64], width: usize) -> Vec<Vec<bool>> {
    (0..width)
        .map(|j| {
            union_map
                .iter()
                .map(|&value| value != NO_VALUE && (value >> j) & 1 == 1)
                .collect()
        })
        .collect()
}

impl<C: Channel, S: Shuffler> UnionAdapter<C, S> {
    fn check_parties(&self) -> Result<(), Error> {
        let (me, peer) = if self.am_i_party0 {
            (self.party0, self.party1)
        } else {
            (self.party1, self.party0)
        };
        if me == self.session.party() && peer == self.session.peer() {
            Ok(())
        } else {
            Err(Error::PartyMismatch)
        }
    }

    /// Shares the planes of both parties, party 0's first.
    async fn share_both(
        &self,
        mine: Vec<Vec<bool>>,
        size: usize,
    ) -> Result<(SecretBitString, SecretBitString), Error> {
        let width = mine.len();
        let session = &self.session;
        Ok(if self.am_i_party0 {
            let p0 = SecretBitString::private_input(session, mine, size).await?;
            let p1 = SecretBitString::peer_input(session, width, size).await?;
            (p0, p1)
        } else {
            let p0 = SecretBitString::peer_input(session, width, size).await?;
            let p1 = SecretBitString::private_input(session, mine, size).await?;
            (p0, p1)
        })
    }
}

impl<C: Channel, S: Shuffler> Adapter for UnionAdapter<C, S> {
    #[instrument(level = Level::DEBUG, skip_all, fields(union_size = union_map.len()), err)]
    async fn adapt(&self, union_map: &[i64]) -> Result<Vec<i64>, Error> {
        let union_size = union_map.len();
        if union_size == 0 {
            return Err(Error::EmptyUnion);
        }
        self.check_parties()?;
        let (exists, bits) = existence_flags(union_map)?;
        let (peer_size, peer_bits): (usize, usize) = self
            .session
            .exchange("union shape", &(union_size, bits))
            .await?;
        if peer_size != union_size {
            return Err(Error::UnionSizeMismatch(union_size, peer_size));
        }
        // widened to fit the largest row index of either party
        let width = index_width(union_size).max(bits).max(peer_bits);
        let planes = index_planes(union_map, width);
        let session = &self.session;

        let (exists0, exists1) = self.share_both(vec![exists], union_size).await?;
        let both_exist = session.and(exists0.plane(0), exists1.plane(0)).await?;
        let (index0, index1) = self.share_both(planes, union_size).await?;

        let bundle: Vec<SecretBit> = std::iter::once(both_exist)
            .chain(index0.into_planes())
            .chain(index1.into_planes())
            .collect();
        let bundle = SecretBitString::from_planes(bundle, union_size)?;
        let shuffled = self.shuffler.shuffle(session, bundle, union_size).await?;
        if shuffled.width() != 2 * width + 1 {
            return Err(secret::Error::WidthMismatch {
                expected: 2 * width + 1,
                actual: shuffled.width(),
            }
            .into());
        }

        let matched = shuffled.slice(0..1).open_to_both(session).await?;
        let matched = matched.into_iter().next().unwrap_or_default();
        let intersection_size = matched.iter().filter(|m| **m).count();
        debug!(intersection_size, "opened matches");

        let compact = |planes: std::ops::Range<usize>| {
            let kept = shuffled.slice(planes).filtered(&matched);
            SecretBitString::from_local_share(session, kept.local_share(), intersection_size)
        };
        let index0 = compact(1..width + 1)?;
        let index1 = compact(width + 1..2 * width + 1)?;
        let to_party1 = index0.open_to_party(session, self.party1).await?;
        let to_party0 = index1.open_to_party(session, self.party0).await?;
        let peer_bits = if self.am_i_party0 { to_party0 } else { to_party1 };
        let peer_bits = peer_bits.ok_or(Error::PartyMismatch)?;

        Ok((0..intersection_size)
            .map(|row| {
                peer_bits
                    .iter()
                    .enumerate()
                    .fold(0i64, |value, (j, plane)| value | ((plane[row] as i64) << j))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_map_is_split_into_planes() {
        let map = [3, NO_VALUE, 0, 4, NO_VALUE];
        let (exists, bits) = existence_flags(&map).unwrap();
        assert_eq!(exists, vec![true, false, true, true, false]);
        assert_eq!(bits, 3);
        let planes = index_planes(&map, 3);
        assert_eq!(planes[0], vec![true, false, false, false, false]);
        assert_eq!(planes[1], vec![true, false, false, false, false]);
        assert_eq!(planes[2], vec![false, false, false, true, false]);
    }

    #[test]
    fn negative_indexes_are_rejected() {
        assert!(matches!(
            existence_flags(&[0, -2]),
            Err(Error::InvalidIndex { slot: 1, value: -2 })
        ));
    }

    #[test]
    fn empty_slots_need_no_bits() {
        assert_eq!(existence_flags(&[NO_VALUE, 0]).unwrap().1, 0);
    }
}
