//! A communication channel used to send/receive messages to/from another party.

use std::{fmt, future::Future, time::Duration};

use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    sync::{
        Mutex,
        mpsc::{Receiver, Sender, channel, error::SendError},
    },
    time::timeout,
};
use tracing::trace;

/// Errors related to sending / receiving / (de-)serializing messages.
#[derive(Debug)]
pub struct Error {
    /// The protocol phase during which the error occurred.
    pub phase: String,
    /// The specific error that was raised.
    pub reason: ErrorKind,
}

/// The specific error that occurred when trying to send / receive a message.
#[derive(Debug)]
pub enum ErrorKind {
    /// The (serialized) message could not be received over the channel.
    RecvError(String),
    /// The (serialized) message could not be sent over the channel.
    SendError(String),
    /// The message could not be serialized (before sending it out).
    SerdeError(String),
    /// The message is a Vec, but not of the expected length.
    InvalidLength {
        /// The length the receiver expected.
        expected: usize,
        /// The length that was actually received.
        actual: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            ErrorKind::RecvError(e) => write!(f, "could not receive {}: {e}", self.phase),
            ErrorKind::SendError(e) => write!(f, "could not send {}: {e}", self.phase),
            ErrorKind::SerdeError(e) => write!(f, "could not (de-)serialize {}: {e}", self.phase),
            ErrorKind::InvalidLength { expected, actual } => write!(
                f,
                "expected {expected} elements during {}, but received {actual}",
                self.phase
            ),
        }
    }
}

impl std::error::Error for Error {}

/// A communication channel used to send/receive messages to/from another party.
///
/// Both parties of a pairwise protocol and the trusted dealer talk through this trait, so that
/// the same protocol code runs over in-memory queues in tests and over sockets in production.
pub trait Channel {
    /// The error that can occur sending messages over the channel.
    type SendError: fmt::Debug;
    /// The error that can occur receiving messages over the channel.
    type RecvError: fmt::Debug;

    /// Sends a message to the party with the given index (must be between `0..participants`).
    fn send_bytes_to(
        &self,
        party: usize,
        msg: Vec<u8>,
        phase: &str,
    ) -> impl Future<Output = Result<(), Self::SendError>> + Send;

    /// Awaits a response from the party with the given index (must be between `0..participants`).
    fn recv_bytes_from(
        &self,
        party: usize,
        phase: &str,
    ) -> impl Future<Output = Result<Vec<u8>, Self::RecvError>> + Send;
}

/// Serializes and sends a message to the other party.
pub async fn send_to(
    channel: &impl Channel,
    party: usize,
    phase: &str,
    msg: &impl Serialize,
) -> Result<(), Error> {
    send_counted(channel, party, phase, msg).await.map(|_| ())
}

/// Like [`send_to`], returning the number of bytes sent.
pub(crate) async fn send_counted(
    channel: &impl Channel,
    party: usize,
    phase: &str,
    msg: &impl Serialize,
) -> Result<usize, Error> {
    let msg = bincode::serialize(msg).map_err(|e| Error {
        phase: format!("sending {phase}"),
        reason: ErrorKind::SerdeError(format!("{e:?}")),
    })?;
    let bytes = msg.len();
    trace!(party, phase, bytes, "send");
    channel
        .send_bytes_to(party, msg, phase)
        .await
        .map_err(|e| Error {
            phase: phase.to_string(),
            reason: ErrorKind::SendError(format!("{e:?}")),
        })?;
    Ok(bytes)
}

/// Receives and deserializes a message from the other party.
pub async fn recv_from<T: DeserializeOwned>(
    channel: &impl Channel,
    party: usize,
    phase: &str,
) -> Result<T, Error> {
    recv_counted(channel, party, phase).await.map(|(v, _)| v)
}

/// Like [`recv_from`], also returning the number of bytes received.
pub(crate) async fn recv_counted<T: DeserializeOwned>(
    channel: &impl Channel,
    party: usize,
    phase: &str,
) -> Result<(T, usize), Error> {
    let msg = channel
        .recv_bytes_from(party, phase)
        .await
        .map_err(|e| Error {
            phase: phase.to_string(),
            reason: ErrorKind::RecvError(format!("{e:?}")),
        })?;
    trace!(party, phase, bytes = msg.len(), "recv");
    let value = bincode::deserialize(&msg).map_err(|e| Error {
        phase: format!("receiving {phase}"),
        reason: ErrorKind::SerdeError(format!("{e:?}")),
    })?;
    Ok((value, msg.len()))
}

/// Receives and deserializes a Vec from the other party (while checking the length).
pub async fn recv_vec_from<T: DeserializeOwned>(
    channel: &impl Channel,
    party: usize,
    phase: &str,
    len: usize,
) -> Result<Vec<T>, Error> {
    let v: Vec<T> = recv_from(channel, party, phase).await?;
    check_len(v, phase, len)
}

pub(crate) fn check_len<T>(v: Vec<T>, phase: &str, len: usize) -> Result<Vec<T>, Error> {
    if v.len() == len {
        Ok(v)
    } else {
        Err(Error {
            phase: phase.to_string(),
            reason: ErrorKind::InvalidLength {
                expected: len,
                actual: v.len(),
            },
        })
    }
}

/// A simple in-memory channel using [`Sender`] and [`Receiver`].
#[derive(Debug)]
pub struct SimpleChannel {
    s: Vec<Option<Sender<Vec<u8>>>>,
    r: Vec<Option<Mutex<Receiver<Vec<u8>>>>>,
}

impl SimpleChannel {
    /// Creates channels for N parties to communicate with each other.
    pub fn channels(parties: usize) -> Vec<Self> {
        let buffer_capacity = 1024;
        let mut channels: Vec<_> = (0..parties)
            .map(|_| SimpleChannel {
                s: (0..parties).map(|_| None).collect(),
                r: (0..parties).map(|_| None).collect(),
            })
            .collect();
        for a in 0..parties {
            for b in (a + 1)..parties {
                let (send_a_to_b, recv_a_to_b) = channel(buffer_capacity);
                let (send_b_to_a, recv_b_to_a) = channel(buffer_capacity);
                channels[a].s[b] = Some(send_a_to_b);
                channels[b].s[a] = Some(send_b_to_a);
                channels[a].r[b] = Some(Mutex::new(recv_b_to_a));
                channels[b].r[a] = Some(Mutex::new(recv_a_to_b));
            }
        }
        channels
    }
}

/// The error raised by `send` calls of a [`SimpleChannel`].
#[derive(Debug)]
pub enum AsyncSendError {
    /// There is no connection to the given party.
    UnknownParty(usize),
    /// The receiving side has been dropped.
    Closed(SendError<Vec<u8>>),
}

/// The error raised by `recv` calls of a [`SimpleChannel`].
#[derive(Debug)]
pub enum AsyncRecvError {
    /// There is no connection to the given party.
    UnknownParty(usize),
    /// The channel has been closed.
    Closed,
    /// No message was received before the timeout.
    TimeoutElapsed,
    /// A chunk did not carry a valid header.
    MalformedChunk,
}

const CHUNK_SIZE: usize = 100 * 1024 * 1024;
const HEADER_SIZE: usize = 2 * 4;

impl Channel for SimpleChannel {
    type SendError = AsyncSendError;
    type RecvError = AsyncRecvError;

    async fn send_bytes_to(
        &self,
        p: usize,
        msg: Vec<u8>,
        phase: &str,
    ) -> Result<(), AsyncSendError> {
        let sender = self
            .s
            .get(p)
            .and_then(Option::as_ref)
            .ok_or(AsyncSendError::UnknownParty(p))?;
        let mut chunks: Vec<_> = msg.chunks(CHUNK_SIZE).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        let length = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            if length > 1 {
                trace!("  (sending chunk {}/{} of {phase} to party {p})", i + 1, length);
            }
            let mut msg = Vec::with_capacity(HEADER_SIZE + chunk.len());
            msg.extend((i as u32).to_be_bytes());
            msg.extend((length as u32).to_be_bytes());
            msg.extend(chunk);
            sender.send(msg).await.map_err(AsyncSendError::Closed)?;
        }
        Ok(())
    }

    async fn recv_bytes_from(&self, p: usize, _phase: &str) -> Result<Vec<u8>, AsyncRecvError> {
        let mut receiver = self
            .r
            .get(p)
            .and_then(Option::as_ref)
            .ok_or(AsyncRecvError::UnknownParty(p))?
            .lock()
            .await;
        let mut msg: Vec<u8> = vec![];
        loop {
            let chunk = match timeout(Duration::from_secs(10 * 60), receiver.recv()).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return Err(AsyncRecvError::Closed),
                Err(_) => return Err(AsyncRecvError::TimeoutElapsed),
            };
            if chunk.len() < HEADER_SIZE {
                return Err(AsyncRecvError::MalformedChunk);
            }
            let i = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let length = u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            msg.extend(&chunk[HEADER_SIZE..]);
            if i + 1 >= length {
                break Ok(msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_arrive_in_order_per_party() {
        let [a, b, c]: [SimpleChannel; 3] = SimpleChannel::channels(3).try_into().unwrap();
        send_to(&a, 1, "first", &vec![1u32, 2, 3]).await.unwrap();
        send_to(&a, 1, "second", &7u64).await.unwrap();
        send_to(&c, 1, "third", &"hello".to_string()).await.unwrap();

        let first: Vec<u32> = recv_vec_from(&b, 0, "first", 3).await.unwrap();
        let second: u64 = recv_from(&b, 0, "second").await.unwrap();
        let third: String = recv_from(&b, 2, "third").await.unwrap();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(second, 7);
        assert_eq!(third, "hello");
    }

    #[tokio::test]
    async fn wrong_vec_length_is_rejected() {
        let [a, b]: [SimpleChannel; 2] = SimpleChannel::channels(2).try_into().unwrap();
        send_to(&a, 1, "rows", &vec![0u8; 4]).await.unwrap();
        let err = recv_vec_from::<u8>(&b, 0, "rows", 5).await.unwrap_err();
        assert!(matches!(
            err.reason,
            ErrorKind::InvalidLength {
                expected: 5,
                actual: 4
            }
        ));
    }

    #[tokio::test]
    async fn counted_bytes_match_on_both_sides() {
        let [a, b]: [SimpleChannel; 2] = SimpleChannel::channels(2).try_into().unwrap();
        let sent = send_counted(&a, 1, "rows", &vec![7u8; 5]).await.unwrap();
        let (rows, received): (Vec<u8>, _) = recv_counted(&b, 0, "rows").await.unwrap();
        assert_eq!(rows, vec![7; 5]);
        // bincode prefixes the vec with its u64 length
        assert_eq!(sent, 8 + 5);
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn no_self_connection() {
        let [a, _b]: [SimpleChannel; 2] = SimpleChannel::channels(2).try_into().unwrap();
        let err = send_to(&a, 0, "self", &1u8).await.unwrap_err();
        assert!(matches!(err.reason, ErrorKind::SendError(_)));
    }
}
