use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Error, bail};
use polyudp::channel::Channel;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
    time::sleep,
};
use tracing::{info, warn};

/// Messages are split into chunks of at most this many bytes.
const CHUNK_SIZE: usize = 100 * 1024 * 1024;

/// A TCP connection to a single peer, sending each message as length-prefixed chunks.
pub struct TcpChannel {
    peer: usize,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpChannel {
    /// Party 0 waits for the peer on `addr`, party 1 connects to it.
    pub async fn connect(party: usize, addr: SocketAddr) -> Result<Self, Error> {
        let stream = match party {
            0 => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Could not listen on {addr}"))?;
                info!("Waiting for party 1 on {addr}...");
                let (stream, from) = listener.accept().await?;
                info!("Party 1 connected from {from}");
                stream
            }
            1 => {
                let mut retries = 0;
                loop {
                    match TcpStream::connect(addr).await {
                        Ok(stream) => break stream,
                        // retry for 10 minutes
                        Err(e) if retries < 10 * 60 => {
                            retries += 1;
                            warn!("Could not reach party 0 at {addr}: {e}");
                            sleep(Duration::from_secs(1)).await;
                        }
                        Err(e) => return Err(e).context("Giving up on party 0"),
                    }
                }
            }
            _ => bail!("Party must be 0 or 1, but is {party}"),
        };
        Self::from_stream(1 - party, stream)
    }

    fn from_stream(peer: usize, stream: TcpStream) -> Result<Self, Error> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            peer,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }
}

impl Channel for TcpChannel {
    type SendError = Error;
    type RecvError = Error;

    async fn send_bytes_to(&self, p: usize, msg: Vec<u8>, phase: &str) -> Result<(), Error> {
        if p != self.peer {
            bail!("Unknown party {p}");
        }
        let mut chunks: Vec<_> = msg.chunks(CHUNK_SIZE).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        let length = u32::try_from(chunks.len())?;
        let mut writer = self.writer.lock().await;
        for (i, chunk) in chunks.into_iter().enumerate() {
            writer.write_u32(i as u32).await?;
            writer.write_u32(length).await?;
            writer.write_u64(chunk.len() as u64).await?;
            writer.write_all(chunk).await?;
        }
        writer
            .flush()
            .await
            .with_context(|| format!("Sending {phase}"))
    }

    async fn recv_bytes_from(&self, p: usize, phase: &str) -> Result<Vec<u8>, Error> {
        if p != self.peer {
            bail!("Unknown party {p}");
        }
        let mut reader = self.reader.lock().await;
        let mut msg = vec![];
        loop {
            let i = reader
                .read_u32()
                .await
                .with_context(|| format!("Receiving {phase}"))?;
            let length = reader.read_u32().await?;
            let len = usize::try_from(reader.read_u64().await?)?;
            if len > CHUNK_SIZE {
                bail!("Chunk {i} of {phase} has {len} bytes, more than {CHUNK_SIZE}");
            }
            let start = msg.len();
            msg.resize(start + len, 0);
            reader.read_exact(&mut msg[start..]).await?;
            if i + 1 >= length {
                break Ok(msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, client.unwrap())
    }

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let (a, b) = connected().await;
        let a = TcpChannel::from_stream(1, a).unwrap();
        let b = TcpChannel::from_stream(0, b).unwrap();
        a.send_bytes_to(1, vec![1, 2, 3], "first").await.unwrap();
        a.send_bytes_to(1, vec![], "empty").await.unwrap();
        assert_eq!(b.recv_bytes_from(0, "first").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(b.recv_bytes_from(0, "empty").await.unwrap(), Vec::<u8>::new());
        assert!(b.recv_bytes_from(1, "unknown").await.is_err());
    }

    #[tokio::test]
    async fn oversized_chunks_are_rejected() {
        let (a, mut raw) = connected().await;
        let a = TcpChannel::from_stream(1, a).unwrap();
        raw.write_u32(0).await.unwrap();
        raw.write_u32(1).await.unwrap();
        raw.write_u64(CHUNK_SIZE as u64 + 1).await.unwrap();
        raw.flush().await.unwrap();
        let err = a.recv_bytes_from(1, "rows").await.unwrap_err();
        assert!(err.to_string().contains("more than"));
    }
}
