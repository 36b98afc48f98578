//! Producer: answer interests from an in-memory packet table over TCP.

use std::net::SocketAddr;
use std::sync::Arc;

use cnl_core::producer::ProducerStore;
use cnl_core::{decode_frame, encode_frame, FrameDecodeError, Packet};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

const READ_CHUNK: usize = 16 * 1024;

/// Accept connections on `port` and answer each one's interests from `store`.
pub async fn run_producer(store: Arc<ProducerStore>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, packets = store.len(), "producer listening");
    loop {
        let (stream, peer): (_, SocketAddr) = listener.accept().await?;
        let store = store.clone();
        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            match answer_interests(stream, &store).await {
                Ok(()) => debug!(%peer, "connection closed"),
                Err(e) => debug!(%peer, error = %e, "connection dropped"),
            }
        });
    }
}

/// Read interest frames until EOF, writing back a data frame for each one the
/// store can satisfy. Unanswerable interests get no reply and time out.
pub async fn answer_interests<S>(mut stream: S, store: &ProducerStore) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        loop {
            let (packet, used) = match decode_frame(&buf) {
                Ok(decoded) => decoded,
                Err(FrameDecodeError::NeedMore) => break,
                Err(e) => return Err(e.into()),
            };
            buf.drain(..used);
            let Packet::Interest(interest) = packet else {
                debug!("producer ignores data");
                continue;
            };
            match store.answer(&interest) {
                Some(data) => {
                    debug!(interest = %interest.name, data = %data.name, "answer");
                    stream
                        .write_all(&encode_frame(&Packet::Data(data.clone()))?)
                        .await?;
                }
                None => debug!(name = %interest.name, "no match"),
            }
        }
        stream.flush().await?;
    }
}
