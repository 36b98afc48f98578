//! Consumer face: one stream to a producer or forwarder. Frames the consumer's
//! interests out, feeds incoming frames back in and drives its clock.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use cnl_core::{
    encode_frame, Consumer, FrameDecodeError, Handler, Name, NodeEvent, OutboundAction, Packet,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::Config;

const READ_CHUNK: usize = 16 * 1024;

type Outcome = Rc<RefCell<Option<Result<Vec<u8>, cnl_core::Error>>>>;

/// Fetch `name` over a TCP connection to `cfg.face_addr`. With `versioned`,
/// discover and fetch the latest version; otherwise fetch `name/seg=N`.
pub async fn fetch(cfg: &Config, name: Name, versioned: bool) -> anyhow::Result<Vec<u8>> {
    let stream = TcpStream::connect(&cfg.face_addr)
        .await
        .with_context(|| format!("connect to {}", cfg.face_addr))?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    fetch_over(cfg, reader, writer, name, versioned).await
}

/// Run one object fetch over any byte stream until the object's node gets
/// content or fails.
pub async fn fetch_over<R, W>(
    cfg: &Config,
    mut reader: R,
    mut writer: W,
    name: Name,
    versioned: bool,
) -> anyhow::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut consumer = Consumer::with_config(cfg.consumer.clone());
    let node = consumer.resolve(&name)?;
    let outcome: Outcome = Rc::default();
    let sink = outcome.clone();
    consumer.add_listener(node, move |n| {
        let result = match &n.event {
            NodeEvent::ContentSet(c) => {
                if c.meta.encrypted {
                    warn!(name = %n.name, "object is encrypted, returning ciphertext");
                }
                Ok(c.bytes.clone())
            }
            NodeEvent::Failed(e) => Err((*e).clone()),
            _ => return,
        };
        sink.borrow_mut().get_or_insert(result);
    })?;

    let handler = if versioned {
        Handler::generalized()
    } else {
        Handler::segmented()
    };
    info!(%name, versioned, "fetching");
    let mut actions = consumer.set_handler(node, handler)?;
    let mut ticker = tokio::time::interval(Duration::from_millis(cfg.tick_ms));
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        send_actions(&mut writer, actions).await?;
        let done = outcome.borrow_mut().take();
        if let Some(result) = done {
            send_actions(&mut writer, consumer.shutdown()).await?;
            let bytes = result?;
            info!(%name, len = bytes.len(), "fetched");
            return Ok(bytes);
        }
        actions = tokio::select! {
            n = reader.read(&mut chunk) => {
                let n = n?;
                if n == 0 {
                    anyhow::bail!("face closed before {name} completed");
                }
                buf.extend_from_slice(&chunk[..n]);
                drain_frames(&mut consumer, &mut buf)?
            }
            _ = ticker.tick() => consumer.tick(),
        };
    }
}

/// Hand every complete frame in `buf` to the consumer, keeping any partial tail.
fn drain_frames(consumer: &mut Consumer, buf: &mut Vec<u8>) -> anyhow::Result<Vec<OutboundAction>> {
    let mut actions = Vec::new();
    loop {
        match consumer.on_packet(buf) {
            Ok((used, more)) => {
                buf.drain(..used);
                actions.extend(more);
            }
            Err(FrameDecodeError::NeedMore) => return Ok(actions),
            Err(e) => return Err(e.into()),
        }
    }
}

async fn send_actions<W: AsyncWrite + Unpin>(
    writer: &mut W,
    actions: Vec<OutboundAction>,
) -> anyhow::Result<()> {
    if actions.is_empty() {
        return Ok(());
    }
    for action in actions {
        match action {
            OutboundAction::ExpressInterest { token, interest } => {
                debug!(?token, name = %interest.name, "express");
                writer.write_all(&encode_frame(&Packet::Interest(interest))?).await?;
            }
            // Stream faces have no cancel; a late answer is dropped as unsolicited.
            OutboundAction::CancelInterest(token) => debug!(?token, "cancel"),
        }
    }
    writer.flush().await?;
    Ok(())
}
