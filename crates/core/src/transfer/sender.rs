//! Sending side of a file channel

use bytes::Bytes;
use tracing::{debug, info};

use super::{FileSource, TransferDescriptor, TransferFrame};
use crate::capability::{ChannelEvent, ChannelHandle, ChannelOptions, DataChannel};
use crate::config::PeerConfig;
use crate::error::{Error, Result};
use crate::features::{BinaryType, Features};
use crate::session::Session;

/// Split `data` into consecutive slices of at most `size` bytes. The last
/// slice may be short; empty input yields nothing.
pub fn chunks(data: &Bytes, size: usize) -> impl Iterator<Item = Bytes> + '_ {
    let size = size.max(1);
    (0..data.len())
        .step_by(size)
        .map(move |start| data.slice(start..(start + size).min(data.len())))
}

/// Representation used for payload on a new channel. Raw binary unless the
/// remote peer is known to share our preference.
pub fn payload_binary_type(remote: Option<Features>, local: BinaryType) -> BinaryType {
    match remote {
        Some(remote) if remote.binary_type == local => local,
        _ => BinaryType::ArrayBuffer,
    }
}

/// Open a channel for `file` on the session and push it through
pub async fn send_file(session: &Session, file: FileSource, config: &PeerConfig) -> Result<()> {
    let handle = session
        .connection()
        .open_channel(&file.name, ChannelOptions::default())?;

    let binary_type = payload_binary_type(session.remote_features(), config.binary_type);
    handle.channel.set_binary_type(binary_type);
    handle
        .channel
        .set_buffered_amount_low_threshold(config.buffered_amount_low);

    debug!(
        generation = session.generation(),
        label = %file.name,
        binary_type = ?binary_type,
        "Opened file channel"
    );
    send_over(handle, &file.descriptor(), &file.data, config).await
}

/// Wait for the channel to open, then write the descriptor and every chunk
pub async fn send_over(
    mut handle: ChannelHandle,
    descriptor: &TransferDescriptor,
    data: &Bytes,
    config: &PeerConfig,
) -> Result<()> {
    let label = handle.channel.label().to_string();

    loop {
        match handle.events.recv().await {
            Some(ChannelEvent::Open) => break,
            Some(ChannelEvent::Closed) | None => {
                return Err(Error::Channel(format!("channel '{}' closed before opening", label)));
            }
            Some(_) => {}
        }
    }

    let channel = handle.channel.clone();
    channel.send(TransferFrame::Descriptor(descriptor.clone()).encode()?)?;

    let mut sent = 0usize;
    for chunk in chunks(data, config.chunk_size) {
        wait_for_drain(&mut handle, config.buffered_amount_high).await?;
        sent += chunk.len();
        channel.send(TransferFrame::Chunk(chunk).encode()?)?;
    }
    info!(label = %label, bytes = sent, "File sent");

    // Queued messages still go out after close; acknowledgements are not
    // part of the protocol, so nothing is left to read
    channel.close();
    debug!(label = %label, "Closed file channel");
    Ok(())
}

/// Block while more than `high` bytes are queued on the channel
async fn wait_for_drain(handle: &mut ChannelHandle, high: usize) -> Result<()> {
    while handle.channel.buffered_amount() > high {
        debug!(
            label = %handle.channel.label(),
            buffered = handle.channel.buffered_amount(),
            high_watermark = high,
            "Applying backpressure"
        );
        match handle.events.recv().await {
            Some(ChannelEvent::BufferedAmountLow) => {}
            Some(ChannelEvent::Closed) | None => {
                return Err(Error::Channel(format!(
                    "channel '{}' closed during backpressure wait",
                    handle.channel.label()
                )));
            }
            Some(ChannelEvent::Message(message)) => {
                debug!(bytes = message.len(), "Ignoring inbound message on send channel");
            }
            Some(ChannelEvent::Open) => {}
        }
    }
    Ok(())
}
