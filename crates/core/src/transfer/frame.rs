//! Transfer channel framing
//!
//! Binary messages carry a one-byte tag: `[0x01][descriptor JSON]` or
//! `[0x02][chunk bytes]`. A text message is a bare JSON descriptor, as sent
//! by peers that predate the tagged envelope.

use bytes::{BufMut, Bytes, BytesMut};

use super::TransferDescriptor;
use crate::capability::ChannelMessage;
use crate::error::{Error, Result};

pub const DESCRIPTOR_TAG: u8 = 0x01;
pub const CHUNK_TAG: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFrame {
    Descriptor(TransferDescriptor),
    Chunk(Bytes),
}

impl TransferFrame {
    pub fn encode(&self) -> Result<ChannelMessage> {
        let bytes = match self {
            TransferFrame::Descriptor(descriptor) => {
                let json = serde_json::to_vec(descriptor)?;
                tagged(DESCRIPTOR_TAG, &json)
            }
            TransferFrame::Chunk(chunk) => tagged(CHUNK_TAG, chunk),
        };
        Ok(ChannelMessage::Binary(bytes))
    }

    pub fn decode(message: ChannelMessage) -> Result<Self> {
        match message {
            ChannelMessage::Text(text) => Ok(TransferFrame::Descriptor(serde_json::from_str(&text)?)),
            ChannelMessage::Binary(bytes) => {
                let Some(&tag) = bytes.first() else {
                    return Err(Error::Protocol("empty transfer frame".into()));
                };
                let body = bytes.slice(1..);
                match tag {
                    DESCRIPTOR_TAG => Ok(TransferFrame::Descriptor(serde_json::from_slice(&body)?)),
                    CHUNK_TAG => Ok(TransferFrame::Chunk(body)),
                    other => Err(Error::Protocol(format!("unknown frame tag {:#04x}", other))),
                }
            }
        }
    }
}

fn tagged(tag: u8, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(1 + payload.len());
    frame.put_u8(tag);
    frame.extend_from_slice(payload);
    frame.freeze()
}
