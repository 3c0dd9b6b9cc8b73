//! Receiving side of a file channel

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tracing::{debug, info, warn};

use super::{ReceivedFile, TransferDescriptor, TransferFrame};
use crate::capability::{ChannelEvent, ChannelHandle, ChannelMessage};
use crate::error::{Error, Result};

/// Outcome of feeding one message to a [`Reassembler`]
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Pending,
    Complete(ReceivedFile),
}

/// Reassembly buffer for one inbound file channel
#[derive(Debug)]
pub struct Reassembler {
    label: String,
    descriptor: Option<TransferDescriptor>,
    /// Descriptor came as text: chunks are untagged binary
    legacy: bool,
    chunks: Vec<Bytes>,
    received: u64,
    done: bool,
}

impl Reassembler {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            descriptor: None,
            legacy: false,
            chunks: Vec::new(),
            received: 0,
            done: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn descriptor(&self) -> Option<&TransferDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn received_bytes(&self) -> u64 {
        self.received
    }

    pub fn accept(&mut self, message: ChannelMessage) -> Result<Progress> {
        if self.done {
            return Err(Error::Protocol(format!(
                "message after completion on channel '{}'",
                self.label
            )));
        }

        let frame = match message {
            // Once described, text is payload like everything else
            ChannelMessage::Text(text) if self.descriptor.is_some() => {
                TransferFrame::Chunk(Bytes::from(text))
            }
            ChannelMessage::Binary(bytes) if self.legacy => TransferFrame::Chunk(bytes),
            ChannelMessage::Text(_) => {
                self.legacy = true;
                TransferFrame::decode(message)?
            }
            message => TransferFrame::decode(message)?,
        };

        match frame {
            TransferFrame::Descriptor(descriptor) => {
                if self.descriptor.is_some() {
                    return Err(Error::Protocol(format!(
                        "duplicate descriptor on channel '{}'",
                        self.label
                    )));
                }
                debug!(label = %self.label, name = %descriptor.name, size = descriptor.size, "Transfer descriptor received");
                self.descriptor = Some(descriptor);
            }
            TransferFrame::Chunk(chunk) => {
                self.received += chunk.len() as u64;
                self.chunks.push(chunk);
            }
        }

        // Completion math needs the descriptor
        let Some(expected) = self.descriptor.as_ref().map(|d| d.size) else {
            return Ok(Progress::Pending);
        };
        if self.received > expected {
            let received = self.received;
            self.discard();
            return Err(Error::TransferOverflow { received, expected });
        }
        if self.received < expected {
            return Ok(Progress::Pending);
        }

        let mut data = BytesMut::with_capacity(expected as usize);
        for chunk in self.chunks.drain(..) {
            data.extend_from_slice(&chunk);
        }
        self.done = true;
        let descriptor = self.descriptor.take().ok_or_else(|| {
            Error::Protocol(format!("descriptor missing on channel '{}'", self.label))
        })?;
        Ok(Progress::Complete(ReceivedFile {
            descriptor,
            data: data.freeze(),
            received_at: Utc::now(),
        }))
    }

    fn discard(&mut self) {
        self.chunks.clear();
        self.descriptor = None;
        self.done = true;
    }
}

/// Read one file off an inbound channel. With an idle timeout the transfer
/// is abandoned once no message arrives for that long.
pub async fn receive_file(mut handle: ChannelHandle, idle_timeout: Option<Duration>) -> Result<ReceivedFile> {
    let mut reassembler = Reassembler::new(handle.channel.label());

    loop {
        let event = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, handle.events.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    warn!(
                        label = %reassembler.label(),
                        received = reassembler.received_bytes(),
                        "Transfer stalled, evicting"
                    );
                    handle.channel.close();
                    return Err(Error::TransferStalled {
                        label: reassembler.label().to_string(),
                        received: reassembler.received_bytes(),
                    });
                }
            },
            None => handle.events.recv().await,
        };

        match event {
            Some(ChannelEvent::Message(message)) => {
                if let Progress::Complete(file) = reassembler.accept(message)? {
                    info!(label = %reassembler.label(), name = %file.name(), bytes = file.data.len(), "File received");
                    return Ok(file);
                }
            }
            Some(ChannelEvent::Open) | Some(ChannelEvent::BufferedAmountLow) => {}
            Some(ChannelEvent::Closed) | None => {
                return Err(Error::Channel(format!(
                    "channel '{}' closed after {} bytes",
                    reassembler.label(),
                    reassembler.received_bytes()
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChannel;
    use crate::transfer::FileSource;

    fn descriptor_frame(name: &str, size: u64) -> ChannelMessage {
        TransferFrame::Descriptor(TransferDescriptor {
            name: name.to_string(),
            size,
            mime_type: "application/octet-stream".to_string(),
        })
        .encode()
        .unwrap()
    }

    fn chunk_frame(data: &[u8]) -> ChannelMessage {
        TransferFrame::Chunk(Bytes::copy_from_slice(data)).encode().unwrap()
    }

    #[test]
    fn test_completes_exactly_at_declared_size() {
        let mut reassembler = Reassembler::new("f");
        assert_eq!(reassembler.accept(descriptor_frame("f", 20000)).unwrap(), Progress::Pending);
        assert_eq!(reassembler.accept(chunk_frame(&[1; 8192])).unwrap(), Progress::Pending);
        assert_eq!(reassembler.accept(chunk_frame(&[2; 8192])).unwrap(), Progress::Pending);

        let Progress::Complete(file) = reassembler.accept(chunk_frame(&[3; 3616])).unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(file.data.len(), 20000);
        assert_eq!(file.data[8192], 2);
        assert_eq!(file.data[19999], 3);
    }

    #[test]
    fn test_zero_byte_file_completes_on_descriptor() {
        let mut reassembler = Reassembler::new("empty");
        let progress = reassembler.accept(descriptor_frame("empty", 0)).unwrap();
        assert!(matches!(progress, Progress::Complete(file) if file.data.is_empty()));
    }

    #[test]
    fn test_chunks_before_descriptor_wait() {
        let mut reassembler = Reassembler::new("early");
        assert_eq!(reassembler.accept(chunk_frame(b"abc")).unwrap(), Progress::Pending);
        assert_eq!(reassembler.received_bytes(), 3);
        assert!(reassembler.descriptor().is_none());

        let Progress::Complete(file) = reassembler.accept(descriptor_frame("early", 3)).unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(&file.data[..], b"abc");
    }

    #[test]
    fn test_overflow_is_rejected() {
        let mut reassembler = Reassembler::new("f");
        reassembler.accept(descriptor_frame("f", 4)).unwrap();
        let err = reassembler.accept(chunk_frame(b"too long")).unwrap_err();
        assert!(matches!(err, Error::TransferOverflow { received: 8, expected: 4 }));

        // buffer is gone
        assert!(reassembler.accept(chunk_frame(b"x")).is_err());
    }

    #[test]
    fn test_duplicate_descriptor() {
        let mut reassembler = Reassembler::new("f");
        reassembler.accept(descriptor_frame("f", 10)).unwrap();
        assert!(matches!(
            reassembler.accept(descriptor_frame("f", 10)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_legacy_text_descriptor_and_raw_chunks() {
        let mut reassembler = Reassembler::new("old.txt");
        let descriptor = ChannelMessage::Text(r#"{"name":"old.txt","size":5,"type":"text/plain"}"#.into());
        assert_eq!(reassembler.accept(descriptor).unwrap(), Progress::Pending);

        // untagged payload, even if it starts with a tag byte
        let progress = reassembler
            .accept(ChannelMessage::Binary(Bytes::from_static(&[0x01, b'e', b'l', b'l', b'o'])))
            .unwrap();
        let Progress::Complete(file) = progress else {
            panic!("expected completion");
        };
        assert_eq!(&file.data[..], &[0x01, b'e', b'l', b'l', b'o']);
        assert_eq!(file.mime_type(), "text/plain");
    }

    #[test]
    fn test_text_after_descriptor_is_payload() {
        let mut reassembler = Reassembler::new("t");
        let descriptor = ChannelMessage::Text(r#"{"name":"t","size":10,"type":"text/plain"}"#.into());
        reassembler.accept(descriptor).unwrap();

        assert_eq!(reassembler.accept(ChannelMessage::Text("hello".into())).unwrap(), Progress::Pending);
        assert_eq!(reassembler.received_bytes(), 5);

        // starts like a descriptor, still counted as bytes
        let Progress::Complete(file) = reassembler.accept(ChannelMessage::Text(r#"{"x"}"#.into())).unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(&file.data[..], br#"hello{"x"}"#);
    }

    #[test]
    fn test_text_after_tagged_descriptor_is_payload() {
        let mut reassembler = Reassembler::new("t");
        reassembler.accept(descriptor_frame("t", 5)).unwrap();

        let Progress::Complete(file) = reassembler.accept(ChannelMessage::Text("hello".into())).unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(&file.data[..], b"hello");
    }

    #[tokio::test]
    async fn test_stalled_transfer_is_evicted() {
        let (tx, rx) = MockChannel::pair_detached("slow");
        tx.channel.send(descriptor_frame("slow", 100)).unwrap();
        tx.channel.send(chunk_frame(&[0; 10])).unwrap();

        let err = receive_file(rx, Some(Duration::from_millis(50))).await.unwrap_err();
        assert!(matches!(
            err,
            Error::TransferStalled { ref label, received: 10 } if label == "slow"
        ));
    }

    #[tokio::test]
    async fn test_close_before_completion() {
        let (tx, rx) = MockChannel::pair_detached("cut");
        let file = FileSource::new("cut", "", Bytes::from_static(b"0123456789"));
        tx.channel
            .send(TransferFrame::Descriptor(file.descriptor()).encode().unwrap())
            .unwrap();
        tx.channel.send(chunk_frame(b"01234")).unwrap();
        tx.channel.close();

        let err = receive_file(rx, None).await.unwrap_err();
        assert!(matches!(err, Error::Channel(_)));
    }
}
