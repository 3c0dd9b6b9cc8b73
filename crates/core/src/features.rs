//! Feature channel
//!
//! Both peers open the same negotiated channel (fixed id, no offer/answer
//! round trip needed for it). On open each side sends its capability
//! descriptor once; the first message received is recorded on the session
//! and nothing after it is read.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capability::{ChannelEvent, ChannelHandle, ChannelMessage, ChannelOptions};
use crate::error::{Error, Result};
use crate::session::Session;

pub const FEATURES_CHANNEL_LABEL: &str = "features";
pub const FEATURES_CHANNEL_ID: u16 = 50;

/// Binary representation for payload chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryType {
    Blob,
    ArrayBuffer,
}

/// Capability descriptor exchanged on the feature channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    pub binary_type: BinaryType,
}

impl Features {
    pub fn new(binary_type: BinaryType) -> Self {
        Self { binary_type }
    }

    pub fn to_message(self) -> Result<ChannelMessage> {
        Ok(ChannelMessage::Text(serde_json::to_string(&self)?))
    }

    pub fn from_message(message: &ChannelMessage) -> Result<Self> {
        match message {
            ChannelMessage::Text(text) => Ok(serde_json::from_str(text)?),
            ChannelMessage::Binary(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

/// Open the feature channel on a session and run the one-shot handshake in
/// the background.
pub fn establish(session: &Arc<Session>, local: Features) -> Result<()> {
    let handle = session
        .connection()
        .open_channel(
            FEATURES_CHANNEL_LABEL,
            ChannelOptions::negotiated(FEATURES_CHANNEL_ID),
        )
        .map_err(|e| Error::Channel(format!("cannot open feature channel: {}", e)))?;

    tokio::spawn(run_handshake(handle, Arc::downgrade(session), local));
    Ok(())
}

async fn run_handshake(mut handle: ChannelHandle, session: Weak<Session>, local: Features) {
    while let Some(event) = handle.events.recv().await {
        match event {
            ChannelEvent::Open => {
                let sent = local
                    .to_message()
                    .and_then(|message| handle.channel.send(message));
                if let Err(e) = sent {
                    warn!(error = %e, "Failed to send local features");
                }
            }
            ChannelEvent::Message(message) => {
                match Features::from_message(&message) {
                    Ok(remote) => {
                        // A discarded session simply drops the result
                        if let Some(session) = session.upgrade() {
                            if session.record_remote_features(remote) {
                                debug!(
                                    generation = session.generation(),
                                    binary_type = ?remote.binary_type,
                                    "Recorded remote features"
                                );
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Malformed remote features"),
                }
                break;
            }
            ChannelEvent::Closed => break,
            ChannelEvent::BufferedAmountLow => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ConnectionEvents, ConnectionFactory, DataChannel};
    use crate::config::PeerConfig;
    use crate::mock::{MockChannel, MockConnection, MockNetwork};
    use crate::transfer::{self, FileSource};
    use std::time::Duration;

    fn session(network: &MockNetwork) -> (Arc<Session>, Arc<MockConnection>, ConnectionEvents) {
        let factory = network.factory();
        let (connection, events) = factory.create().unwrap();
        let mock = factory.latest().unwrap();
        (Arc::new(Session::new(1, connection)), mock, events)
    }

    async fn connect(offerer: &Session, answerer: &Session) {
        let offer = offerer.connection().set_local_description().await.unwrap();
        answerer.connection().apply_remote_description(offer).await.unwrap();
        let answer = answerer.connection().set_local_description().await.unwrap();
        offerer.connection().apply_remote_description(answer).await.unwrap();
    }

    async fn remote_features(session: &Session) -> Features {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(features) = session.remote_features() {
                    return features;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no remote features recorded")
    }

    #[tokio::test]
    async fn test_handshake_records_remote_features() {
        let network = MockNetwork::new();
        let (a, _, _a_events) = session(&network);
        let (b, _, _b_events) = session(&network);
        establish(&a, Features::new(BinaryType::Blob)).unwrap();
        establish(&b, Features::new(BinaryType::ArrayBuffer)).unwrap();
        assert!(a.remote_features().is_none());

        connect(&a, &b).await;

        assert_eq!(remote_features(&a).await.binary_type, BinaryType::ArrayBuffer);
        assert_eq!(remote_features(&b).await.binary_type, BinaryType::Blob);
    }

    #[tokio::test]
    async fn test_only_first_message_counts() {
        let network = MockNetwork::new();
        let (session, _, _events) = session(&network);
        let (ours, mut theirs) = MockChannel::pair_detached(FEATURES_CHANNEL_LABEL);

        let handshake = tokio::spawn(run_handshake(
            ours,
            Arc::downgrade(&session),
            Features::new(BinaryType::Blob),
        ));
        let first = Features::new(BinaryType::ArrayBuffer).to_message().unwrap();
        let second = Features::new(BinaryType::Blob).to_message().unwrap();
        theirs.channel.send(first).unwrap();
        let _ = theirs.channel.send(second);
        handshake.await.unwrap();

        assert_eq!(
            session.remote_features(),
            Some(Features::new(BinaryType::ArrayBuffer))
        );

        // our side advertised once, on open
        assert_eq!(theirs.events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(
            theirs.events.recv().await,
            Some(ChannelEvent::Message(ChannelMessage::Text(
                r#"{"binaryType":"blob"}"#.to_string()
            )))
        );
    }

    #[tokio::test]
    async fn test_send_file_follows_recorded_preference() {
        let network = MockNetwork::new();
        let (a, a_conn, _a_events) = session(&network);
        let (b, _, _b_events) = session(&network);
        establish(&a, Features::new(BinaryType::Blob)).unwrap();
        establish(&b, Features::new(BinaryType::Blob)).unwrap();
        connect(&a, &b).await;
        remote_features(&a).await;

        let blob = PeerConfig {
            binary_type: BinaryType::Blob,
            ..PeerConfig::default()
        };
        transfer::send_file(&a, FileSource::new("shared.txt", "text/plain", "hi"), &blob)
            .await
            .unwrap();
        // remote prefers blob, we do not
        transfer::send_file(&a, FileSource::new("raw.txt", "text/plain", "hi"), &PeerConfig::default())
            .await
            .unwrap();

        let binary_type = |label: &str| {
            a_conn
                .channels()
                .into_iter()
                .find(|c| c.label() == label)
                .map(|c| c.binary_type())
        };
        assert_eq!(binary_type("shared.txt"), Some(BinaryType::Blob));
        assert_eq!(binary_type("raw.txt"), Some(BinaryType::ArrayBuffer));
    }

    #[test]
    fn test_browser_shape() {
        let message = Features::new(BinaryType::Blob).to_message().unwrap();
        assert_eq!(
            message,
            ChannelMessage::Text(r#"{"binaryType":"blob"}"#.to_string())
        );

        let parsed = Features::from_message(&ChannelMessage::Text(
            r#"{"binaryType":"arraybuffer"}"#.to_string(),
        ))
        .unwrap();
        assert_eq!(parsed.binary_type, BinaryType::ArrayBuffer);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Features::from_message(&ChannelMessage::Text("hello".into())).is_err());
    }
}
