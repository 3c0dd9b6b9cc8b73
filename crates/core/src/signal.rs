//! Signaling message types
//!
//! These are the payloads carried opaquely by the relay. The JSON shape is
//! `{"description": {"type": "offer", "sdp": "..."}}` or
//! `{"candidate": {"candidate": "...", "sdpMid": "0", "sdpMLineIndex": 0}}`.

use serde::{Deserialize, Serialize};

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
    /// Out-of-band control sentinel asking the remote peer to reset.
    /// Never produced by a connection.
    #[serde(rename = "_reset")]
    Reset,
}

impl SdpType {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
            SdpType::Reset => "_reset",
        }
    }
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local or remote session description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpType, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }

    /// The `_reset` control sentinel
    pub fn reset() -> Self {
        Self::new(SdpType::Reset, String::new())
    }
}

/// A discovered network candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// One signaling message: exactly one of a description or a candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

impl Signal {
    pub fn is_reset(&self) -> bool {
        matches!(self, Signal::Description(d) if d.kind == SdpType::Reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_wire_shape() {
        let json = serde_json::to_string(&Signal::Description(SessionDescription::reset())).unwrap();
        assert_eq!(json, r#"{"description":{"type":"_reset"}}"#);

        let parsed: Signal = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_reset());
    }

    #[test]
    fn test_browser_candidate_parses() {
        let parsed: Signal = serde_json::from_str(
            r#"{"candidate":{"candidate":"candidate:1 1 udp 2113937151 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();

        match parsed {
            Signal::Candidate(c) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
            }
            _ => panic!("Wrong signal type"),
        }
    }

    #[test]
    fn test_offer_parses() {
        let parsed: Signal =
            serde_json::from_str(r#"{"description":{"type":"offer","sdp":"v=0"}}"#).unwrap();
        assert_eq!(
            parsed,
            Signal::Description(SessionDescription::new(SdpType::Offer, "v=0"))
        );
        assert!(!parsed.is_reset());
    }
}
