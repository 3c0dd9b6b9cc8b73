//! Room identifiers
//!
//! A room is a 6-digit numeric string, usually carried as a URL fragment
//! (`#123456`). Peers sharing the id meet in the same relay room.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const ROOM_ID_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Generate a random room id
    pub fn generate() -> Self {
        let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
        Self(format!("{:06}", n))
    }

    /// Parse exactly six ASCII digits, with an optional leading `#`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.strip_prefix('#').unwrap_or(s);
        if s.len() != ROOM_ID_LEN || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Protocol(format!(
                "Invalid room id '{}': expected {} digits",
                s, ROOM_ID_LEN
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Reuse the hint if it is a valid room id, otherwise make a new one
    pub fn from_hint(hint: Option<&str>) -> Self {
        hint.and_then(|h| Self::parse(h).ok())
            .unwrap_or_else(Self::generate)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<RoomId> for String {
    fn from(room: RoomId) -> Self {
        room.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_reused_verbatim() {
        assert_eq!(RoomId::from_hint(Some("#042137")).as_str(), "042137");
        assert_eq!(RoomId::from_hint(Some("999999")).as_str(), "999999");
    }

    #[test]
    fn test_bad_hint_generates() {
        for hint in [None, Some(""), Some("#12345"), Some("1234567"), Some("12a456")] {
            let room = RoomId::from_hint(hint);
            assert_eq!(room.as_str().len(), 6);
            assert!(room.as_str().bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn test_parse_invalid() {
        assert!(RoomId::parse("abcdef").is_err());
        assert!(RoomId::parse("１２３４５６").is_err());
        assert!("12345".parse::<RoomId>().is_err());
    }

    #[test]
    fn test_serde_validates() {
        let room: RoomId = serde_json::from_str(r#""000001""#).unwrap();
        assert_eq!(room.to_string(), "000001");
        assert!(serde_json::from_str::<RoomId>(r#""lobby""#).is_err());
    }
}
