//! Chunked file transfer
//!
//! Every file travels on its own channel, labeled with the file name. The
//! sender writes one descriptor frame followed by the payload in fixed-size
//! chunks; the receiver reassembles once the declared size is reached.

mod frame;
mod receiver;
mod sender;

use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use frame::{TransferFrame, CHUNK_TAG, DESCRIPTOR_TAG};
pub use receiver::{receive_file, Progress, Reassembler};
pub use sender::{chunks, payload_binary_type, send_file, send_over};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Metadata preceding the payload on a file channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime_type: String,
}

/// A local file queued for sending
#[derive(Debug, Clone)]
pub struct FileSource {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl FileSource {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Read a file from disk. The declared type is always generic.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self::new(name, DEFAULT_MIME_TYPE, data))
    }

    pub fn descriptor(&self) -> TransferDescriptor {
        TransferDescriptor {
            name: self.name.clone(),
            size: self.data.len() as u64,
            mime_type: self.mime_type.clone(),
        }
    }
}

/// A completely reassembled inbound file
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFile {
    pub descriptor: TransferDescriptor,
    pub data: Bytes,
    pub received_at: DateTime<Utc>,
}

impl ReceivedFile {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn mime_type(&self) -> &str {
        &self.descriptor.mime_type
    }

    /// Write the file into `dir` under its base name. Directory components
    /// in the remote name are dropped.
    pub async fn save_to(&self, dir: &Path) -> Result<PathBuf> {
        let base = Path::new(&self.descriptor.name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "received".into());
        let path = dir.join(base);
        tokio::fs::write(&path, &self.data).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_descriptor_wire_shape() {
        let file = FileSource::new("notes.txt", "text/plain", "hello");
        let json = serde_json::to_string(&file.descriptor()).unwrap();
        assert_eq!(json, r#"{"name":"notes.txt","size":5,"type":"text/plain"}"#);
    }

    #[tokio::test]
    async fn test_from_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        let file = FileSource::from_path(&path).await.unwrap();
        assert_eq!(file.name, "data.bin");
        assert_eq!(file.descriptor().size, 3);
        assert_eq!(file.mime_type, DEFAULT_MIME_TYPE);
    }

    #[tokio::test]
    async fn test_save_strips_directories() {
        let dir = TempDir::new().unwrap();
        let file = ReceivedFile {
            descriptor: TransferDescriptor {
                name: "../../etc/passwd".to_string(),
                size: 4,
                mime_type: String::new(),
            },
            data: Bytes::from_static(b"root"),
            received_at: Utc::now(),
        };

        let path = file.save_to(dir.path()).await.unwrap();
        assert_eq!(path, dir.path().join("passwd"));
        assert_eq!(std::fs::read(path).unwrap(), b"root");
    }
}
