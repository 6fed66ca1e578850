//! Delivery transports and the retry token contract.
//!
//! `send` returns `None` on full success and a [`RetryToken`] on any
//! failure. When the failed sub-items cannot be identified the token
//! carries the `["*"]` sentinel rather than a guess.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;
use crate::receiver::TransportConfig;

/// The reserved "retry all items" marker.
pub const ALL_ITEMS: &str = "*";

/// Structured record of what failed in a delivery and needs resending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryToken {
    pub retry_count: i32,
    pub items: Vec<String>,
}

impl RetryToken {
    pub fn new(retry_count: i32, items: Vec<String>) -> Self {
        Self { retry_count, items }
    }

    /// Token meaning "retry every item".
    pub fn all(retry_count: i32) -> Self {
        Self {
            retry_count,
            items: vec![ALL_ITEMS.to_string()],
        }
    }

    /// Whether an item list is the all-items sentinel. Checked by
    /// equality: only exactly `["*"]` qualifies.
    pub fn is_all_items(items: Option<&[String]>) -> bool {
        items.is_some_and(|items| items == [ALL_ITEMS])
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A finalized delivery file handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFile {
    pub filename: String,
    pub content: Vec<u8>,
    pub item_count: usize,
}

/// What a successful delivery recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub filename: String,
    pub byte_count: usize,
    pub item_count: usize,
}

impl DeliveryReceipt {
    pub fn for_file(file: &DeliveryFile) -> Self {
        Self {
            filename: file.filename.clone(),
            byte_count: file.content.len(),
            item_count: file.item_count,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a file. `items` restricts a resend to specific item ids
    /// (`None` means the whole file). Returns `None` on full success,
    /// or a token describing what to retry.
    ///
    /// # Errors
    ///
    /// Only infrastructure faults (e.g. reading local state) are hard
    /// errors; delivery failures are expressed through the token.
    async fn send(
        &self,
        config: &TransportConfig,
        file: &DeliveryFile,
        items: Option<&[String]>,
    ) -> Result<Option<RetryToken>>;
}

/// Writes delivery files into a destination directory. A pre-existing
/// filename is a delivery failure, never an overwrite.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileTransport;

impl FileTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn send(
        &self,
        config: &TransportConfig,
        file: &DeliveryFile,
        _items: Option<&[String]>,
    ) -> Result<Option<RetryToken>> {
        let TransportConfig::File { path } = config;
        match write_once(path, file).await {
            Ok(()) => Ok(None),
            // Destination faults are delivery failures, not hard errors;
            // the whole file is retried since nothing was written.
            Err(err) => {
                warn!(filename = %file.filename, "delivery failed: {err}");
                Ok(Some(RetryToken::all(0)))
            }
        }
    }
}

async fn write_once(path: &str, file: &DeliveryFile) -> std::io::Result<()> {
    let target = Path::new(path).join(&file.filename);
    if tokio::fs::try_exists(&target).await? {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "delivery target already exists",
        ));
    }
    tokio::fs::create_dir_all(path).await?;
    tokio::fs::write(&target, &file.content).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_checked_by_equality() {
        let all = vec![ALL_ITEMS.to_string()];
        assert!(RetryToken::is_all_items(Some(&all)));

        let some = vec!["a".to_string(), "b".to_string()];
        assert!(!RetryToken::is_all_items(Some(&some)));

        // Same length as the sentinel, different content
        let lookalike = vec!["x".to_string()];
        assert!(!RetryToken::is_all_items(Some(&lookalike)));

        assert!(!RetryToken::is_all_items(None));
    }

    #[test]
    fn tokens_round_trip_as_json() {
        let token = RetryToken::new(2, vec!["item-1".to_string(), "item-7".to_string()]);
        let json = token.to_json().unwrap();
        assert!(json.contains("\"retryCount\":2"));
        assert_eq!(RetryToken::from_json(&json).unwrap(), token);
    }

    #[tokio::test]
    async fn file_transport_delivers_and_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let config = TransportConfig::File {
            path: dir.path().to_string_lossy().into_owned(),
        };
        let file = DeliveryFile {
            filename: "org-recv-1.hl7".to_string(),
            content: b"MSH|...".to_vec(),
            item_count: 1,
        };

        let transport = FileTransport::new();
        assert_eq!(transport.send(&config, &file, None).await.unwrap(), None);
        assert_eq!(
            std::fs::read(dir.path().join("org-recv-1.hl7")).unwrap(),
            b"MSH|..."
        );

        // Second delivery of the same filename fails recoverably.
        let token = transport.send(&config, &file, None).await.unwrap();
        assert_eq!(token, Some(RetryToken::all(0)));
    }

    #[tokio::test]
    async fn destination_io_failures_are_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the destination directory should be.
        let blocked = dir.path().join("out");
        std::fs::write(&blocked, b"in the way").unwrap();

        let config = TransportConfig::File {
            path: blocked.to_string_lossy().into_owned(),
        };
        let file = DeliveryFile {
            filename: "org-recv-1.hl7".to_string(),
            content: b"MSH|...".to_vec(),
            item_count: 1,
        };

        let token = FileTransport::new().send(&config, &file, None).await.unwrap();
        assert_eq!(token, Some(RetryToken::all(0)));
    }
}
