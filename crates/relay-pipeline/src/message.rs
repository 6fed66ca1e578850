//! Queue envelope for stage handoff.
//!
//! Events carry blob references, never document bodies: the payload of
//! a report lives in the blob store and is re-verified by digest on
//! every download.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Upper bound on an encoded event, matching common queue substrates.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// One stage-trigger event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReportEvent {
    /// A raw submission landed and needs parsing.
    Convert {
        report_id: Uuid,
        blob_url: String,
        digest: String,
        blob_sub_folder_name: String,
    },
    /// A canonical document is ready for receiver matching.
    Route {
        report_id: Uuid,
        blob_url: String,
        digest: String,
        blob_sub_folder_name: String,
    },
    /// A document matched a receiver and needs its translation.
    Translate {
        report_id: Uuid,
        blob_url: String,
        digest: String,
        blob_sub_folder_name: String,
        receiver: String,
    },
    /// A scheduled batch tick for one receiver.
    Batch { receiver: String },
    /// A finalized delivery file is ready for transport.
    Send {
        report_id: Uuid,
        blob_url: String,
        digest: String,
        blob_sub_folder_name: String,
        receiver: String,
        filename: String,
    },
}

impl ReportEvent {
    /// Encode to the JSON wire form, enforcing the size limit.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::MessageTooLarge`] when the body exceeds
    /// [`MAX_MESSAGE_BYTES`].
    pub fn encode(&self) -> Result<String> {
        let body = serde_json::to_string(self)?;
        if body.len() > MAX_MESSAGE_BYTES {
            return Err(Error::MessageTooLarge {
                bytes: body.len(),
                limit: MAX_MESSAGE_BYTES,
            });
        }
        Ok(body)
    }

    /// Decode from the JSON wire form.
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// The receiver this event targets, if stage-scoped to one.
    pub fn receiver(&self) -> Option<&str> {
        match self {
            Self::Convert { .. } | Self::Route { .. } => None,
            Self::Translate { receiver, .. }
            | Self::Batch { receiver }
            | Self::Send { receiver, .. } => Some(receiver),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_round_trip_with_a_type_tag() {
        let event = ReportEvent::Translate {
            report_id: Uuid::new_v4(),
            blob_url: "mem://reports/r1.json".to_string(),
            digest: "ABC".to_string(),
            blob_sub_folder_name: "reports".to_string(),
            receiver: "elr".to_string(),
        };
        let body = event.encode().unwrap();
        assert!(body.contains("\"type\":\"translate\""));
        assert_eq!(ReportEvent::decode(&body).unwrap(), event);
    }

    #[test]
    fn oversized_events_are_rejected_at_encode() {
        let event = ReportEvent::Send {
            report_id: Uuid::new_v4(),
            blob_url: "x".repeat(MAX_MESSAGE_BYTES),
            digest: "ABC".to_string(),
            blob_sub_folder_name: "delivery".to_string(),
            receiver: "elr".to_string(),
            filename: "f.hl7".to_string(),
        };
        let err = event.encode().unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { .. }));
    }
}
