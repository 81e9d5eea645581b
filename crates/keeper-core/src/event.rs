//! Coalesced change events.
//!
//! A [`ChangeEvent`] is the monitor's net summary of one filesystem
//! disturbance: baseline versus latest, never the raw notification stream.
//! Events are immutable once constructed; the orchestrator embeds them in
//! change-log entries verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Changed,
    Renamed,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Changed => "changed",
            Self::Renamed => "renamed",
            Self::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_digest: Option<String>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trips_through_json() {
        let event = ChangeEvent {
            kind: ChangeKind::Changed,
            path: PathBuf::from("/data/stores.csv"),
            timestamp: Utc::now(),
            previous_digest: Some("aa".into()),
            current_digest: Some("bb".into()),
            size: 42,
            modified_at: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"changed\""));
        let back: ChangeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, ChangeKind::Changed);
        assert_eq!(back.size, 42);
    }
}
