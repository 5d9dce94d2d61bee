use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Which remote service an event or calendar came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Google,
    #[serde(rename = "caldav")]
    CalDav,
}

impl EventSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::CalDav => "caldav",
        }
    }

    /// The other side of a pair
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Google => Self::CalDav,
            Self::CalDav => Self::Google,
        }
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Propagation direction configured on a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    #[default]
    Bidirectional,
    #[serde(rename = "google_to_caldav")]
    GoogleToCalDav,
    #[serde(rename = "caldav_to_google")]
    CalDavToGoogle,
}

impl SyncDirection {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bidirectional => "bidirectional",
            Self::GoogleToCalDav => "google_to_caldav",
            Self::CalDavToGoogle => "caldav_to_google",
        }
    }

    /// Parses the stored database representation
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bidirectional" => Some(Self::Bidirectional),
            "google_to_caldav" => Some(Self::GoogleToCalDav),
            "caldav_to_google" => Some(Self::CalDavToGoogle),
            _ => None,
        }
    }

    /// Whether events flow out of `source` under this direction
    #[must_use]
    pub const fn propagates_from(self, source: EventSource) -> bool {
        match (self, source) {
            (Self::Bidirectional, _)
            | (Self::GoogleToCalDav, EventSource::Google)
            | (Self::CalDavToGoogle, EventSource::CalDav) => true,
            _ => false,
        }
    }
}

/// Automatic conflict resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Promoted to `LatestWins` in headless operation
    Manual,
    #[default]
    LatestWins,
    GoogleWins,
    #[serde(rename = "caldav_wins")]
    CalDavWins,
}

impl ConflictPolicy {
    /// Parses the stored database representation
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Self::Manual),
            "latest_wins" => Some(Self::LatestWins),
            "google_wins" => Some(Self::GoogleWins),
            "caldav_wins" => Some(Self::CalDavWins),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::LatestWins => "latest_wins",
            Self::GoogleWins => "google_wins",
            Self::CalDavWins => "caldav_wins",
        }
    }
}

/// Kind of operation recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Skip,
}

impl OperationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Skip => "skip",
        }
    }
}

/// Calendar metadata as reported by an adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarInfo {
    pub id: String,
    pub name: String,
    pub source: EventSource,
    pub description: Option<String>,
    pub timezone: String,
    pub color: Option<String>,
    pub access_role: Option<String>,
    pub is_primary: bool,
}

/// Delta returned by an adapter since a given token, or a window snapshot
/// when no token is in effect.
///
/// When `used_token` is false the set is a snapshot: `deleted_native_ids`
/// is empty and absence from `changed` must never be read as a deletion.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Changed or created events keyed by native id
    pub changed: HashMap<String, Event>,
    /// Native ids (Google) or resource hrefs (CalDAV) deleted server-side
    pub deleted_native_ids: HashSet<String>,
    /// Continuation cursor for the next incremental call
    pub next_token: Option<String>,
    /// Whether the server consumed `since_token` for this result
    pub used_token: bool,
    /// Token the server rejected, to be cleared from the store
    pub invalidated_token: Option<String>,
}

impl ChangeSet {
    /// A snapshot result with no delta semantics
    #[must_use]
    pub fn snapshot(changed: HashMap<String, Event>, next_token: Option<String>) -> Self {
        Self {
            changed,
            deleted_native_ids: HashSet::new(),
            next_token,
            used_token: false,
            invalidated_token: None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted_native_ids.is_empty()
    }
}
