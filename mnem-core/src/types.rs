//! Shared types for mnem-core.
//!
//! These types are used by the API client, the lifecycle manager and the
//! transport selector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Memory Types
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a stored memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryState {
    Active,
    Paused,
    Archived,
    Deleted,
}

impl MemoryState {
    /// States reachable from this one. `Deleted` is terminal.
    pub fn allowed_targets(&self) -> &'static [MemoryState] {
        use MemoryState::*;
        match self {
            Active => &[Paused, Archived, Deleted],
            Paused => &[Active, Archived, Deleted],
            Archived => &[Active, Deleted],
            Deleted => &[],
        }
    }

    /// Check the transition table.
    pub fn can_transition_to(&self, target: MemoryState) -> bool {
        self.allowed_targets().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_targets().is_empty()
    }

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }

    /// Convert from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "archived" => Some(Self::Archived),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A memory record as owned by the remote memory API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub state: MemoryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// An audited state change. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub id: String,
    pub memory_id: String,
    pub from_state: MemoryState,
    pub to_state: MemoryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
}

/// Bulk operations offered to the command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOperation {
    Pause,
    Archive,
    Delete,
}

impl BulkOperation {
    /// State every id should end up in.
    pub fn target_state(&self) -> MemoryState {
        match self {
            Self::Pause => MemoryState::Paused,
            Self::Archive => MemoryState::Archived,
            Self::Delete => MemoryState::Deleted,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Archive => "archive",
            Self::Delete => "delete",
        }
    }
}

impl std::str::FromStr for BulkOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pause" => Ok(Self::Pause),
            "archive" => Ok(Self::Archive),
            "delete" => Ok(Self::Delete),
            other => Err(format!(
                "Invalid operation: {}. Use: pause, archive, or delete",
                other
            )),
        }
    }
}

/// Per-id outcome of a bulk call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkOperationResult {
    pub memory_id: String,
    pub success: bool,
    pub previous_state: Option<MemoryState>,
    pub new_state: Option<MemoryState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BulkOperationResult {
    pub fn succeeded(memory_id: &str, previous: MemoryState, new: MemoryState) -> Self {
        Self {
            memory_id: memory_id.to_string(),
            success: true,
            previous_state: Some(previous),
            new_state: Some(new),
            error: None,
        }
    }

    pub fn failed(memory_id: &str, previous: Option<MemoryState>, error: impl Into<String>) -> Self {
        Self {
            memory_id: memory_id.to_string(),
            success: false,
            previous_state: previous,
            new_state: previous,
            error: Some(error.into()),
        }
    }

    /// True when the id was already in the requested state.
    pub fn is_noop(&self) -> bool {
        self.success && self.previous_state == self.new_state
    }
}

/// Filter for listing memories.
#[derive(Debug, Clone, Default)]
pub struct MemoryListFilter {
    pub state: Option<MemoryState>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport Types
// ─────────────────────────────────────────────────────────────────────────────

/// Where a protocol endpoint lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Local,
    Remote,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// A protocol endpoint candidate. Lower priority values are tried first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub uri: String,
    pub kind: EndpointKind,
    #[serde(default)]
    pub priority: u32,
}

impl Endpoint {
    pub fn local(uri: impl Into<String>, priority: u32) -> Self {
        Self {
            uri: uri.into(),
            kind: EndpointKind::Local,
            priority,
        }
    }

    pub fn remote(uri: impl Into<String>, priority: u32) -> Self {
        Self {
            uri: uri.into(),
            kind: EndpointKind::Remote,
            priority,
        }
    }
}

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Failed,
}

impl ConnectionState {
    /// A transport is usable in these states.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }

    /// Still waiting on a connect attempt to settle.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Connecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use MemoryState::*;
        assert!(Active.can_transition_to(Paused));
        assert!(Active.can_transition_to(Archived));
        assert!(Active.can_transition_to(Deleted));
        assert!(Paused.can_transition_to(Active));
        assert!(Archived.can_transition_to(Active));
        assert!(!Archived.can_transition_to(Paused));
        assert!(!Active.can_transition_to(Active));

        assert!(Deleted.is_terminal());
        for target in [Active, Paused, Archived, Deleted] {
            assert!(!Deleted.can_transition_to(target));
        }
    }

    #[test]
    fn test_state_wire_format() {
        let json = serde_json::to_string(&MemoryState::Archived).unwrap();
        assert_eq!(json, "\"archived\"");
        assert_eq!(MemoryState::from_str("PAUSED"), Some(MemoryState::Paused));
        assert_eq!(MemoryState::from_str("gone"), None);
    }

    #[test]
    fn test_bulk_operation_parse() {
        assert_eq!("archive".parse::<BulkOperation>(), Ok(BulkOperation::Archive));
        assert_eq!(
            BulkOperation::Delete.target_state(),
            MemoryState::Deleted
        );
        assert!("restore".parse::<BulkOperation>().is_err());
    }

    #[test]
    fn test_memory_record_deserialize_minimal() {
        let record: MemoryRecord = serde_json::from_str(
            r#"{
                "id": "m1",
                "state": "active",
                "created_at": "2026-01-01T00:00:00Z",
                "updated_at": "2026-01-02T00:00:00Z"
            }"#,
        )
        .unwrap();
        assert_eq!(record.state, MemoryState::Active);
        assert!(record.archived_at.is_none());
        assert!(record.metadata.is_null());
    }
}
