//! Audit entry model - one immutable row per net entity change.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::audit::{Auditable, EntityKind, Snapshot, SnapshotError};

/// Kind of change recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    Added,
    Modified,
    Deleted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Added => "Added",
            AuditAction::Modified => "Modified",
            AuditAction::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Added" => Ok(AuditAction::Added),
            "Modified" => Ok(AuditAction::Modified),
            "Deleted" => Ok(AuditAction::Deleted),
            other => Err(format!("unknown audit action: {other}")),
        }
    }
}

/// Audit entry. Never updated or deleted once committed.
///
/// `old_values` and `new_values` hold the JSON field snapshots; the side
/// that does not exist for the action (old for `Added`, new for `Deleted`)
/// is the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    /// Acting-user label, `system` when no user was attached
    pub actor: String,
    pub action: AuditAction,
    /// Entity type name, e.g. `SensorReading`
    pub entity: String,
    pub occurred_at: DateTime<Utc>,
    pub old_values: String,
    pub new_values: String,
}

impl AuditEntry {
    pub fn new(
        actor: impl Into<String>,
        action: AuditAction,
        entity: impl Into<String>,
        occurred_at: DateTime<Utc>,
        old_values: String,
        new_values: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: actor.into(),
            action,
            entity: entity.into(),
            occurred_at,
            old_values,
            new_values,
        }
    }

    /// Parsed `old_values`, `None` when that side is empty.
    pub fn old_snapshot(&self) -> Option<serde_json::Value> {
        parse_side(&self.old_values)
    }

    /// Parsed `new_values`, `None` when that side is empty.
    pub fn new_snapshot(&self) -> Option<serde_json::Value> {
        parse_side(&self.new_values)
    }
}

fn parse_side(raw: &str) -> Option<serde_json::Value> {
    if raw.is_empty() {
        return None;
    }
    serde_json::from_str(raw).ok()
}

impl Auditable for AuditEntry {
    fn entity_name(&self) -> &'static str {
        "AuditEntry"
    }

    fn table_name(&self) -> &'static str {
        "audit_entries"
    }

    fn kind(&self) -> EntityKind {
        EntityKind::AuditRecord
    }

    fn key(&self) -> Uuid {
        self.id
    }

    fn snapshot(&self) -> Result<Snapshot, SnapshotError> {
        Snapshot::new()
            .field("id", &self.id)?
            .field("actor", &self.actor)?
            .field("action", &self.action)?
            .field("entity", &self.entity)?
            .field("occurred_at", &self.occurred_at)?
            .field("old_values", &self.old_values)?
            .field("new_values", &self.new_values)
    }
}
