//! Transactional audit capture.
//!
//! Entity changes are staged on a [`ChangeSet`]. On commit the
//! [`AuditInterceptor`] turns every net change to a business entity into one
//! [`AuditEntry`], and the entity rows and audit rows go to the
//! [`EntityStore`] as a single unit: both land or neither does.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::models::{AuditAction, AuditEntry};
use crate::services::error::StoreError;
use crate::services::identity::ActorContext;

/// Actor label recorded when no user is attached to the operation.
pub const SYSTEM_ACTOR: &str = "system";

/// Audit classification of an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// Domain data; every net change is audited.
    Business,
    /// Identity bookkeeping (profiles, roles, refresh tokens). Never audited.
    IdentityInternal,
    /// Audit entries themselves. Insert-only, never audited.
    AuditRecord,
}

impl EntityKind {
    pub fn is_audited(&self) -> bool {
        matches!(self, EntityKind::Business)
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("field `{field}` is not a finite number")]
    NonFinite { field: &'static str },

    #[error("field `{field}` could not be serialized: {source}")]
    Field {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("snapshot could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("snapshot could not be decoded: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Field-name to value map of an entity at one point in time.
///
/// Built explicitly by each entity; doubles as the row image handed to the
/// entity store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Snapshot(Map<String, Value>);

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field<T: Serialize + ?Sized>(
        mut self,
        name: &'static str,
        value: &T,
    ) -> Result<Self, SnapshotError> {
        let value = serde_json::to_value(value)
            .map_err(|source| SnapshotError::Field { field: name, source })?;
        self.0.insert(name.to_string(), value);
        Ok(self)
    }

    /// Add a float field. serde_json would silently write NaN as `null`.
    pub fn finite(self, name: &'static str, value: f64) -> Result<Self, SnapshotError> {
        if !value.is_finite() {
            return Err(SnapshotError::NonFinite { field: name });
        }
        self.field(name, &value)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        serde_json::to_string(&self.0).map_err(SnapshotError::Encode)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Wrap a JSON object; anything else is not a row image.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SnapshotError> {
        serde_json::from_value(self.to_value()).map_err(SnapshotError::Decode)
    }
}

/// An entity whose changes can be staged on a [`ChangeSet`].
pub trait Auditable: Send + Sync {
    /// Type name recorded in audit entries.
    fn entity_name(&self) -> &'static str;

    fn table_name(&self) -> &'static str;

    fn kind(&self) -> EntityKind {
        EntityKind::Business
    }

    fn key(&self) -> Uuid;

    fn snapshot(&self) -> Result<Snapshot, SnapshotError>;
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("could not snapshot {entity} {key}: {source}")]
    Snapshot {
        entity: &'static str,
        key: Uuid,
        #[source]
        source: SnapshotError,
    },

    #[error("audit entry {key} is immutable")]
    ImmutableAuditRecord { key: Uuid },

    #[error("{entity} {key} cannot be deleted")]
    IdentityDeletion { entity: &'static str, key: Uuid },

    #[error("invalid change for {entity} {key}: {reason}")]
    InvalidStaging {
        entity: &'static str,
        key: Uuid,
        reason: &'static str,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One entity row write, as handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityWrite {
    pub table: &'static str,
    pub key: Uuid,
    pub action: AuditAction,
    /// Row image after the change, `None` for deletions
    pub row: Option<Snapshot>,
}

/// Persistence seam for audited change sets.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Apply entity writes and append audit entries atomically.
    ///
    /// A write against a row that no longer matches (update or delete of a
    /// missing key, insert of an existing key) fails the whole call with
    /// [`StoreError::Conflict`] and persists nothing.
    async fn apply(&self, writes: &[EntityWrite], audit: &[AuditEntry]) -> Result<(), StoreError>;

    async fn load(&self, table: &str, key: Uuid) -> Result<Option<Snapshot>, StoreError>;

    /// Audit entries recorded for an entity type, oldest first.
    async fn audit_entries_for(&self, entity: &str) -> Result<Vec<AuditEntry>, StoreError>;
}

struct TrackedEntry {
    entity: &'static str,
    table: &'static str,
    kind: EntityKind,
    key: Uuid,
    state: AuditAction,
    original: Option<Result<Snapshot, SnapshotError>>,
    current: Option<Result<Snapshot, SnapshotError>>,
}

impl TrackedEntry {
    fn of<E: Auditable + ?Sized>(
        entity: &E,
        state: AuditAction,
        original: Option<Result<Snapshot, SnapshotError>>,
        current: Option<Result<Snapshot, SnapshotError>>,
    ) -> Self {
        Self {
            entity: entity.entity_name(),
            table: entity.table_name(),
            kind: entity.kind(),
            key: entity.key(),
            state,
            original,
            current,
        }
    }
}

/// Pending entity changes, keyed by (table, key).
///
/// Staging the same entity twice merges into its net change: insert then
/// update stays an insert with the latest values, insert then delete
/// cancels out, update then delete is a delete of the original, and delete
/// then insert is an update.
#[derive(Default)]
pub struct ChangeSet {
    entries: Vec<TrackedEntry>,
    fault: Option<AuditError>,
}

/// What a commit wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub entities_written: usize,
    pub audit_entries: usize,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stage_insert<E: Auditable + ?Sized>(&mut self, entity: &E) {
        let entry = TrackedEntry::of(entity, AuditAction::Added, None, Some(entity.snapshot()));
        self.track(entry);
    }

    pub fn stage_update<E: Auditable + ?Sized>(&mut self, before: &E, after: &E) {
        if before.key() != after.key() {
            self.reject(after.entity_name(), after.key(), "key changed between snapshots");
            return;
        }
        let entry = TrackedEntry::of(
            after,
            AuditAction::Modified,
            Some(before.snapshot()),
            Some(after.snapshot()),
        );
        self.track(entry);
    }

    pub fn stage_delete<E: Auditable + ?Sized>(&mut self, entity: &E) {
        let entry = TrackedEntry::of(entity, AuditAction::Deleted, Some(entity.snapshot()), None);
        self.track(entry);
    }

    fn track(&mut self, incoming: TrackedEntry) {
        let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.table == incoming.table && e.key == incoming.key)
        else {
            self.entries.push(incoming);
            return;
        };

        match (self.entries[pos].state, incoming.state) {
            (AuditAction::Added, AuditAction::Modified)
            | (AuditAction::Modified, AuditAction::Modified) => {
                self.entries[pos].current = incoming.current;
            }
            (AuditAction::Added, AuditAction::Deleted) => {
                self.entries.remove(pos);
            }
            (AuditAction::Modified, AuditAction::Deleted) => {
                self.entries[pos].state = AuditAction::Deleted;
                self.entries[pos].current = None;
            }
            (AuditAction::Deleted, AuditAction::Added) => {
                self.entries[pos].state = AuditAction::Modified;
                self.entries[pos].current = incoming.current;
            }
            (_, AuditAction::Added) => {
                self.reject(incoming.entity, incoming.key, "entity is already staged");
            }
            (AuditAction::Deleted, _) => {
                self.reject(incoming.entity, incoming.key, "entity is already staged for deletion");
            }
        }
    }

    fn reject(&mut self, entity: &'static str, key: Uuid, reason: &'static str) {
        if self.fault.is_none() {
            self.fault = Some(AuditError::InvalidStaging { entity, key, reason });
        }
    }

    /// Commit all staged changes with their audit entries in one store call.
    ///
    /// The acting user is resolved now; without one the entries are
    /// attributed to [`SYSTEM_ACTOR`]. Any snapshot failure aborts the
    /// commit before the store is touched.
    #[instrument(skip_all, fields(staged = self.entries.len()))]
    pub async fn commit(
        self,
        store: &dyn EntityStore,
        actor: &dyn ActorContext,
    ) -> Result<CommitSummary, AuditError> {
        let actor = resolve_actor(actor);
        let prepared = AuditInterceptor.prepare(self, &actor, Utc::now())?;

        if prepared.writes.is_empty() && prepared.audit.is_empty() {
            debug!("Nothing to commit");
            return Ok(CommitSummary::default());
        }

        store.apply(&prepared.writes, &prepared.audit).await?;

        debug!(
            actor = %actor,
            entities = prepared.writes.len(),
            audit_entries = prepared.audit.len(),
            "Change set committed"
        );
        Ok(CommitSummary {
            entities_written: prepared.writes.len(),
            audit_entries: prepared.audit.len(),
        })
    }
}

fn resolve_actor(actor: &dyn ActorContext) -> String {
    actor
        .current_actor_label()
        .filter(|label| !label.trim().is_empty())
        .unwrap_or_else(|| SYSTEM_ACTOR.to_string())
}

/// Entity writes and audit entries ready to be applied together.
#[derive(Debug, Default)]
pub struct PreparedCommit {
    pub writes: Vec<EntityWrite>,
    pub audit: Vec<AuditEntry>,
}

/// Builds audit entries for the net changes in a [`ChangeSet`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditInterceptor;

impl AuditInterceptor {
    pub fn prepare(
        &self,
        changes: ChangeSet,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<PreparedCommit, AuditError> {
        if let Some(fault) = changes.fault {
            return Err(fault);
        }

        let mut prepared = PreparedCommit::default();
        for entry in changes.entries {
            let TrackedEntry {
                entity,
                table,
                kind,
                key,
                state,
                original,
                current,
            } = entry;

            if kind == EntityKind::AuditRecord && state != AuditAction::Added {
                return Err(AuditError::ImmutableAuditRecord { key });
            }
            if kind == EntityKind::IdentityInternal && state == AuditAction::Deleted {
                return Err(AuditError::IdentityDeletion { entity, key });
            }

            let snapshot_err = |source| AuditError::Snapshot { entity, key, source };
            let original = original.transpose().map_err(snapshot_err)?;
            let current = current.transpose().map_err(snapshot_err)?;

            if state == AuditAction::Modified && original == current {
                debug!(entity, %key, "Skipping update with no net change");
                continue;
            }

            if kind == EntityKind::AuditRecord {
                // Staged audit rows are appended as-is and never audited themselves.
                if let Some(row) = current {
                    prepared.audit.push(row.decode().map_err(snapshot_err)?);
                }
                continue;
            }

            if kind.is_audited() {
                let old_values = side_json(original.as_ref()).map_err(snapshot_err)?;
                let new_values = side_json(current.as_ref()).map_err(snapshot_err)?;
                prepared.audit.push(AuditEntry::new(
                    actor, state, entity, now, old_values, new_values,
                ));
            }

            prepared.writes.push(EntityWrite {
                table,
                key,
                action: state,
                row: current,
            });
        }

        Ok(prepared)
    }
}

fn side_json(snapshot: Option<&Snapshot>) -> Result<String, SnapshotError> {
    snapshot
        .map(Snapshot::to_json)
        .transpose()
        .map(Option::unwrap_or_default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SensorReading, UserCredentialProfile};
    use crate::services::identity::RequestActor;

    fn reading(tag: &str, value: f64) -> SensorReading {
        SensorReading::new(tag, value, Utc::now())
    }

    fn prepare(changes: ChangeSet) -> Result<PreparedCommit, AuditError> {
        AuditInterceptor.prepare(changes, "op1", Utc::now())
    }

    #[test]
    fn insert_records_added_with_empty_old_values() {
        let r = reading("TT-101", 72.5);
        let mut changes = ChangeSet::new();
        changes.stage_insert(&r);

        let prepared = prepare(changes).unwrap();
        assert_eq!(prepared.writes.len(), 1);
        assert_eq!(prepared.audit.len(), 1);

        let entry = &prepared.audit[0];
        assert_eq!(entry.actor, "op1");
        assert_eq!(entry.action, AuditAction::Added);
        assert_eq!(entry.entity, "SensorReading");
        assert_eq!(entry.old_values, "");
        let new_values = entry.new_snapshot().unwrap();
        assert_eq!(new_values["tag"], "TT-101");
        assert_eq!(new_values["value"], 72.5);
    }

    #[test]
    fn update_records_both_sides() {
        let before = reading("TT-101", 72.5);
        let mut after = before.clone();
        after.value = 80.0;

        let mut changes = ChangeSet::new();
        changes.stage_update(&before, &after);

        let prepared = prepare(changes).unwrap();
        let entry = &prepared.audit[0];
        assert_eq!(entry.action, AuditAction::Modified);
        assert_eq!(entry.old_snapshot().unwrap()["value"], 72.5);
        assert_eq!(entry.new_snapshot().unwrap()["value"], 80.0);
        assert_eq!(prepared.writes[0].row.as_ref().unwrap().get("value"), Some(&serde_json::json!(80.0)));
    }

    #[test]
    fn unchanged_update_is_dropped() {
        let r = reading("TT-101", 72.5);
        let mut changes = ChangeSet::new();
        changes.stage_update(&r, &r.clone());

        let prepared = prepare(changes).unwrap();
        assert!(prepared.writes.is_empty());
        assert!(prepared.audit.is_empty());
    }

    #[test]
    fn delete_records_empty_new_values() {
        let r = reading("TT-101", 72.5);
        let mut changes = ChangeSet::new();
        changes.stage_delete(&r);

        let prepared = prepare(changes).unwrap();
        let entry = &prepared.audit[0];
        assert_eq!(entry.action, AuditAction::Deleted);
        assert_eq!(entry.new_values, "");
        assert_eq!(entry.old_snapshot().unwrap()["tag"], "TT-101");
        assert!(prepared.writes[0].row.is_none());
    }

    #[test]
    fn insert_then_update_stays_an_insert() {
        let r = reading("TT-101", 1.0);
        let mut updated = r.clone();
        updated.value = 2.0;

        let mut changes = ChangeSet::new();
        changes.stage_insert(&r);
        changes.stage_update(&r, &updated);
        assert_eq!(changes.len(), 1);

        let prepared = prepare(changes).unwrap();
        assert_eq!(prepared.audit.len(), 1);
        assert_eq!(prepared.audit[0].action, AuditAction::Added);
        assert_eq!(prepared.audit[0].new_snapshot().unwrap()["value"], 2.0);
    }

    #[test]
    fn insert_then_delete_cancels_out() {
        let r = reading("TT-101", 1.0);
        let mut changes = ChangeSet::new();
        changes.stage_insert(&r);
        changes.stage_delete(&r);

        assert!(changes.is_empty());
        let prepared = prepare(changes).unwrap();
        assert!(prepared.writes.is_empty());
        assert!(prepared.audit.is_empty());
    }

    #[test]
    fn update_then_delete_keeps_original_values() {
        let r = reading("TT-101", 1.0);
        let mut updated = r.clone();
        updated.value = 2.0;

        let mut changes = ChangeSet::new();
        changes.stage_update(&r, &updated);
        changes.stage_delete(&updated);

        let prepared = prepare(changes).unwrap();
        let entry = &prepared.audit[0];
        assert_eq!(entry.action, AuditAction::Deleted);
        assert_eq!(entry.old_snapshot().unwrap()["value"], 1.0);
    }

    #[test]
    fn delete_then_insert_becomes_update() {
        let r = reading("TT-101", 1.0);
        let mut replacement = r.clone();
        replacement.tag = "TT-102".to_string();

        let mut changes = ChangeSet::new();
        changes.stage_delete(&r);
        changes.stage_insert(&replacement);

        let prepared = prepare(changes).unwrap();
        assert_eq!(prepared.writes[0].action, AuditAction::Modified);
        assert_eq!(prepared.audit[0].old_snapshot().unwrap()["tag"], "TT-101");
        assert_eq!(prepared.audit[0].new_snapshot().unwrap()["tag"], "TT-102");
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let r = reading("TT-101", 1.0);
        let mut changes = ChangeSet::new();
        changes.stage_insert(&r);
        changes.stage_insert(&r);

        assert!(matches!(
            prepare(changes),
            Err(AuditError::InvalidStaging { .. })
        ));
    }

    #[test]
    fn non_finite_value_aborts_whole_change_set() {
        let good = reading("TT-101", 1.0);
        let bad = reading("TT-102", f64::NAN);

        let mut changes = ChangeSet::new();
        changes.stage_insert(&good);
        changes.stage_insert(&bad);

        match prepare(changes) {
            Err(AuditError::Snapshot { entity, key, source }) => {
                assert_eq!(entity, "SensorReading");
                assert_eq!(key, bad.id);
                assert!(matches!(source, SnapshotError::NonFinite { field: "value" }));
            }
            other => panic!("expected snapshot failure, got {other:?}"),
        }
    }

    #[test]
    fn identity_records_are_written_but_not_audited() {
        let before = UserCredentialProfile::new("op1", "op1@plant.io");
        let mut after = before.clone();
        after.totp_enabled = true;

        let mut changes = ChangeSet::new();
        changes.stage_update(&before, &after);

        let prepared = prepare(changes).unwrap();
        assert_eq!(prepared.writes.len(), 1);
        assert_eq!(prepared.writes[0].table, "users");
        assert!(prepared.audit.is_empty());
    }

    #[test]
    fn audit_records_are_insert_only() {
        let entry = AuditEntry::new(
            "op1",
            AuditAction::Added,
            "SensorReading",
            Utc::now(),
            String::new(),
            "{}".to_string(),
        );

        let mut changes = ChangeSet::new();
        changes.stage_insert(&entry);
        let prepared = prepare(changes).unwrap();
        assert!(prepared.writes.is_empty());
        assert_eq!(prepared.audit, vec![entry.clone()]);

        let mut changes = ChangeSet::new();
        changes.stage_delete(&entry);
        assert!(matches!(
            prepare(changes),
            Err(AuditError::ImmutableAuditRecord { key }) if key == entry.id
        ));
    }

    #[test]
    fn identity_profiles_cannot_be_deleted() {
        let user = UserCredentialProfile::new("op1", "op1@plant.io");

        let mut changes = ChangeSet::new();
        changes.stage_delete(&user);
        assert!(matches!(
            prepare(changes),
            Err(AuditError::IdentityDeletion { entity: "UserCredentialProfile", key }) if key == user.id
        ));

        // Updates still pass, unaudited.
        let mut enabled = user.clone();
        enabled.totp_enabled = true;
        let mut changes = ChangeSet::new();
        changes.stage_update(&user, &enabled);
        let prepared = prepare(changes).unwrap();
        assert_eq!(prepared.writes.len(), 1);
        assert!(prepared.audit.is_empty());
    }

    #[test]
    fn missing_or_blank_actor_resolves_to_system() {
        assert_eq!(resolve_actor(&RequestActor::anonymous()), SYSTEM_ACTOR);
        assert_eq!(resolve_actor(&RequestActor::named("  ")), SYSTEM_ACTOR);
        assert_eq!(resolve_actor(&RequestActor::named("op1")), "op1");
    }
}
