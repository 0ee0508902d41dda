use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::dtos::sensors::CreateSensorReadingRequest;
use crate::models::{AuditEntry, SensorReading};
use crate::services::audit::{ChangeSet, EntityStore};
use crate::services::error::{ServiceError, StoreError};
use crate::services::identity::RequestActor;
use crate::services::jwt::AccessClaims;
use crate::services::session::require_role;

pub const OPERATOR_ROLE: &str = "Operator";
pub const MANAGER_ROLE: &str = "Manager";

const TABLE: &str = "sensor_readings";
const ENTITY: &str = "SensorReading";

/// Sensor readings, written only through audited change sets.
#[derive(Clone)]
pub struct SensorReadingService {
    store: Arc<dyn EntityStore>,
}

impl SensorReadingService {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    #[instrument(skip_all, fields(user = %caller.name, tag = %request.tag))]
    pub async fn create(
        &self,
        caller: &AccessClaims,
        request: &CreateSensorReadingRequest,
    ) -> Result<SensorReading, ServiceError> {
        require_role(caller, OPERATOR_ROLE)?;
        request.validate()?;

        let reading = SensorReading::new(request.tag.clone(), request.value, request.timestamp);

        let mut changes = ChangeSet::new();
        changes.stage_insert(&reading);
        changes
            .commit(self.store.as_ref(), &RequestActor::from_claims(caller))
            .await?;

        info!(reading_id = %reading.id, "Sensor reading recorded");
        Ok(reading)
    }

    #[instrument(skip(self, caller), fields(user = %caller.name))]
    pub async fn delete(&self, caller: &AccessClaims, id: Uuid) -> Result<(), ServiceError> {
        require_role(caller, MANAGER_ROLE)?;

        let reading = self
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Sensor reading {}", id)))?;

        let mut changes = ChangeSet::new();
        changes.stage_delete(&reading);
        changes
            .commit(self.store.as_ref(), &RequestActor::from_claims(caller))
            .await?;

        info!(reading_id = %id, "Sensor reading deleted");
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<SensorReading>, ServiceError> {
        let Some(row) = self.store.load(TABLE, id).await? else {
            return Ok(None);
        };
        let reading = row
            .decode()
            .map_err(|e| StoreError::Corrupt(format!("sensor reading {}: {}", id, e)))?;
        Ok(Some(reading))
    }

    /// Audit trail of every sensor reading change, oldest first.
    pub async fn history(&self) -> Result<Vec<AuditEntry>, ServiceError> {
        Ok(self.store.audit_entries_for(ENTITY).await?)
    }
}
