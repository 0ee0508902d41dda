use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::audit::{Auditable, Snapshot, SnapshotError};

/// A single process measurement. Audited on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub id: Uuid,
    pub tag: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl SensorReading {
    pub fn new(tag: impl Into<String>, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tag: tag.into(),
            value,
            timestamp,
        }
    }
}

impl Auditable for SensorReading {
    fn entity_name(&self) -> &'static str {
        "SensorReading"
    }

    fn table_name(&self) -> &'static str {
        "sensor_readings"
    }

    fn key(&self) -> Uuid {
        self.id
    }

    fn snapshot(&self) -> Result<Snapshot, SnapshotError> {
        Snapshot::new()
            .field("id", &self.id)?
            .field("tag", &self.tag)?
            .finite("value", self.value)?
            .field("timestamp", &self.timestamp)
    }
}
