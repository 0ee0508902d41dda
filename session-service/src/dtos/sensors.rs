use chrono::{DateTime, Utc};
use serde::Deserialize;
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateSensorReadingRequest {
    #[validate(length(min = 1, max = 100, message = "Tag must be 1-100 characters"))]
    pub tag: String,

    #[validate(
        custom(function = "finite_value"),
        range(min = -50.0, max = 200.0, message = "Value must be between -50 and 200")
    )]
    pub value: f64,

    /// Measurement time reported by the field device
    pub timestamp: DateTime<Utc>,
}

fn finite_value(value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::new("finite"))
    }
}
