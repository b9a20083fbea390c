//! Numeric validation functions.

use crate::error::ValidationError;

/// Validate a port number (1-65535).
///
/// # Errors
///
/// Returns `ValidationError` if the port is zero.
pub fn validate_port(field: &str, port: u16) -> Result<u16, ValidationError> {
    if port == 0 {
        return Err(ValidationError::out_of_range(field, 1, 65535, 0));
    }
    Ok(port)
}

/// Validate that `value` lies in `min..=max`.
///
/// # Errors
///
/// Returns `ValidationError` if the value is outside the range.
pub fn validate_in_range(field: &str, value: u64, min: u64, max: u64) -> Result<u64, ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::out_of_range(field, min, max, value));
    }
    Ok(value)
}
