//! Error types for WireGuard key, address and config operations.

use thiserror::Error;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, WireGuardError>;

/// Errors that can occur while handling WireGuard material.
#[derive(Debug, Error)]
pub enum WireGuardError {
    /// Invalid key format.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid base64 encoding.
    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(String),

    /// Invalid key length.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// Invalid CIDR notation.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// Invalid endpoint.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The address range cannot serve the requested ordinal.
    #[error("address range {range} exhausted: ordinal {ordinal} exceeds {usable} usable hosts")]
    RangeExhausted {
        /// The configured range.
        range: String,
        /// The ordinal that was requested.
        ordinal: u32,
        /// Number of usable host addresses in the range.
        usable: u32,
    },

    /// Configuration is structurally invalid.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Parse failure in a config file.
    #[error("parse error at line {line}: {message}")]
    ParseError {
        /// 1-based line number, 0 when the whole file is at fault.
        line: usize,
        /// What went wrong.
        message: String,
    },
}

impl From<base64::DecodeError> for WireGuardError {
    fn from(err: base64::DecodeError) -> Self {
        Self::InvalidBase64(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_exhausted_display() {
        let err = WireGuardError::RangeExhausted {
            range: "10.9.0.0/30".to_string(),
            ordinal: 2,
            usable: 2,
        };
        assert_eq!(
            err.to_string(),
            "address range 10.9.0.0/30 exhausted: ordinal 2 exceeds 2 usable hosts"
        );
    }

    #[test]
    fn parse_error_display() {
        let err = WireGuardError::ParseError {
            line: 4,
            message: "unknown section: Foo".to_string(),
        };
        assert_eq!(err.to_string(), "parse error at line 4: unknown section: Foo");
    }
}
