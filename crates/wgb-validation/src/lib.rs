//! Input validation and safe command execution for wgbridge.
//!
//! Everything that crosses from operator input into a file name, a config
//! comment, or an argument of an external tool is checked here first.
//!
//! # String Validation
//!
//! ```
//! use wgb_validation::{parse_client_list, sanitize_peer_name};
//!
//! let peer = sanitize_peer_name("laptop")?;
//! assert_eq!(peer.as_str(), "laptop");
//!
//! let clients = parse_client_list("2")?;
//! assert_eq!(clients[1].as_str(), "client2");
//! # Ok::<(), wgb_validation::ValidationError>(())
//! ```
//!
//! # Safe Command Execution
//!
//! External programs are run through [`command::SafeCommand`], which only
//! accepts allowlisted programs. Execution needs the `command` feature.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
mod error;
mod numeric;
mod sanitized;
mod strings;

pub use command::{validate_argument, AllowedProgram, CommandError, CommandOutput, SafeCommand};
pub use error::{ValidationError, ValidationErrorKind};
pub use numeric::{validate_in_range, validate_port};
pub use sanitized::{InterfaceName, PeerName, SanitizationKind, Sanitized};
pub use strings::{
    parse_client_list, sanitize_interface_name, sanitize_peer_name, MAX_CLIENT_COUNT,
};

/// Maximum length for peer names.
pub const MAX_PEER_NAME_LENGTH: usize = 64;

/// Maximum length for interface names (`IFNAMSIZ - 1`).
pub const MAX_INTERFACE_NAME_LENGTH: usize = 15;
