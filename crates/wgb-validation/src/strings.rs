//! String validation for names that end up in file paths and tool arguments.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ValidationError;
use crate::sanitized::{InterfaceName, PeerName, Sanitized};
use crate::{MAX_INTERFACE_NAME_LENGTH, MAX_PEER_NAME_LENGTH};

/// Upper bound on the `N` in a bare-count client list.
pub const MAX_CLIENT_COUNT: u32 = 65_534;

static NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap_or_else(|_| unreachable!()));

static COUNT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+$").unwrap_or_else(|_| unreachable!()));

fn check_name(field: &str, name: &str, max: usize) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::empty(field));
    }
    if name.contains('\0') {
        return Err(ValidationError::null_byte(field));
    }
    if name.len() > max {
        return Err(ValidationError::too_long(field, max, name.len()));
    }
    if !NAME_REGEX.is_match(name) {
        return Err(ValidationError::invalid_format(
            field,
            "letters, digits, '-' and '_'",
            name,
        ));
    }
    Ok(())
}

/// Sanitize and validate a peer name.
///
/// Peer names become file names (`clients/<name>.conf`) and config comments,
/// so they are limited to 1-64 characters from `[A-Za-z0-9_-]`.
///
/// # Errors
///
/// Returns `ValidationError` if the name is invalid.
///
/// # Example
///
/// ```
/// use wgb_validation::sanitize_peer_name;
///
/// let peer = sanitize_peer_name("laptop-01")?;
/// assert_eq!(peer.as_str(), "laptop-01");
/// # Ok::<(), wgb_validation::ValidationError>(())
/// ```
pub fn sanitize_peer_name(name: &str) -> Result<Sanitized<PeerName>, ValidationError> {
    let name = name.trim();
    check_name("peer_name", name, MAX_PEER_NAME_LENGTH)?;
    Ok(Sanitized::new(name.to_string()))
}

/// Sanitize and validate a network interface name.
///
/// The kernel caps interface names at 15 bytes.
///
/// # Errors
///
/// Returns `ValidationError` if the name is invalid.
pub fn sanitize_interface_name(name: &str) -> Result<Sanitized<InterfaceName>, ValidationError> {
    let name = name.trim();
    check_name("interface_name", name, MAX_INTERFACE_NAME_LENGTH)?;
    Ok(Sanitized::new(name.to_string()))
}

/// Expands a client list setting into peer names.
///
/// A bare number `N` means `client1..clientN`; anything else is a
/// comma-separated list of names. Order is preserved because it decides
/// address assignment.
///
/// # Errors
///
/// Returns `ValidationError` for an empty list, a zero or oversized count,
/// an invalid name, or a repeated name.
pub fn parse_client_list(spec: &str) -> Result<Vec<Sanitized<PeerName>>, ValidationError> {
    let field = "clients";
    let spec = spec.trim();

    if spec.is_empty() {
        return Err(ValidationError::empty(field));
    }

    if COUNT_REGEX.is_match(spec) {
        let count: u64 = spec
            .parse()
            .map_err(|_| ValidationError::invalid_format(field, "a client count", spec))?;
        if count == 0 || count > u64::from(MAX_CLIENT_COUNT) {
            return Err(ValidationError::out_of_range(
                field,
                1,
                u64::from(MAX_CLIENT_COUNT),
                count,
            ));
        }
        return (1..=count)
            .map(|i| sanitize_peer_name(&format!("client{i}")))
            .collect();
    }

    let mut names: Vec<Sanitized<PeerName>> = Vec::new();
    for raw in spec.split(',') {
        let name = sanitize_peer_name(raw)?;
        if names.contains(&name) {
            return Err(ValidationError::duplicate(field, name.as_str()));
        }
        names.push(name);
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValidationErrorKind;
    use test_case::test_case;

    #[test_case("client" ; "plain")]
    #[test_case("laptop-01" ; "hyphen and digits")]
    #[test_case("my_phone" ; "underscore")]
    #[test_case("-leading" ; "leading hyphen")]
    fn valid_peer_names(name: &str) {
        assert!(sanitize_peer_name(name).is_ok());
    }

    #[test_case("" ; "empty")]
    #[test_case("   " ; "whitespace only")]
    #[test_case("bad name" ; "inner space")]
    #[test_case("../etc" ; "path traversal")]
    #[test_case("a;rm" ; "semicolon")]
    #[test_case("caf\u{e9}" ; "non ascii")]
    #[test_case("nul\0byte" ; "null byte")]
    fn invalid_peer_names(name: &str) {
        assert!(sanitize_peer_name(name).is_err());
    }

    #[test]
    fn peer_name_is_trimmed() {
        let name = sanitize_peer_name("  alice \n").expect("valid");
        assert_eq!(name.as_str(), "alice");
    }

    #[test]
    fn peer_name_length_limit() {
        assert!(sanitize_peer_name(&"a".repeat(64)).is_ok());
        let err = sanitize_peer_name(&"a".repeat(65)).expect_err("too long");
        assert_eq!(err.kind, ValidationErrorKind::TooLong { max: 64, actual: 65 });
    }

    #[test]
    fn interface_name_kernel_limit() {
        assert!(sanitize_interface_name("wg0").is_ok());
        assert!(sanitize_interface_name("abcdefghijklmno").is_ok());
        assert!(sanitize_interface_name("abcdefghijklmnop").is_err());
        assert!(sanitize_interface_name("wg 0").is_err());
    }

    #[test]
    fn client_count_expands() {
        let names: Vec<String> = parse_client_list("3")
            .expect("valid")
            .into_iter()
            .map(Sanitized::into_inner)
            .collect();
        assert_eq!(names, vec!["client1", "client2", "client3"]);
    }

    #[test]
    fn client_count_zero_rejected() {
        let err = parse_client_list("0").expect_err("zero");
        assert!(matches!(err.kind, ValidationErrorKind::OutOfRange { actual: 0, .. }));
    }

    #[test]
    fn client_list_preserves_order() {
        let names: Vec<String> = parse_client_list("zed, alice,bob")
            .expect("valid")
            .into_iter()
            .map(Sanitized::into_inner)
            .collect();
        assert_eq!(names, vec!["zed", "alice", "bob"]);
    }

    #[test]
    fn client_list_default_single_name() {
        let names = parse_client_list("client").expect("valid");
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].as_str(), "client");
    }

    #[test_case("" ; "empty")]
    #[test_case("alice,,bob" ; "empty entry")]
    #[test_case("alice,bob,alice" ; "duplicate")]
    #[test_case("alice,b@d" ; "invalid entry")]
    fn invalid_client_lists(spec: &str) {
        assert!(parse_client_list(spec).is_err());
    }

    #[test]
    fn duplicate_reports_name() {
        let err = parse_client_list("a,b,a").expect_err("duplicate");
        assert_eq!(
            err.kind,
            ValidationErrorKind::Duplicate {
                value: "a".to_string()
            }
        );
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn accepted_names_match_charset(name in "[A-Za-z0-9_-]{1,64}") {
                prop_assert!(sanitize_peer_name(&name).is_ok());
            }

            #[test]
            fn count_yields_exactly_n(n in 1u32..200) {
                let names = parse_client_list(&n.to_string()).unwrap();
                prop_assert_eq!(names.len(), n as usize);
            }
        }
    }
}
