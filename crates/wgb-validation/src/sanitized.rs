//! Sanitized value wrapper types with marker traits.

use std::fmt;
use std::marker::PhantomData;

/// Marker trait for sanitization kinds.
pub trait SanitizationKind: private::Sealed {}

mod private {
    pub trait Sealed {}
}

/// Marker for peer (client) names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerName;
impl private::Sealed for PeerName {}
impl SanitizationKind for PeerName {}

/// Marker for network interface names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceName;
impl private::Sealed for InterfaceName {}
impl SanitizationKind for InterfaceName {}

/// A string that passed one of the `sanitize_*` checks.
///
/// The type parameter records which check, so a peer name cannot be handed
/// to something expecting an interface name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sanitized<K: SanitizationKind> {
    value: String,
    _marker: PhantomData<K>,
}

impl<K: SanitizationKind> Sanitized<K> {
    pub(crate) fn new(value: String) -> Self {
        Self {
            value,
            _marker: PhantomData,
        }
    }

    /// Get the sanitized string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Consume the wrapper and return the inner value.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.value
    }
}

impl<K: SanitizationKind> AsRef<str> for Sanitized<K> {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

impl<K: SanitizationKind> fmt::Display for Sanitized<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}
