//! Version tokens for optimistic concurrency control.
//!
//! Every stored aggregate (event, registration, payment, user) carries a
//! [`Version`]. A conditional write names the version the caller last read;
//! the store applies it only if the row still carries that version and then
//! bumps it by exactly one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `Version` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid version token: {0}")]
pub struct ParseVersionError(String);

/// Monotonically increasing version token of a stored aggregate.
///
/// Versions start at [`Version::INITIAL`] when a row is inserted and
/// increment by 1 on each successful conditional write:
///
/// - A writer reads the entity together with its version
/// - The writer submits its mutation with that version as `expected`
/// - If the stored version moved on in the meantime, the write is rejected
///
/// # Design
///
/// `Version` is a newtype wrapper around `u64` that provides:
/// - Type safety (can't accidentally pass a quantity or a capacity)
/// - Clear intent in function signatures
/// - Arithmetic for the `expected + 1` contract
///
/// # Examples
///
/// ```
/// use turnstile_core::version::Version;
///
/// let v1 = Version::INITIAL;
/// let v2 = v1.next();
/// assert_eq!(v2, Version::new(2));
/// assert_eq!(v2.value(), 2);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The version a row carries right after it is inserted.
    pub const INITIAL: Self = Self(1);

    /// Create a new `Version` with the given value.
    ///
    /// # Examples
    ///
    /// ```
    /// use turnstile_core::version::Version;
    ///
    /// let version = Version::new(42);
    /// assert_eq!(version.value(), 42);
    /// ```
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    ///
    /// This is the version a successful conditional write returns.
    ///
    /// # Examples
    ///
    /// ```
    /// use turnstile_core::version::Version;
    ///
    /// let v3 = Version::new(3);
    /// assert_eq!(v3.next(), Version::new(4));
    /// ```
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Check if this is the version of a never-modified row.
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == Self::INITIAL.0
    }

    /// Convert to the signed representation used by `BIGINT` columns.
    ///
    /// Values above `i64::MAX` saturate; no real row reaches that many writes.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    /// Build a version from a `BIGINT` column value.
    ///
    /// Negative values are clamped to zero, which never matches a stored row.
    #[must_use]
    pub fn from_i64(value: i64) -> Self {
        Self(u64::try_from(value).unwrap_or(0))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| ParseVersionError(s.to_string()))
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// Arithmetic addition for `Version`.
impl std::ops::Add<u64> for Version {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_version() {
        assert_eq!(Version::INITIAL, Version::new(1));
        assert!(Version::INITIAL.is_initial());
        assert!(!Version::new(2).is_initial());
    }

    #[test]
    fn next_version() {
        let v1 = Version::INITIAL;
        let v2 = v1.next();
        let v3 = v2.next();

        assert_eq!(v2, Version::new(2));
        assert_eq!(v3, Version::new(3));
        assert_eq!(v1 + 2, v3);
    }

    #[test]
    fn ordering() {
        assert!(Version::new(1) < Version::new(2));
        assert!(Version::new(10) > Version::new(9));
    }

    #[test]
    fn bigint_conversion() {
        assert_eq!(Version::new(7).as_i64(), 7);
        assert_eq!(Version::from_i64(7), Version::new(7));
        assert_eq!(Version::from_i64(-3), Version::new(0));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn parse() {
        assert_eq!("12".parse::<Version>().unwrap(), Version::new(12));
        assert!("twelve".parse::<Version>().is_err());
    }

    #[test]
    fn display() {
        assert_eq!(format!("{}", Version::new(5)), "5");
    }
}
