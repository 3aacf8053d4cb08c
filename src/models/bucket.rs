//! Represents a logical bucket as resolved by the calling request handler.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Versioning configuration of a bucket at the time of a request.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VersioningStatus {
    /// Versioning was never enabled; every write is the `"null"` version.
    #[default]
    Disabled,
    /// Every write receives a fresh version id.
    Enabled,
    /// Versioning was enabled once and is now paused; new writes are `"null"`.
    Suspended,
}

impl VersioningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "Disabled",
            Self::Enabled => "Enabled",
            Self::Suspended => "Suspended",
        }
    }

    /// Total parse: anything unrecognized maps to [`VersioningStatus::Disabled`].
    ///
    /// Callers rely on this never failing so that newer status strings written
    /// by other components degrade to the most conservative behavior.
    pub fn parse(input: &str) -> Self {
        match input {
            "Enabled" => Self::Enabled,
            "Suspended" => Self::Suspended,
            _ => Self::Disabled,
        }
    }
}

impl fmt::Display for VersioningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A storage bucket in the S3-compatible system.
///
/// Bucket lifecycle lives outside this engine; the request handler resolves
/// the bucket and hands it to every metadata operation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Bucket {
    /// Globally unique bucket name (must conform to DNS naming rules).
    pub name: String,

    /// Canonical id of the account that owns this bucket.
    pub owner_id: String,

    /// Versioning state used when confirming writes and deletes.
    pub versioning: VersioningStatus,
}

impl Bucket {
    pub fn new(
        name: impl Into<String>,
        owner_id: impl Into<String>,
        versioning: VersioningStatus,
    ) -> Self {
        Self {
            name: name.into(),
            owner_id: owner_id.into(),
            versioning,
        }
    }

    /// Bucket handle for read-only and maintenance paths where the
    /// versioning state is irrelevant.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, "", VersioningStatus::Disabled)
    }

    pub fn versioning_enabled(&self) -> bool {
        self.versioning == VersioningStatus::Enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioning_parse_falls_back_to_disabled() {
        assert_eq!(VersioningStatus::parse("Enabled"), VersioningStatus::Enabled);
        assert_eq!(
            VersioningStatus::parse("Suspended"),
            VersioningStatus::Suspended
        );
        assert_eq!(VersioningStatus::parse("Disabled"), VersioningStatus::Disabled);
        assert_eq!(VersioningStatus::parse("enabled"), VersioningStatus::Disabled);
        assert_eq!(VersioningStatus::parse(""), VersioningStatus::Disabled);
        assert_eq!(VersioningStatus::parse("MfaDelete"), VersioningStatus::Disabled);
    }

    #[test]
    fn versioning_round_trips_through_display() {
        for status in [
            VersioningStatus::Disabled,
            VersioningStatus::Enabled,
            VersioningStatus::Suspended,
        ] {
            assert_eq!(VersioningStatus::parse(&status.to_string()), status);
        }
    }
}
