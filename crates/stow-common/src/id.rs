//! Container and volume identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{StowError, StowResult};

/// A container name, safe to use as a directory name and a namespace key.
///
/// 1 to 64 ASCII letters, digits, `-` or `_`, beginning with a letter or digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    /// Longest accepted name.
    pub const MAX_LENGTH: usize = 64;

    /// Validate `id` as a container name.
    pub fn new(id: impl Into<String>) -> StowResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// The name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> StowResult<()> {
        let invalid = || StowError::InvalidContainerId { id: id.to_string() };

        let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_');
        match id.chars().next() {
            Some(first)
                if first.is_ascii_alphanumeric()
                    && id.len() <= Self::MAX_LENGTH
                    && id.chars().all(allowed) =>
            {
                Ok(())
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContainerId {
    type Err = StowError;

    fn from_str(s: &str) -> StowResult<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ContainerId {
    type Error = StowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A volume identifier: 12 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(String);

impl VolumeId {
    /// A fresh id: the first six bytes of a random uuid, hex encoded.
    #[must_use]
    pub fn generate() -> Self {
        Self(hex::encode(&uuid::Uuid::new_v4().as_bytes()[..6]))
    }

    /// The hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VolumeId {
    type Err = StowError;

    fn from_str(s: &str) -> StowResult<Self> {
        if s.len() == 12 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(StowError::VolumeNotFound { id: s.to_string() })
        }
    }
}
