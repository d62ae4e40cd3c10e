//! Bind specifications.
//!
//! Binds are kept as typed records. The textual form is
//! `source target [flags]` entries separated by `;`, where flags is a comma
//! list of `ro`, `rw` and `rec`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use stow_common::{StowError, StowResult};

/// Options of one bind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindFlags {
    /// Remount the bound tree read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Include the sub-mounts under the source.
    #[serde(default)]
    pub recursive: bool,
}

/// One bind of a host path into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindSpec {
    /// Host path to bind.
    pub source: PathBuf,
    /// Path inside the container root.
    pub target: PathBuf,
    /// Bind options.
    #[serde(default)]
    pub flags: BindFlags,
}

impl BindSpec {
    /// A read-write, shallow bind.
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            flags: BindFlags::default(),
        }
    }

    /// Mark the bind read-only.
    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.flags.read_only = true;
        self
    }

    /// Mark the bind recursive.
    #[must_use]
    pub const fn recursive(mut self) -> Self {
        self.flags.recursive = true;
        self
    }
}

impl fmt::Display for BindSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.source.display(), self.target.display())?;
        let mut flags = Vec::new();
        if self.flags.read_only {
            flags.push("ro");
        }
        if self.flags.recursive {
            flags.push("rec");
        }
        if !flags.is_empty() {
            write!(f, " {}", flags.join(","))?;
        }
        Ok(())
    }
}

impl FromStr for BindSpec {
    type Err = StowError;

    fn from_str(entry: &str) -> StowResult<Self> {
        let invalid = |reason: &str| StowError::InvalidBindSpec {
            spec: entry.to_string(),
            reason: reason.to_string(),
        };

        let fields: Vec<&str> = entry.split_whitespace().collect();
        let (source, target, flags) = match fields.as_slice() {
            [source, target] => (source, target, None),
            [source, target, flags] => (source, target, Some(flags)),
            _ => return Err(invalid("expected 'source target [flags]'")),
        };

        let source = PathBuf::from(source);
        if !source.is_absolute() {
            return Err(invalid("source must be an absolute path"));
        }

        let mut spec = Self::new(source, *target);
        for flag in flags.iter().flat_map(|f| f.split(',')) {
            match flag {
                "ro" => spec.flags.read_only = true,
                "rw" => spec.flags.read_only = false,
                "rec" => spec.flags.recursive = true,
                "" => {}
                other => return Err(invalid(&format!("unknown flag '{other}'"))),
            }
        }
        Ok(spec)
    }
}

/// Parse a `;`-separated list of bind entries. Empty entries are skipped.
pub fn parse_binds(text: &str) -> StowResult<Vec<BindSpec>> {
    text.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::parse)
        .collect()
}

/// Render binds back into the textual form.
#[must_use]
pub fn format_binds(binds: &[BindSpec]) -> String {
    binds
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
