//! Mount table snapshots in `/proc/<pid>/mountinfo` form.
//!
//! A [`MountTable`] is an ordered list of [`MountEntry`] values. Lookups by
//! path return the last entry for that path, which is the topmost one when
//! several mounts are stacked on the same mount point.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stow_common::{StowError, StowResult};

use super::MountFlags;

/// Kernel peer group id (`shared:N` / `master:N` in mountinfo).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerGroupId(pub u32);

impl fmt::Display for PeerGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One observed mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    /// Mount id.
    pub mount_id: u64,
    /// Parent mount id.
    pub parent_id: u64,
    /// Directory of the filesystem exposed by this mount.
    pub root: PathBuf,
    /// Mount point, relative to the reader's root.
    pub path: PathBuf,
    /// Per-mount options (`rw`/`ro`, `nodev`, `nosuid`, ...).
    pub flags: BTreeSet<String>,
    /// Peer group this mount propagates to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared: Option<PeerGroupId>,
    /// Peer group this mount receives propagation from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<PeerGroupId>,
    /// Filesystem type.
    pub fstype: String,
    /// Mount source.
    pub source: String,
}

impl MountEntry {
    /// True when `flag` is among the per-mount options.
    #[must_use]
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    /// True for `ro` mounts.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.has_flag("ro")
    }

    /// The per-mount options as [`MountFlags`].
    #[must_use]
    pub fn mount_flags(&self) -> MountFlags {
        MountFlags::from_options(self.flags.iter().map(String::as_str))
    }

    /// Parse one mountinfo line.
    ///
    /// Format: `id parent major:minor root mount_point options [optional...] - fstype source super_options`
    pub fn parse(line: &str) -> StowResult<Self> {
        let malformed = |what: &str| StowError::Internal {
            message: format!("malformed mountinfo line ({what}): {line}"),
        };

        let fields: Vec<&str> = line.split_whitespace().collect();
        let separator = fields
            .iter()
            .position(|f| *f == "-")
            .ok_or_else(|| malformed("no separator"))?;
        if separator < 6 || fields.len() < separator + 3 {
            return Err(malformed("too few fields"));
        }

        let mount_id = fields[0].parse().map_err(|_| malformed("mount id"))?;
        let parent_id = fields[1].parse().map_err(|_| malformed("parent id"))?;

        let mut shared = None;
        let mut master = None;
        for optional in &fields[6..separator] {
            if let Some(id) = optional.strip_prefix("shared:") {
                shared = Some(PeerGroupId(id.parse().map_err(|_| malformed("shared"))?));
            } else if let Some(id) = optional.strip_prefix("master:") {
                master = Some(PeerGroupId(id.parse().map_err(|_| malformed("master"))?));
            }
        }

        Ok(Self {
            mount_id,
            parent_id,
            root: PathBuf::from(unescape(fields[3])),
            path: PathBuf::from(unescape(fields[4])),
            flags: fields[5].split(',').map(str::to_string).collect(),
            shared,
            master,
            fstype: fields[separator + 1].to_string(),
            source: unescape(fields[separator + 2]),
        })
    }
}

/// Decode the octal escapes mountinfo uses for space, tab, newline and backslash.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// An ordered snapshot of mount entries for one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    /// Build a table from entries already in mount order.
    #[must_use]
    pub fn from_entries(entries: Vec<MountEntry>) -> Self {
        Self { entries }
    }

    /// Parse the full text of a mountinfo file.
    pub fn parse(content: &str) -> StowResult<Self> {
        let entries = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(MountEntry::parse)
            .collect::<StowResult<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// Read a mountinfo file.
    pub fn read(path: &Path) -> StowResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Mount table of the calling process.
    pub fn read_self() -> StowResult<Self> {
        Self::read(Path::new("/proc/self/mountinfo"))
    }

    /// Mount table as seen by `pid`.
    pub fn read_pid(pid: u32) -> StowResult<Self> {
        Self::read(&PathBuf::from(format!("/proc/{pid}/mountinfo")))
    }

    /// Topmost entry mounted exactly at `path`.
    #[must_use]
    pub fn get(&self, path: impl AsRef<Path>) -> Option<&MountEntry> {
        let path = path.as_ref();
        self.entries.iter().rev().find(|e| e.path == path)
    }

    /// True when something is mounted exactly at `path`.
    #[must_use]
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.get(path).is_some()
    }

    /// Entries at `path` or below it, in mount order.
    pub fn under<'a>(&'a self, path: &'a Path) -> impl Iterator<Item = &'a MountEntry> + 'a {
        self.entries.iter().filter(move |e| e.path.starts_with(path))
    }

    /// All entries in mount order.
    pub fn iter(&self) -> impl Iterator<Item = &MountEntry> {
        self.entries.iter()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for MountTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            let flags: Vec<&str> = entry.flags.iter().map(String::as_str).collect();
            write!(f, "{} {} {}", entry.path.display(), entry.fstype, flags.join(","))?;
            if let Some(shared) = entry.shared {
                write!(f, " shared:{shared}")?;
            }
            if let Some(master) = entry.master {
                write!(f, " master:{master}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
23 22 0:5 / /dev rw,nosuid shared:2 - devtmpfs udev rw,size=4096k
40 22 8:1 /var/lib/stow/volumes/a/storage /var/lib/stow/volumes/a/volume rw,nosuid,nodev shared:30 master:1 - ext4 /dev/sda1 rw
41 40 8:1 /srv /var/lib/stow/volumes/a/volume/my\\040dir ro,nosuid,nodev master:30 - ext4 /dev/sda1 rw
";

    #[test]
    fn parses_propagation_fields() {
        let table = MountTable::parse(SAMPLE).unwrap();
        assert_eq!(table.len(), 4);

        let root = table.get("/").unwrap();
        assert_eq!(root.shared, Some(PeerGroupId(1)));
        assert_eq!(root.master, None);
        assert_eq!(root.fstype, "ext4");

        let volume = table.get("/var/lib/stow/volumes/a/volume").unwrap();
        assert_eq!(volume.shared, Some(PeerGroupId(30)));
        assert_eq!(volume.master, Some(PeerGroupId(1)));
        assert!(volume.has_flag("nodev"));
        assert!(volume.has_flag("nosuid"));
        assert!(!volume.is_read_only());
    }

    #[test]
    fn decodes_escaped_paths() {
        let table = MountTable::parse(SAMPLE).unwrap();
        let entry = table.get("/var/lib/stow/volumes/a/volume/my dir").unwrap();
        assert!(entry.is_read_only());
        assert_eq!(entry.master, Some(PeerGroupId(30)));
        assert_eq!(entry.shared, None);
    }

    #[test]
    fn under_includes_the_path_itself() {
        let table = MountTable::parse(SAMPLE).unwrap();
        let below: Vec<_> = table
            .under(Path::new("/var/lib/stow/volumes/a/volume"))
            .map(|e| e.mount_id)
            .collect();
        assert_eq!(below, vec![40, 41]);
    }

    #[test]
    fn stacked_mounts_return_topmost() {
        let content = "\
1 0 8:1 / / rw - ext4 /dev/sda1 rw
2 1 0:1 / /mnt rw - tmpfs tmpfs rw
3 2 0:2 / /mnt ro - tmpfs tmpfs rw
";
        let table = MountTable::parse(content).unwrap();
        assert_eq!(table.get("/mnt").unwrap().mount_id, 3);
    }

    #[test]
    fn rejects_truncated_lines() {
        assert!(MountTable::parse("1 0 8:1 / /").is_err());
    }

    proptest! {
        #[test]
        fn escaped_spaces_round_trip(name in "[a-z]{1,8}( [a-z]{1,8}){0,2}") {
            let escaped = name.replace(' ', "\\040");
            let line = format!("5 1 0:3 / /mnt/{escaped} rw - tmpfs tmpfs rw");
            let entry = MountEntry::parse(&line).unwrap();
            prop_assert_eq!(entry.path, PathBuf::from(format!("/mnt/{name}")));
        }
    }
}
