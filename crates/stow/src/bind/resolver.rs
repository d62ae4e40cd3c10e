//! Resolution of bind targets inside a container root.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use stow_common::{StowError, StowResult};

/// Symlinks followed before resolution gives up, as in the kernel's path walk.
pub const MAX_SYMLINKS: usize = 40;

#[derive(Debug)]
enum Step {
    Parent,
    Name(OsString),
}

fn steps(path: &Path) -> impl DoubleEndedIterator<Item = Step> + '_ {
    path.components().filter_map(|c| match c {
        Component::Normal(name) => Some(Step::Name(name.to_os_string())),
        Component::ParentDir => Some(Step::Parent),
        Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
    })
}

/// Resolves paths against an effective root, keeping every symlink inside it.
#[derive(Debug, Clone, Copy)]
pub struct BindResolver {
    max_symlinks: usize,
}

impl Default for BindResolver {
    fn default() -> Self {
        Self::new(MAX_SYMLINKS)
    }
}

impl BindResolver {
    /// Create a resolver following at most `max_symlinks` links per lookup.
    #[must_use]
    pub const fn new(max_symlinks: usize) -> Self {
        Self { max_symlinks }
    }

    /// Resolve `target` (absolute or relative, both taken from `root`) to the
    /// host path a mount should be placed on.
    ///
    /// Absolute symlinks restart from `root`, relative ones from the directory
    /// holding them, and `..` stops at `root`. Components that do not exist
    /// yet are kept as written.
    pub fn resolve(&self, root: &Path, target: &Path) -> StowResult<PathBuf> {
        let fail = |reason: String| StowError::SymlinkResolution {
            path: target.to_path_buf(),
            reason,
        };

        let mut resolved = PathBuf::new();
        let mut pending: VecDeque<Step> = steps(target).collect();
        let mut followed = 0;

        while let Some(step) = pending.pop_front() {
            let name = match step {
                Step::Parent => {
                    resolved.pop();
                    continue;
                }
                Step::Name(name) => name,
            };

            let candidate = resolved.join(&name);
            let host = root.join(&candidate);
            let is_link = std::fs::symlink_metadata(&host)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
            if !is_link {
                resolved = candidate;
                continue;
            }

            followed += 1;
            if followed > self.max_symlinks {
                return Err(fail(format!(
                    "more than {} symlinks followed",
                    self.max_symlinks
                )));
            }

            let link = std::fs::read_link(&host)
                .map_err(|e| fail(format!("cannot read {}: {e}", host.display())))?;
            if link.as_os_str().is_empty() {
                return Err(fail(format!("{} is an empty symlink", host.display())));
            }
            tracing::trace!(
                link = %host.display(),
                destination = %link.display(),
                "Following symlink"
            );

            if link.is_absolute() {
                resolved = PathBuf::new();
            }
            for step in steps(&link).rev() {
                pending.push_front(step);
            }
        }

        if resolved.as_os_str().is_empty() {
            Ok(root.to_path_buf())
        } else {
            Ok(root.join(resolved))
        }
    }
}
