//! Container record and link persistence.

use std::path::PathBuf;

use stow_common::{ContainerId, StowError, StowPaths, StowResult};

use super::container::Container;
use super::link::VolumeLink;

/// Reads and writes `container.json` and `links.json` per container.
#[derive(Debug, Clone)]
pub struct StateManager {
    paths: StowPaths,
}

impl StateManager {
    /// Create a new state manager.
    pub fn new(paths: StowPaths) -> Self {
        Self { paths }
    }

    /// Get the path to a container's record.
    pub fn state_path(&self, id: &ContainerId) -> PathBuf {
        self.paths.container(id.as_str()).join("container.json")
    }

    /// Save a container record.
    pub fn save(&self, container: &Container) -> StowResult<()> {
        let path = self.state_path(container.id());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(container)?;
        std::fs::write(&path, json)?;

        tracing::debug!(
            container_id = %container.id(),
            path = %path.display(),
            "Saved container state"
        );
        Ok(())
    }

    /// Load a container record.
    pub fn load(&self, id: &ContainerId) -> StowResult<Container> {
        let path = self.state_path(id);
        if !path.exists() {
            return Err(StowError::ContainerNotFound { id: id.to_string() });
        }

        let json = std::fs::read_to_string(&path)?;
        let container: Container = serde_json::from_str(&json)?;

        tracing::debug!(
            container_id = %id,
            path = %path.display(),
            "Loaded container state"
        );
        Ok(container)
    }

    /// Save the links of a container.
    pub fn save_links(&self, id: &ContainerId, links: &[VolumeLink]) -> StowResult<()> {
        let path = self.paths.container_links(id.as_str());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(links)?)?;
        tracing::debug!(container_id = %id, count = links.len(), "Saved links");
        Ok(())
    }

    /// Load the links of a container; none when never saved.
    pub fn load_links(&self, id: &ContainerId) -> StowResult<Vec<VolumeLink>> {
        let path = self.paths.container_links(id.as_str());
        if !path.exists() {
            return Ok(Vec::new());
        }
        let json = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Delete a container's record and links.
    pub fn delete(&self, id: &ContainerId) -> StowResult<()> {
        let container_dir = self.paths.container(id.as_str());
        if container_dir.exists() {
            std::fs::remove_dir_all(&container_dir)?;
            tracing::debug!(
                container_id = %id,
                path = %container_dir.display(),
                "Deleted container state"
            );
        }
        Ok(())
    }

    /// List all saved containers.
    pub fn list(&self) -> StowResult<Vec<ContainerId>> {
        let mut containers = Vec::new();
        let dir = self.paths.containers();
        if !dir.exists() {
            return Ok(containers);
        }

        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.path().join("container.json").exists() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                match ContainerId::new(name) {
                    Ok(id) => containers.push(id),
                    Err(e) => tracing::warn!(name, error = %e, "Skipping container directory"),
                }
            }
        }
        containers.sort();
        Ok(containers)
    }

    /// Check if a container record exists.
    pub fn exists(&self, id: &ContainerId) -> bool {
        self.state_path(id).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use stow_common::VolumeId;
    use tempfile::tempdir;

    fn id(name: &str) -> ContainerId {
        ContainerId::new(name).unwrap()
    }

    #[test]
    fn save_and_load_state() {
        let temp = tempdir().unwrap();
        let manager = StateManager::new(StowPaths::with_root(temp.path()));

        let mut container = Container::new(id("test-container"));
        container.set_root(Some("/srv/root".into())).unwrap();
        manager.save(&container).unwrap();

        let loaded = manager.load(&id("test-container")).unwrap();
        assert_eq!(loaded.root(), Some(Path::new("/srv/root")));
        assert!(matches!(
            manager.load(&id("missing")),
            Err(StowError::ContainerNotFound { .. })
        ));
    }

    #[test]
    fn list_containers() {
        let temp = tempdir().unwrap();
        let manager = StateManager::new(StowPaths::with_root(temp.path()));

        manager.save(&Container::new(id("container-2"))).unwrap();
        manager.save(&Container::new(id("container-1"))).unwrap();

        assert_eq!(
            manager.list().unwrap(),
            vec![id("container-1"), id("container-2")]
        );
    }

    #[test]
    fn links_round_trip_and_delete() {
        let temp = tempdir().unwrap();
        let manager = StateManager::new(StowPaths::with_root(temp.path()));
        let a = id("a");
        assert!(manager.load_links(&a).unwrap().is_empty());

        let link = VolumeLink::new(VolumeId::generate(), a.clone(), "/data".into(), true);
        manager.save(&Container::new(a.clone())).unwrap();
        manager.save_links(&a, std::slice::from_ref(&link)).unwrap();
        assert_eq!(manager.load_links(&a).unwrap(), vec![link]);

        manager.delete(&a).unwrap();
        assert!(!manager.exists(&a));
        assert!(manager.load_links(&a).unwrap().is_empty());
    }
}
