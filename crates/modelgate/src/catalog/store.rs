//! Persistence seam for custom model registrations.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use super::family::ModelFamily;

/// Where registrations flagged `persist` are written so they survive a restart.
pub trait RegistrationStore: Send + Sync {
    fn save(&self, family: &ModelFamily) -> anyhow::Result<()>;
    fn remove(&self, model_name: &str) -> anyhow::Result<()>;
    fn load_all(&self) -> anyhow::Result<Vec<ModelFamily>>;
}

/// One `<model_name>.json` file per registration.
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create registration dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, model_name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", model_name))
    }
}

impl RegistrationStore for JsonDirStore {
    fn save(&self, family: &ModelFamily) -> anyhow::Result<()> {
        let path = self.path_for(&family.model_name);
        let body = serde_json::to_string_pretty(family)?;
        fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
        debug!("Persisted registration {} to {}", family.model_name, path.display());
        Ok(())
    }

    fn remove(&self, model_name: &str) -> anyhow::Result<()> {
        let path = self.path_for(model_name);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    fn load_all(&self) -> anyhow::Result<Vec<ModelFamily>> {
        let mut families = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            match ModelFamily::from_json(&raw) {
                Ok(family) => families.push(family),
                Err(e) => warn!("Skipping unreadable registration {}: {}", path.display(), e),
            }
        }
        Ok(families)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::builtin_families;

    #[test]
    fn test_save_load_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(tmp.path().join("llm")).unwrap();

        let mut family = builtin_families().unwrap().remove(0);
        family.model_name = "my-orca".to_string();
        store.save(&family).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded, vec![family]);

        store.remove("my-orca").unwrap();
        assert!(store.load_all().unwrap().is_empty());

        // Removing something that was never persisted is not an error.
        store.remove("my-orca").unwrap();
    }

    #[test]
    fn test_load_skips_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(tmp.path()).unwrap();
        fs::write(tmp.path().join("broken.json"), "{not json").unwrap();
        fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }
}
