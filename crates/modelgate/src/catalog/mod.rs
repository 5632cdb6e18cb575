//! Model catalog
//!
//! Knows every launchable model family: the built-in ones shipped in
//! `assets/llm_families.json` and custom ones registered at runtime.
//! Custom registrations live in a copy-on-write table behind `ArcSwap`, so
//! readers always see a complete snapshot while writers are serialized.

pub mod family;
pub mod store;

pub use family::{
    LaunchRequest, ModelAbility, ModelFamily, ModelFormat, ModelSpecVariant, ResolvedModel,
    MODEL_NAME_RE,
};
pub use store::{JsonDirStore, RegistrationStore};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{OrchestratorError, Result};

const BUILTIN_FAMILIES: &str = include_str!("../../assets/llm_families.json");

/// Parse the families shipped with the crate.
pub fn builtin_families() -> anyhow::Result<Vec<ModelFamily>> {
    let families: Vec<ModelFamily> = serde_json::from_str(BUILTIN_FAMILIES)?;
    for family in &families {
        family
            .check()
            .map_err(|e| anyhow::anyhow!("built-in family {} is invalid: {}", family.model_name, e))?;
    }
    Ok(families)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationSummary {
    pub model_name: String,
    pub is_builtin: bool,
}

pub struct ModelCatalog {
    builtin: Vec<ModelFamily>,
    custom: ArcSwap<HashMap<String, ModelFamily>>,
    write_lock: Mutex<()>,
    store: Option<Arc<dyn RegistrationStore>>,
}

impl ModelCatalog {
    pub fn new(builtin: Vec<ModelFamily>) -> Self {
        Self {
            builtin,
            custom: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
            store: None,
        }
    }

    pub fn with_builtin() -> anyhow::Result<Self> {
        Ok(Self::new(builtin_families()?))
    }

    /// Attach a persistence store and load whatever it already holds.
    pub fn with_store(mut self, store: Arc<dyn RegistrationStore>) -> anyhow::Result<Self> {
        let persisted = store.load_all()?;
        self.store = Some(store);
        for family in persisted {
            let name = family.model_name.clone();
            match self.insert_custom(family) {
                Ok(()) => info!("Loaded persisted registration: {}", name),
                Err(e) => warn!("Ignoring persisted registration {}: {}", name, e),
            }
        }
        Ok(self)
    }

    fn builtin_family(&self, name: &str) -> Option<&ModelFamily> {
        self.builtin.iter().find(|f| f.model_name == name)
    }

    pub fn get(&self, name: &str) -> Option<ModelFamily> {
        if let Some(family) = self.builtin_family(name) {
            return Some(family.clone());
        }
        self.custom.load().get(name).cloned()
    }

    /// Look up a registration by name; `NotFound` when neither built-in nor custom.
    pub fn get_registration(&self, name: &str) -> Result<ModelFamily> {
        self.get(name)
            .ok_or_else(|| OrchestratorError::registration_not_found(name))
    }

    /// Built-in families first, then custom ones sorted by name.
    pub fn list_registrations(&self) -> Vec<RegistrationSummary> {
        let custom = self.custom.load();
        let mut custom_names: Vec<&String> = custom.keys().collect();
        custom_names.sort();

        self.builtin
            .iter()
            .map(|f| RegistrationSummary {
                model_name: f.model_name.clone(),
                is_builtin: true,
            })
            .chain(custom_names.into_iter().map(|name| RegistrationSummary {
                model_name: name.clone(),
                is_builtin: false,
            }))
            .collect()
    }

    pub fn register(&self, family: ModelFamily, persist: bool) -> Result<()> {
        family.check()?;
        let name = family.model_name.clone();

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_name_free(&name)?;

        if persist {
            match &self.store {
                Some(store) => store.save(&family).map_err(OrchestratorError::backend)?,
                None => warn!(
                    "No registration store configured; {} will not survive a restart",
                    name
                ),
            }
        }

        let mut next = HashMap::clone(&self.custom.load());
        next.insert(name.clone(), family);
        self.custom.store(Arc::new(next));
        info!("Registered model {} (persist: {})", name, persist);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.builtin_family(name).is_some() {
            return Err(OrchestratorError::InvalidSpec(format!(
                "model `{}` is built in and cannot be unregistered",
                name
            )));
        }
        if !self.custom.load().contains_key(name) {
            return Err(OrchestratorError::registration_not_found(name));
        }

        if let Some(store) = &self.store {
            store.remove(name).map_err(OrchestratorError::backend)?;
        }

        let mut next = HashMap::clone(&self.custom.load());
        next.remove(name);
        self.custom.store(Arc::new(next));
        info!("Unregistered model {}", name);
        Ok(())
    }

    /// Validate a launch request against the catalog without side effects.
    pub fn resolve(&self, request: &LaunchRequest) -> Result<ResolvedModel> {
        let family = self.get(&request.model_name).ok_or_else(|| {
            OrchestratorError::InvalidSpec(format!("unknown model name `{}`", request.model_name))
        })?;
        family.resolve(request)
    }

    fn ensure_name_free(&self, name: &str) -> Result<()> {
        if self.builtin_family(name).is_some() || self.custom.load().contains_key(name) {
            return Err(OrchestratorError::DuplicateName(format!(
                "model `{}` is already registered",
                name
            )));
        }
        Ok(())
    }

    fn insert_custom(&self, family: ModelFamily) -> Result<()> {
        family.check()?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_name_free(&family.model_name)?;
        let mut next = HashMap::clone(&self.custom.load());
        next.insert(family.model_name.clone(), family);
        self.custom.store(Arc::new(next));
        Ok(())
    }
}
