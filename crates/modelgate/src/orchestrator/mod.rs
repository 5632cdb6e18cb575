//! Orchestrator
//!
//! Owns the registry of running models and the catalog of launchable ones.
//! Launch and terminate are serialized per uid; operations on different uids,
//! and every read, proceed independently. Inference never holds a registry
//! lock: a `ModelHandle` talks to its runtime directly and only watches the
//! entry's terminated flag.

pub mod handle;
pub mod registry;
pub mod stream;

pub use handle::{ChatGeneration, CompletionGeneration, ModelHandle};
pub use registry::{ModelDescription, ModelRegistry, RunningModelEntry};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{LaunchRequest, ModelCatalog, ModelFamily, RegistrationSummary, MODEL_NAME_RE};
use crate::error::{OrchestratorError, Result};
use crate::metrics;
use crate::model_runtime::RuntimeFactory;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on simultaneously running model instances.
    pub max_running_models: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { max_running_models: 8 }
    }
}

/// Exclusive hold on one uid. The lock table entry is dropped with the last holder.
struct UidGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    uid: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UidGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.uid, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    catalog: Arc<ModelCatalog>,
    factory: Arc<dyn RuntimeFactory>,
    registry: ModelRegistry,
    capacity: Arc<Semaphore>,
    uid_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        catalog: Arc<ModelCatalog>,
        factory: Arc<dyn RuntimeFactory>,
    ) -> Self {
        let capacity = Arc::new(Semaphore::new(config.max_running_models));
        Self {
            config,
            catalog,
            factory,
            registry: ModelRegistry::new(),
            capacity,
            uid_locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn running_count(&self) -> usize {
        self.registry.len()
    }

    async fn lock_uid(&self, uid: &str) -> UidGuard<'_> {
        let lock = self
            .uid_locks
            .entry(uid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        UidGuard {
            locks: &self.uid_locks,
            uid: uid.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Launch a model and return its uid. Nothing becomes visible unless the
    /// runtime initialized successfully.
    pub async fn launch(&self, request: LaunchRequest) -> Result<String> {
        let model = self.catalog.resolve(&request)?;
        let uid = match &request.model_uid {
            Some(uid) if !MODEL_NAME_RE.is_match(uid) => {
                return Err(OrchestratorError::InvalidSpec(format!(
                    "model uid `{}` may only contain letters, digits, `_`, `.` and `-`",
                    uid
                )))
            }
            Some(uid) => uid.clone(),
            None => Uuid::new_v4().to_string(),
        };

        let _uid_guard = self.lock_uid(&uid).await;
        if self.registry.contains(&uid) {
            return Err(OrchestratorError::DuplicateName(format!(
                "model uid `{}` is already running",
                uid
            )));
        }

        let permit = self.capacity.clone().try_acquire_owned().map_err(|_| {
            OrchestratorError::ResourceExhausted(format!(
                "all {} model slots are in use",
                self.config.max_running_models
            ))
        })?;

        let mut runtime = self
            .factory
            .create(&model)
            .map_err(|e| OrchestratorError::InvalidSpec(format!("{:#}", e)))?;

        info!(
            "Launching {} ({} {}B {}) as {}",
            model.family.model_name,
            model.spec.model_format,
            model.spec.model_size_in_billions,
            model.quantization,
            uid
        );
        let runtime_config = self.factory.runtime_config(&uid, &model);
        if let Err(e) = runtime.initialize(runtime_config).await {
            error!("Failed to launch {}: {:#}", uid, e);
            if let Err(cleanup) = runtime.shutdown().await {
                warn!("Cleanup after failed launch of {} also failed: {:#}", uid, cleanup);
            }
            return Err(OrchestratorError::backend(e));
        }

        let runtime_name = runtime.metadata().runtime_name;
        self.registry
            .insert(RunningModelEntry::new(uid.clone(), model, Arc::from(runtime), permit));
        metrics::set_running_models(self.registry.len());
        info!("Model {} is running on {}", uid, runtime_name);
        Ok(uid)
    }

    pub fn list(&self) -> Vec<ModelDescription> {
        self.registry
            .snapshot()
            .iter()
            .map(|entry| entry.describe())
            .collect()
    }

    pub fn get(&self, uid: &str) -> Result<ModelHandle> {
        self.registry
            .get(uid)
            .map(ModelHandle::new)
            .ok_or_else(|| OrchestratorError::model_not_found(uid))
    }

    pub fn describe(&self, uid: &str) -> Result<ModelDescription> {
        self.get(uid).map(|handle| handle.describe())
    }

    /// Release the model's backend and forget it. On a failed release the
    /// entry stays registered and usable, so the call can be retried.
    pub async fn terminate(&self, uid: &str) -> Result<()> {
        let _uid_guard = self.lock_uid(uid).await;
        let entry = self
            .registry
            .get(uid)
            .ok_or_else(|| OrchestratorError::model_not_found(uid))?;

        entry.set_terminated(true);
        if let Err(e) = entry.runtime.shutdown().await {
            entry.set_terminated(false);
            error!("Failed to terminate {}: {:#}", uid, e);
            return Err(OrchestratorError::TerminationFailed {
                uid: uid.to_string(),
                reason: format!("{:#}", e),
            });
        }

        self.registry.remove(uid);
        entry.release_permit();
        metrics::set_running_models(self.registry.len());
        info!("Terminated model {}", uid);
        Ok(())
    }

    /// Terminate everything still running; used on server shutdown.
    pub async fn terminate_all(&self) {
        for description in self.list() {
            if let Err(e) = self.terminate(&description.model_uid).await {
                warn!("{}", e);
            }
        }
    }

    pub fn register_model(&self, model: &str, persist: bool) -> Result<()> {
        let family = ModelFamily::from_json(model)?;
        self.catalog.register(family, persist)
    }

    pub fn unregister_model(&self, model_name: &str) -> Result<()> {
        self.catalog.unregister(model_name)
    }

    pub fn list_model_registrations(&self) -> Vec<RegistrationSummary> {
        self.catalog.list_registrations()
    }

    pub fn get_model_registration(&self, model_name: &str) -> Result<ModelFamily> {
        self.catalog.get_registration(model_name)
    }
}
