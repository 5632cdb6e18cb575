//! Running-model registry: the only path from a uid to a live runtime.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, OwnedSemaphorePermit};

use crate::catalog::{ModelAbility, ModelFormat, ResolvedModel};
use crate::model_runtime::ModelRuntime;

/// Read-only view of a running model, as returned by `list` and `get_model`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescription {
    pub model_uid: String,
    pub model_name: String,
    pub model_format: ModelFormat,
    pub model_size_in_billions: u32,
    pub quantization: String,
    pub model_ability: Vec<ModelAbility>,
    pub model_lang: Vec<String>,
    pub created_at: DateTime<Utc>,
}

pub struct RunningModelEntry {
    pub uid: String,
    pub model: ResolvedModel,
    pub runtime: Arc<dyn ModelRuntime>,
    pub created_at: DateTime<Utc>,
    terminated: watch::Sender<bool>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl RunningModelEntry {
    pub fn new(
        uid: String,
        model: ResolvedModel,
        runtime: Arc<dyn ModelRuntime>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        let (terminated, _) = watch::channel(false);
        Self {
            uid,
            model,
            runtime,
            created_at: Utc::now(),
            terminated,
            permit: Mutex::new(Some(permit)),
        }
    }

    pub fn describe(&self) -> ModelDescription {
        ModelDescription {
            model_uid: self.uid.clone(),
            model_name: self.model.family.model_name.clone(),
            model_format: self.model.spec.model_format,
            model_size_in_billions: self.model.spec.model_size_in_billions,
            quantization: self.model.quantization.clone(),
            model_ability: self.model.family.model_ability.clone(),
            model_lang: self.model.family.model_lang.clone(),
            created_at: self.created_at,
        }
    }

    pub fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    pub fn watch_terminated(&self) -> watch::Receiver<bool> {
        self.terminated.subscribe()
    }

    pub(crate) fn set_terminated(&self, terminated: bool) {
        self.terminated.send_replace(terminated);
    }

    /// Give the capacity slot back. Idempotent.
    pub(crate) fn release_permit(&self) {
        let permit = self
            .permit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(permit);
    }
}

/// Concurrent uid → entry map. Reads never block on writers of other uids.
#[derive(Default)]
pub struct ModelRegistry {
    entries: DashMap<String, Arc<RunningModelEntry>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: RunningModelEntry) -> Arc<RunningModelEntry> {
        let entry = Arc::new(entry);
        self.entries.insert(entry.uid.clone(), entry.clone());
        entry
    }

    pub fn get(&self, uid: &str) -> Option<Arc<RunningModelEntry>> {
        self.entries.get(uid).map(|e| e.value().clone())
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.entries.contains_key(uid)
    }

    pub fn remove(&self, uid: &str) -> Option<Arc<RunningModelEntry>> {
        self.entries.remove(uid).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every entry present at call time, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<RunningModelEntry>> {
        let mut entries: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.uid.cmp(&b.uid)));
        entries
    }
}
