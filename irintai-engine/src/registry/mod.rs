//! In-memory model status registry.
//!
//! The registry is the single source of truth for model status. It performs
//! no I/O; the supervisor and the installer drive it, and a single listener
//! is told about changes to the model currently considered active.

mod status;

pub use status::ModelStatus;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Callback invoked as `(model, status)` when the current model changes status.
pub type StatusListener = Arc<dyn Fn(&str, ModelStatus) + Send + Sync>;

/// Models suggested to users before anything is installed:
/// `(name, context hint, note)`.
pub const RECOMMENDED_MODELS: &[(&str, &str, &str)] = &[
    ("deepseek-coder:6.7b", "4K", "Great for code"),
    ("starcoder2:7b", "16K", "Strong coder model"),
    ("mistral:instruct", "8K", "Balanced assistant"),
    ("zephyr:beta", "8K", "Conversational chat"),
    ("nous-hermes-llama2-13b", "4K", "Deep thinker, needs 8-bit"),
    ("codellama:13b-python", "4K-16K", "Strong dev model (8-bit)"),
];

/// Everything the registry knows about one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub status: ModelStatus,
    /// Context size hint, e.g. "8K"
    pub context: Option<String>,
    pub notes: Option<String>,
    /// Installed size as reported by the engine, e.g. "3.8 GB"
    pub size: Option<String>,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>, status: ModelStatus) -> Self {
        Self {
            name: name.into(),
            status,
            context: None,
            notes: None,
            size: None,
        }
    }
}

#[derive(Default)]
struct Inner {
    models: BTreeMap<String, ModelDescriptor>,
    current: Option<String>,
}

/// Authoritative model name → status map.
#[derive(Default)]
pub struct ModelRegistry {
    inner: RwLock<Inner>,
    listener: RwLock<Option<StatusListener>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry seeded with [`RECOMMENDED_MODELS`] as not installed.
    pub fn with_recommended() -> Self {
        let registry = Self::new();
        {
            let mut inner = registry.write();
            for (name, context, note) in RECOMMENDED_MODELS {
                let mut descriptor = ModelDescriptor::new(*name, ModelStatus::NotInstalled);
                descriptor.context = Some((*context).to_string());
                descriptor.notes = Some((*note).to_string());
                inner.models.insert((*name).to_string(), descriptor);
            }
        }
        registry
    }

    /// Register the status change listener, replacing any previous one.
    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(&str, ModelStatus) + Send + Sync + 'static,
    {
        *self
            .listener
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(listener));
    }

    pub fn clear_listener(&self) {
        *self
            .listener
            .write()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Status of `name`, `NotInstalled` if unknown.
    pub fn status(&self, name: &str) -> ModelStatus {
        self.status_or(name, ModelStatus::NotInstalled)
    }

    pub fn status_or(&self, name: &str, default: ModelStatus) -> ModelStatus {
        self.read()
            .models
            .get(name)
            .map(|d| d.status)
            .unwrap_or(default)
    }

    pub fn descriptor(&self, name: &str) -> Option<ModelDescriptor> {
        self.read().models.get(name).cloned()
    }

    /// All known models, ordered by name.
    pub fn list(&self) -> Vec<ModelDescriptor> {
        self.read().models.values().cloned().collect()
    }

    /// Mark `name` as the model whose changes reach the listener.
    pub fn set_current(&self, name: Option<&str>) {
        self.write().current = name.map(str::to_string);
    }

    pub fn current(&self) -> Option<String> {
        self.read().current.clone()
    }

    /// Apply a status transition, returning the previous status.
    ///
    /// Transitions outside the table in [`ModelStatus::allowed_targets`] are
    /// rejected and leave the map untouched.
    pub fn transition(&self, name: &str, status: ModelStatus) -> Result<ModelStatus> {
        let (is_current, previous) = {
            let mut inner = self.write();
            let previous = inner
                .models
                .get(name)
                .map(|d| d.status)
                .unwrap_or(ModelStatus::NotInstalled);

            if !previous.can_transition_to(status) {
                return Err(EngineError::InvalidTransition {
                    model: name.to_string(),
                    from: previous,
                    to: status,
                });
            }

            inner
                .models
                .entry(name.to_string())
                .or_insert_with(|| ModelDescriptor::new(name, ModelStatus::NotInstalled))
                .status = status;
            debug!(model = name, from = %previous, to = %status, "Model status");
            (inner.current.as_deref() == Some(name), previous)
        };

        if is_current {
            let listener = self
                .listener
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(listener) = listener {
                listener(name, status);
            }
        }

        Ok(previous)
    }

    /// Apply a status transition, logging instead of failing when rejected.
    ///
    /// Returns whether the transition was applied.
    pub fn set_status(&self, name: &str, status: ModelStatus) -> bool {
        match self.transition(name, status) {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Ignoring status change");
                false
            }
        }
    }

    /// Record the installed size reported by the engine.
    pub fn set_installed_size(&self, name: &str, size: Option<String>) {
        if let Some(descriptor) = self.write().models.get_mut(name) {
            descriptor.size = size;
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("ModelRegistry")
            .field("models", &inner.models.len())
            .field("current", &inner.current)
            .finish()
    }
}
