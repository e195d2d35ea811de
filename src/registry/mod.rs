pub mod api;

use log::{ debug, error, info, warn };
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use thiserror::Error;

use crate::llm::LlmError;
use crate::models::model::{ LoadParams, ModelEntry, ModelStatus };
use self::api::ModelApi;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown model '{0}'")]
    UnknownModel(String),
    #[error("model '{id}' cannot go from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ModelStatus,
        to: ModelStatus,
    },
    #[error("model API call failed: {0}")]
    Remote(#[from] LlmError),
}

/// Client-side view of the server's models and their lifecycle status.
///
/// The collection is only ever written by the methods below. Status changes
/// follow [`ModelStatus::can_transition_to`]; a completion that arrives
/// after `fetch_all` replaced the entry is dropped, since the fresh snapshot
/// is authoritative.
pub struct ModelRegistry {
    api: Arc<dyn ModelApi>,
    models: Mutex<Vec<ModelEntry>>,
}

impl ModelRegistry {
    pub fn new(api: Arc<dyn ModelApi>) -> Self {
        Self {
            api,
            models: Mutex::new(Vec::new()),
        }
    }

    fn models(&self) -> MutexGuard<'_, Vec<ModelEntry>> {
        self.models.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn fetch_all(&self) -> Result<usize, RegistryError> {
        let fresh = self.api.list_models().await?;
        let count = fresh.len();
        *self.models() = fresh;
        debug!("Model registry refreshed with {} entries", count);
        Ok(count)
    }

    /// Re-reads one model's details and replaces (or adds) its entry.
    pub async fn refresh(&self, id: &str) -> Result<ModelEntry, RegistryError> {
        let entry = self.api.model_details(id).await?;
        let mut models = self.models();
        match models.iter_mut().find(|m| m.id == entry.id) {
            Some(existing) => {
                *existing = entry.clone();
            }
            None => models.push(entry.clone()),
        }
        Ok(entry)
    }

    pub async fn rescan(&self) -> Result<usize, RegistryError> {
        let scanned = self.api.scan_models().await?;
        info!("Server rescan found {} model files", scanned);
        self.fetch_all().await
    }

    pub async fn load(&self, id: &str, params: Option<LoadParams>) -> Result<(), RegistryError> {
        let current = self.status(id).ok_or_else(|| RegistryError::UnknownModel(id.to_string()))?;
        if current == ModelStatus::Loaded {
            debug!("Model {} already loaded", id);
            return Ok(());
        }
        self.transition(id, ModelStatus::Loading)?;

        let params = params.unwrap_or_default();
        info!("Loading model {} (ctx_size={}, n_gpu_layers={})", id, params.ctx_size, params.n_gpu_layers);
        match self.api.load_model(id, &params).await {
            Ok(()) => {
                self.settle(id, ModelStatus::Loading, ModelStatus::Loaded);
                info!("Model {} loaded", id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to load model {}: {}", id, e);
                self.settle(id, ModelStatus::Loading, ModelStatus::Error);
                Err(e.into())
            }
        }
    }

    /// Waits for the server to acknowledge before marking the model unloaded.
    pub async fn unload(&self, id: &str) -> Result<(), RegistryError> {
        let current = self.status(id).ok_or_else(|| RegistryError::UnknownModel(id.to_string()))?;
        match current {
            ModelStatus::Unloaded => {
                return Ok(());
            }
            ModelStatus::Loaded => {}
            from => {
                return Err(RegistryError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    to: ModelStatus::Unloaded,
                });
            }
        }

        self.api.unload_model(id).await?;
        self.settle(id, ModelStatus::Loaded, ModelStatus::Unloaded);
        info!("Model {} unloaded", id);
        Ok(())
    }

    /// Flips the flag before the server confirms; on failure the exact prior
    /// value is written back. Returns the new value.
    pub async fn toggle_favorite(&self, id: &str) -> Result<bool, RegistryError> {
        let previous = {
            let mut models = self.models();
            let entry = models
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or_else(|| RegistryError::UnknownModel(id.to_string()))?;
            let previous = entry.favorite;
            entry.favorite = !previous;
            previous
        };

        match self.api.set_favorite(id, !previous).await {
            Ok(()) => Ok(!previous),
            Err(e) => {
                warn!("Could not persist favorite for {}, rolling back: {}", id, e);
                if let Some(entry) = self.models().iter_mut().find(|m| m.id == id) {
                    entry.favorite = previous;
                }
                Err(e.into())
            }
        }
    }

    pub fn all(&self) -> Vec<ModelEntry> {
        self.models().clone()
    }

    pub fn loaded(&self) -> Vec<ModelEntry> {
        self.models()
            .iter()
            .filter(|m| m.status == ModelStatus::Loaded)
            .cloned()
            .collect()
    }

    pub fn favorites(&self) -> Vec<ModelEntry> {
        self.models()
            .iter()
            .filter(|m| m.favorite)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<ModelEntry> {
        self.models()
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    pub fn status(&self, id: &str) -> Option<ModelStatus> {
        self.models()
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.status)
    }

    fn transition(&self, id: &str, to: ModelStatus) -> Result<(), RegistryError> {
        let mut models = self.models();
        let entry = models
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| RegistryError::UnknownModel(id.to_string()))?;
        if !entry.status.can_transition_to(to) {
            return Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from: entry.status,
                to,
            });
        }
        entry.status = to;
        Ok(())
    }

    // Completes an in-flight transition only if nothing replaced the entry's
    // status in the meantime.
    fn settle(&self, id: &str, expected: ModelStatus, to: ModelStatus) {
        let mut models = self.models();
        match models.iter_mut().find(|m| m.id == id) {
            Some(entry) if entry.status == expected => {
                entry.status = to;
            }
            Some(entry) => {
                debug!("Dropping {} -> {} for {}: status is now {}", expected, to, id, entry.status);
            }
            None => {
                debug!("Dropping {} -> {} for {}: no longer listed", expected, to, id);
            }
        }
    }
}
