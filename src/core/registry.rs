//! # Model Registry
//!
//! Caches each provider's model listing and the derived id set used for routing.
//!
//! ```text
//! ModelRegistry
//! └── slots (sorted by ClientType, i.e. routing order)
//!     ├── provider: Arc<dyn ChatProvider>
//!     └── cache: Mutex<Option<Arc<ProviderCatalog>>>   // None = not loaded
//! ```
//!
//! Each slot's mutex is held across the fetch, so concurrent callers that find
//! an empty cache wait for one fetch instead of racing (single flight). A loaded
//! catalog is an immutable `Arc` snapshot: readers clone the `Arc` and drop the
//! lock. `refresh()` takes every slot lock before clearing, so it waits out any
//! in-flight fetch and nothing fetched before it survives it.
//!
//! Fetch failures are logged and cached as an empty listing. They never reach
//! the caller.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::inference::{ChatProvider, ClientType, Model};

/// One provider's listing plus its derived id set. Built once, never mutated.
#[derive(Debug, Default)]
pub struct ProviderCatalog {
    models: Vec<Model>,
    ids: HashSet<String>,
}

impl ProviderCatalog {
    fn new(models: Vec<Model>) -> Self {
        let ids = models.iter().map(|m| m.model_id.clone()).collect();
        Self { models, ids }
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.ids.contains(model_id)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Model counts per provider, as reported by `preload()`.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelCounts {
    pub groq: usize,
    pub ollama: usize,
    pub total: usize,
}

/// Which provider caches currently hold a listing.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatus {
    pub groq: bool,
    pub ollama: bool,
}

struct ProviderSlot {
    client_type: ClientType,
    provider: Arc<dyn ChatProvider>,
    cache: Mutex<Option<Arc<ProviderCatalog>>>,
}

pub struct ModelRegistry {
    slots: Vec<ProviderSlot>,
}

impl ModelRegistry {
    /// Builds an empty registry over the given providers.
    ///
    /// Providers are ordered by `ClientType`, which fixes the routing
    /// tie-break: Groq is checked before Ollama. A second provider for the
    /// same client type is ignored.
    pub fn new(providers: Vec<Arc<dyn ChatProvider>>) -> Self {
        let mut slots: Vec<ProviderSlot> = Vec::with_capacity(providers.len());
        for provider in providers {
            let client_type = provider.client_type();
            if slots.iter().any(|s| s.client_type == client_type) {
                warn!("Ignoring duplicate {client_type} provider");
                continue;
            }
            slots.push(ProviderSlot {
                client_type,
                provider,
                cache: Mutex::new(None),
            });
        }
        slots.sort_by_key(|s| s.client_type);
        debug!("ModelRegistry initialized with {} providers", slots.len());
        Self { slots }
    }

    fn slot(&self, client_type: ClientType) -> Option<&ProviderSlot> {
        self.slots.iter().find(|s| s.client_type == client_type)
    }

    /// The adapter registered for `client_type`, if any.
    pub fn provider(&self, client_type: ClientType) -> Option<Arc<dyn ChatProvider>> {
        self.slot(client_type).map(|s| s.provider.clone())
    }

    /// Returns the cached catalog for a provider, fetching it on first access.
    ///
    /// Never fails: an unregistered provider or a failed fetch yields an
    /// empty catalog.
    pub async fn get_models(&self, client_type: ClientType) -> Arc<ProviderCatalog> {
        match self.slot(client_type) {
            Some(slot) => Self::load(slot).await,
            None => Arc::new(ProviderCatalog::default()),
        }
    }

    async fn load(slot: &ProviderSlot) -> Arc<ProviderCatalog> {
        let mut cache = slot.cache.lock().await;
        if let Some(catalog) = cache.as_ref() {
            return catalog.clone();
        }

        debug!("Loading {} models from API", slot.client_type);
        let models = match slot.provider.list_models().await {
            Ok(models) => models,
            Err(e) => {
                error!("Failed to fetch {} models: {e}", slot.client_type);
                Vec::new()
            }
        };
        let catalog = Arc::new(ProviderCatalog::new(models));
        info!("Cached {} {} models", catalog.len(), slot.client_type);
        *cache = Some(catalog.clone());
        catalog
    }

    /// All models, Groq first then Ollama. No de-duplication across providers.
    pub async fn get_all_models(&self) -> Vec<Model> {
        let mut all = Vec::new();
        for slot in &self.slots {
            all.extend_from_slice(Self::load(slot).await.models());
        }
        all
    }

    /// O(1) membership test once the provider's catalog is loaded.
    pub async fn is_provider_model(&self, client_type: ClientType, model_id: &str) -> bool {
        self.get_models(client_type).await.contains(model_id)
    }

    /// Routes a model id to its provider. The first provider in routing
    /// order that lists the id wins.
    pub async fn get_model_provider(&self, model_id: &str) -> Option<ClientType> {
        for slot in &self.slots {
            if Self::load(slot).await.contains(model_id) {
                return Some(slot.client_type);
            }
        }
        None
    }

    /// Per-provider and total counts, loading catalogs as needed.
    pub async fn model_counts(&self) -> ModelCounts {
        let mut counts = ModelCounts::default();
        for slot in &self.slots {
            let n = Self::load(slot).await.len();
            match slot.client_type {
                ClientType::Groq => counts.groq = n,
                ClientType::Ollama => counts.ollama = n,
            }
            counts.total += n;
        }
        counts
    }

    /// Drops every cached listing. The next access re-fetches.
    pub async fn refresh(&self) {
        info!("Refreshing model registry cache");
        // Hold all locks at once so no reader sees one cleared slot next to
        // one stale slot. Lock order is slot order everywhere.
        let mut guards = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            guards.push(slot.cache.lock().await);
        }
        for guard in guards.iter_mut() {
            **guard = None;
        }
        debug!("Model registry cache cleared");
    }

    /// Warms every cache so the first chat request doesn't pay fetch latency.
    pub async fn preload(&self) -> ModelCounts {
        info!("Preloading model registry cache");
        let counts = self.model_counts().await;
        info!(
            "Preloaded {} models ({} Groq, {} Ollama)",
            counts.total, counts.groq, counts.ollama
        );
        counts
    }

    /// Reports which caches are loaded without triggering any fetch.
    pub async fn cache_status(&self) -> CacheStatus {
        let mut status = CacheStatus::default();
        for slot in &self.slots {
            let loaded = slot.cache.lock().await.is_some();
            match slot.client_type {
                ClientType::Groq => status.groq = loaded,
                ClientType::Ollama => status.ollama = loaded,
            }
        }
        status
    }
}
