use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

pub const DEFAULT_OPENROUTER_MODEL: &str = "openai/gpt-4.1";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Provider prefix of a routed id such as `openai/gpt-4.1`.
    pub fn vendor(&self) -> Option<&str> {
        self.id.split_once('/').map(|(vendor, _)| vendor)
    }

    /// OpenRouter marks zero-cost variants with a `free` suffix.
    pub fn is_free(&self) -> bool {
        self.id.ends_with("free")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCatalogSource {
    ProviderApi,
    CacheFresh,
    CacheStaleFallback,
    StaticFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    pub models: Vec<Model>,
    pub source: ModelCatalogSource,
    pub warning: Option<String>,
}

impl ModelCatalog {
    pub fn from_provider_api(models: Vec<Model>) -> Self {
        Self {
            models,
            source: ModelCatalogSource::ProviderApi,
            warning: None,
        }
    }

    pub fn from_cache_fresh(models: Vec<Model>) -> Self {
        Self {
            models,
            source: ModelCatalogSource::CacheFresh,
            warning: None,
        }
    }

    pub fn from_cache_stale(models: Vec<Model>, warning: String) -> Self {
        Self {
            models,
            source: ModelCatalogSource::CacheStaleFallback,
            warning: Some(warning),
        }
    }

    pub fn from_static_fallback(models: Vec<Model>, warning: String) -> Self {
        Self {
            models,
            source: ModelCatalogSource::StaticFallback,
            warning: Some(warning),
        }
    }

    pub fn free_models(&self) -> Vec<Model> {
        self.models
            .iter()
            .filter(|model| model.is_free())
            .cloned()
            .collect()
    }
}

struct CacheEntry {
    models: Vec<Model>,
    fetched_at: Instant,
}

/// Model-list cache keyed by provider id. Completions are never cached.
pub struct ModelCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl ModelCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_secs(60 * 60))
    }

    pub async fn get_fresh(&self, provider_id: &str) -> Option<Vec<Model>> {
        let entries = self.entries.read().await;
        entries.get(provider_id).and_then(|entry| {
            if entry.fetched_at.elapsed() < self.ttl {
                Some(entry.models.clone())
            } else {
                None
            }
        })
    }

    pub async fn get_any(&self, provider_id: &str) -> Option<Vec<Model>> {
        let entries = self.entries.read().await;
        entries.get(provider_id).map(|entry| entry.models.clone())
    }

    pub async fn set(&self, provider_id: &str, models: Vec<Model>) {
        let mut entries = self.entries.write().await;
        entries.insert(
            provider_id.to_string(),
            CacheEntry {
                models,
                fetched_at: Instant::now(),
            },
        );
    }
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::with_default_ttl()
    }
}

pub fn default_openrouter_models() -> Vec<Model> {
    vec![
        Model::from_id("openai/gpt-4.1").with_description("Strong general-purpose default"),
        Model::from_id("openai/gpt-4o-mini").with_description("Balanced cost/performance"),
        Model::from_id("anthropic/claude-3.5-sonnet")
            .with_description("Long-form writing and code"),
        Model::from_id("meta-llama/llama-3.3-70b-instruct:free")
            .with_description("Free open-weight model"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_models_are_filtered_by_suffix() {
        let catalog = ModelCatalog::from_provider_api(default_openrouter_models());
        let free = catalog.free_models();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].id, "meta-llama/llama-3.3-70b-instruct:free");
        assert_eq!(free[0].vendor(), Some("meta-llama"));
    }

    #[tokio::test]
    async fn stale_entries_are_still_served_by_get_any() {
        let cache = ModelCache::new(Duration::ZERO);
        cache.set("openrouter", vec![Model::from_id("a/b")]).await;

        assert!(cache.get_fresh("openrouter").await.is_none());
        assert_eq!(
            cache.get_any("openrouter").await,
            Some(vec![Model::from_id("a/b")])
        );
        assert!(cache.get_any("other").await.is_none());
    }
}
