use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::resolve_api_key;
use crate::error::ChatError;
use crate::models::{ModelConfig, ProviderRow, ProviderType, TitleGenerationConfig};
use crate::storage::StorageManager;

const TITLE_GENERATION_KEY: &str = "title_generation";

/// A provider with its credentials resolved and models indexed by id.
#[derive(Clone, Serialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub provider_type: ProviderType,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub models: HashMap<String, ModelConfig>,
}

impl ProviderInfo {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        provider_type: ProviderType,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider_type,
            base_url: base_url.into(),
            api_key: api_key.into(),
            models: HashMap::new(),
        }
    }

    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.models.insert(model.id.clone(), model);
        self
    }
}

// Keys stay out of logs
impl fmt::Debug for ProviderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("provider_type", &self.provider_type)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The provider and model a request was resolved to.
#[derive(Clone, Debug)]
pub struct ResolvedModel {
    pub provider: Arc<ProviderInfo>,
    pub model: ModelConfig,
}

/// An immutable view of every usable provider plus process-wide settings.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    pub providers: HashMap<String, Arc<ProviderInfo>>,
    pub title_generation: Option<TitleGenerationConfig>,
}

impl RegistrySnapshot {
    pub fn resolve(&self, provider_id: &str, model_id: &str) -> Result<ResolvedModel, ChatError> {
        let provider = self
            .providers
            .get(provider_id)
            .ok_or_else(|| ChatError::InvalidInput(format!("Unknown provider '{}'", provider_id)))?;
        let model = provider.models.get(model_id).ok_or_else(|| {
            ChatError::InvalidInput(format!(
                "Unknown model '{}' for provider '{}'",
                model_id, provider_id
            ))
        })?;
        Ok(ResolvedModel {
            provider: provider.clone(),
            model: model.clone(),
        })
    }

    /// Providers sorted by id, for listing.
    pub fn sorted_providers(&self) -> Vec<Arc<ProviderInfo>> {
        let mut providers: Vec<_> = self.providers.values().cloned().collect();
        providers.sort_by(|a, b| a.id.cmp(&b.id));
        providers
    }
}

fn provider_from_row(row: &ProviderRow) -> Result<Option<ProviderInfo>> {
    let Some(provider_type) = ProviderType::parse(&row.provider_type) else {
        log::warn!(
            "Skipping provider '{}': unknown provider type '{}'",
            row.id,
            row.provider_type
        );
        return Ok(None);
    };
    if row.model.trim().is_empty() {
        log::warn!("Skipping provider '{}': no models configured", row.id);
        return Ok(None);
    }
    let models: Vec<ModelConfig> = serde_json::from_str(&row.model)
        .with_context(|| format!("Invalid model list for provider '{}'", row.id))?;
    let api_key = match resolve_api_key(&row.name, &row.api_key) {
        Ok(key) => key,
        Err(e) => {
            log::warn!("Skipping provider '{}': {:#}", row.id, e);
            return Ok(None);
        }
    };

    let info = models.into_iter().fold(
        ProviderInfo::new(&row.id, &row.name, provider_type, &row.base_url, api_key),
        ProviderInfo::with_model,
    );
    Ok(Some(info))
}

/// Builds a snapshot from raw rows and system config.
///
/// Malformed model JSON fails the whole build so a refresh never publishes a
/// half-loaded registry.
pub fn build_snapshot(
    rows: &[ProviderRow],
    system_config: &HashMap<String, String>,
) -> Result<RegistrySnapshot> {
    let mut providers = HashMap::new();
    for row in rows.iter().filter(|row| row.is_active) {
        if let Some(info) = provider_from_row(row)? {
            log::debug!("Registered provider {:?}", info);
            providers.insert(info.id.clone(), Arc::new(info));
        }
    }

    let title_generation = match system_config.get(TITLE_GENERATION_KEY) {
        Some(raw) => match serde_json::from_str::<TitleGenerationConfig>(raw) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("Ignoring malformed '{}' config: {}", TITLE_GENERATION_KEY, e);
                None
            }
        },
        None => None,
    };

    Ok(RegistrySnapshot {
        providers,
        title_generation,
    })
}

/// Process-wide provider cache. Readers take an `Arc` snapshot; refresh swaps
/// it atomically.
pub struct ProviderRegistry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl ProviderRegistry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn empty() -> Self {
        Self::new(RegistrySnapshot::default())
    }

    pub async fn load(storage: &StorageManager) -> Result<Self> {
        let registry = Self::empty();
        registry.refresh(storage).await?;
        Ok(registry)
    }

    /// Rebuilds from storage; on failure the current snapshot stays in place.
    pub async fn refresh(&self, storage: &StorageManager) -> Result<usize> {
        let rows = storage.list_active_providers().await?;
        let system_config = storage.list_system_config().await?;
        let snapshot = build_snapshot(&rows, &system_config)?;
        let count = snapshot.providers.len();
        *self.snapshot.write() = Arc::new(snapshot);
        log::info!("Provider registry loaded with {} providers", count);
        Ok(count)
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().clone()
    }

    pub fn resolve(&self, provider_id: &str, model_id: &str) -> Result<ResolvedModel, ChatError> {
        self.snapshot().resolve(provider_id, model_id)
    }
}
