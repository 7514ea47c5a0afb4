//! Selection key -> (profile, model) resolution

use async_trait::async_trait;
use parking_lot::RwLock;
use shared::error::ValidationError;
use shared::settings::{split_selection_key, GatewaySettings, ModelInfo, Profile};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub profile: Profile,
    pub model: ModelInfo,
}

#[async_trait]
pub trait ProfileResolver: Send + Sync {
    /// `None` means nothing is selected.
    async fn resolve(&self, selection_key: Option<&str>) -> Result<ResolvedModel, ValidationError>;
}

/// Resolves against in-memory `GatewaySettings`, shared with whoever edits them.
#[derive(Debug, Clone, Default)]
pub struct SettingsProfileResolver {
    settings: Arc<RwLock<GatewaySettings>>,
}

impl SettingsProfileResolver {
    pub fn new(settings: GatewaySettings) -> Self {
        Self {
            settings: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn settings(&self) -> Arc<RwLock<GatewaySettings>> {
        Arc::clone(&self.settings)
    }

    pub fn resolve_now(&self, selection_key: Option<&str>) -> Result<ResolvedModel, ValidationError> {
        let key = selection_key
            .filter(|k| !k.trim().is_empty())
            .ok_or(ValidationError::NoModelSelected)?;
        // A key without a slash is treated as a profile id with no model.
        let (profile_id, model_id) = split_selection_key(key).unwrap_or((key, ""));

        let settings = self.settings.read();
        let profile = settings
            .profile(profile_id)
            .ok_or_else(|| ValidationError::ProfileNotFound {
                profile_id: profile_id.to_string(),
            })?;
        if !profile.enabled {
            return Err(ValidationError::ProfileDisabled {
                profile_id: profile_id.to_string(),
            });
        }
        let model = profile
            .model(model_id)
            .ok_or_else(|| ValidationError::ModelNotFound {
                profile_id: profile_id.to_string(),
                model_id: model_id.to_string(),
            })?;

        Ok(ResolvedModel {
            profile: profile.clone(),
            model: model.clone(),
        })
    }
}

#[async_trait]
impl ProfileResolver for SettingsProfileResolver {
    async fn resolve(&self, selection_key: Option<&str>) -> Result<ResolvedModel, ValidationError> {
        self.resolve_now(selection_key)
    }
}
