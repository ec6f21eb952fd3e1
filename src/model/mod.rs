pub mod app;
pub mod feature;
pub mod secret;
pub mod validation;

use std::sync::Arc;

use crate::errors::ConfigSourceError;
use crate::resource::{AppConfigKind, FeatureConfigKind, Manager, ResourceFs, SecretConfigKind};

pub use app::AppConfig;
pub use feature::FeatureConfig;
pub use secret::SecretConfig;

/// The effective, validated configuration of one app.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub app_config: Arc<AppConfig>,
    pub secret_config: Arc<SecretConfig>,
    pub feature_config: Arc<FeatureConfig>,
}

impl Config {
    /// Read, merge, and parse every config kind, then check that the secrets
    /// cover everything the app config needs and that the app fits its plan.
    /// Nothing is returned unless all of it succeeds.
    pub fn load(resources: &Manager) -> Result<Self, ConfigSourceError> {
        let app_config = resources.load(&AppConfigKind)?;
        let secret_config = resources.load(&SecretConfigKind)?;
        let feature_config = match resources.load(&FeatureConfigKind) {
            Err(ConfigSourceError::ResourceNotFound { .. }) => FeatureConfig::default(),
            other => other?,
        };
        secret_config
            .validate(&app_config)
            .map_err(ConfigSourceError::Validation)?;
        feature_config
            .check(&app_config)
            .map_err(ConfigSourceError::Validation)?;
        Ok(Self {
            app_config: Arc::new(app_config),
            secret_config: Arc::new(secret_config),
            feature_config: Arc::new(feature_config),
        })
    }
}

/// An immutable snapshot of one app. A reload builds a new one; an existing
/// snapshot is never modified.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub app_id: String,
    pub config: Arc<Config>,
    /// The app's own layer.
    pub app_fs: Arc<dyn ResourceFs>,
    /// Built-in layers with `app_fs` on top.
    pub resources: Manager,
    /// Domains registered for the app, when the source knows them.
    pub domains: Vec<String>,
    /// Empty unless the source assigns plans.
    pub plan_name: String,
}

impl AppContext {
    /// Load a snapshot for `app_fs` layered over `builtin`.
    pub fn build(
        builtin: &Manager,
        app_fs: Arc<dyn ResourceFs>,
        domains: Vec<String>,
    ) -> Result<Self, ConfigSourceError> {
        let resources = builtin.overlay(app_fs.clone());
        let config = Config::load(&resources)?;
        Ok(Self {
            app_id: config.app_config.id.clone(),
            config: Arc::new(config),
            app_fs,
            resources,
            domains,
            plan_name: String::new(),
        })
    }

    pub fn app_config(&self) -> &AppConfig {
        &self.config.app_config
    }

    pub fn secret_config(&self) -> &SecretConfig {
        &self.config.secret_config
    }

    pub fn feature_config(&self) -> &FeatureConfig {
        &self.config.feature_config
    }
}
