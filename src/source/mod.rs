//! Where app configuration comes from, and how a request is mapped to an app.

pub mod database;
pub mod kubernetes;
pub mod local_fs;

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::header::HOST;
use axum::http::request::Parts;
use sea_orm::DatabaseConnection;

use crate::errors::ConfigSourceError;
use crate::model::{AppContext, Config};
use crate::resource::Manager;
use crate::settings::{Settings, SourceType};

pub use database::DatabaseSource;
pub use kubernetes::KubernetesSource;
pub use local_fs::LocalFsSource;

/// Label that ties a ConfigMap or Secret to the app it configures.
pub const LABEL_APP_ID: &str = "authgear.com/app-id";

/// The contract every configuration backend implements.
///
/// Snapshots are published atomically: a caller of `resolve_context` gets
/// either the previous or the next complete `AppContext`, never a mix.
#[async_trait]
pub trait ContextResolver: Send + Sync {
    async fn open(&self) -> Result<(), ConfigSourceError>;

    /// Stops every background task owned by the backend. Safe to call twice.
    async fn close(&self) -> Result<(), ConfigSourceError>;

    async fn resolve_app_id(&self, request: &Parts) -> Result<String, ConfigSourceError>;

    async fn resolve_context(&self, app_id: &str) -> Result<Arc<AppContext>, ConfigSourceError>;

    /// Drop or rebuild whatever is cached for `app_id`.
    async fn reload_app(&self, app_id: &str);
}

/// Host the request was addressed to, without the port.
pub fn request_host(request: &Parts, trust_proxy: bool) -> Option<String> {
    let forwarded = trust_proxy
        .then(|| request.headers.get("x-forwarded-host"))
        .flatten()
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let host = forwarded
        .or_else(|| request.headers.get(HOST).and_then(|v| v.to_str().ok()))
        .or_else(|| request.uri.host())?;

    Some(strip_port(host).to_ascii_lowercase())
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [::1]:8080
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// The single active backend, chosen once from settings.
#[derive(Clone)]
pub enum Backend {
    LocalFs(Arc<LocalFsSource>),
    Kubernetes(Arc<KubernetesSource>),
    Database(Arc<DatabaseSource>),
}

impl Backend {
    fn resolver(&self) -> Arc<dyn ContextResolver> {
        match self {
            Backend::LocalFs(s) => s.clone(),
            Backend::Kubernetes(s) => s.clone(),
            Backend::Database(s) => s.clone(),
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            Backend::LocalFs(_) => SourceType::LocalFs,
            Backend::Kubernetes(_) => SourceType::Kubernetes,
            Backend::Database(_) => SourceType::Database,
        }
    }
}

pub struct Controller {
    backend: Backend,
}

impl Controller {
    /// Build the backend named by `config_source.type`. The database backend
    /// connects to `database.url` here.
    pub async fn connect(settings: &Settings) -> Result<Self, ConfigSourceError> {
        let builtin = Manager::builtin(settings);
        let backend = match settings.config_source.source_type {
            SourceType::LocalFs => Backend::LocalFs(Arc::new(LocalFsSource::new(settings, builtin))),
            SourceType::Kubernetes => {
                Backend::Kubernetes(Arc::new(KubernetesSource::new(settings, builtin)))
            }
            SourceType::Database => {
                let db = sea_orm::Database::connect(&settings.database.url).await?;
                Backend::Database(Arc::new(DatabaseSource::new(settings, builtin, db)))
            }
        };
        tracing::info!(source = ?backend.source_type(), "Selected config source");
        Ok(Self { backend })
    }

    pub fn with_database(settings: &Settings, db: DatabaseConnection) -> Self {
        let builtin = Manager::builtin(settings);
        Self::from_backend(Backend::Database(Arc::new(DatabaseSource::new(
            settings, builtin, db,
        ))))
    }

    pub fn from_backend(backend: Backend) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub async fn open(&self) -> Result<(), ConfigSourceError> {
        self.backend.resolver().open().await
    }

    pub async fn close(&self) -> Result<(), ConfigSourceError> {
        self.backend.resolver().close().await
    }

    pub async fn resolve_context(&self, app_id: &str) -> Result<Arc<AppContext>, ConfigSourceError> {
        self.backend.resolver().resolve_context(app_id).await
    }

    pub async fn reload_app(&self, app_id: &str) {
        self.backend.resolver().reload_app(app_id).await
    }

    pub fn config_source(&self) -> ConfigSource {
        ConfigSource {
            resolver: self.backend.resolver(),
        }
    }
}

/// What HTTP middleware sees of the configuration engine.
#[derive(Clone)]
pub struct ConfigSource {
    resolver: Arc<dyn ContextResolver>,
}

impl ConfigSource {
    pub fn new(resolver: Arc<dyn ContextResolver>) -> Self {
        Self { resolver }
    }

    pub async fn provide_context(&self, request: &Parts) -> Result<Arc<AppContext>, ConfigSourceError> {
        let app_id = self.resolver.resolve_app_id(request).await?;
        self.resolver.resolve_context(&app_id).await
    }

    pub async fn provide_config(&self, request: &Parts) -> Result<Arc<Config>, ConfigSourceError> {
        Ok(self.provide_context(request).await?.config.clone())
    }
}
