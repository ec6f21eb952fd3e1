use miette::Diagnostic;
use thiserror::Error;

use crate::model::validation::ValidationErrors;

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigSourceError {
    #[error("App `{0}` not found")]
    #[diagnostic(
        code(meridian::app_not_found),
        help("Check the request host or the app ID; the app may not be provisioned yet")
    )]
    AppNotFound(String),

    #[error("App `{0}` already exists")]
    #[diagnostic(code(meridian::duplicated_app_id))]
    DuplicatedAppId(String),

    #[error("Domain `{0}` is already assigned to an app")]
    #[diagnostic(code(meridian::duplicated_domain))]
    DuplicatedDomain(String),

    #[error("Resource `{path}` not found in any layer")]
    #[diagnostic(code(meridian::resource_not_found))]
    ResourceNotFound { path: String },

    #[error("Malformed resource `{path}`: {reason}")]
    #[diagnostic(
        code(meridian::malformed_resource),
        help("Fix the file contents; the previous configuration stays active until then")
    )]
    MalformedResource { path: String, reason: String },

    #[error("{0}")]
    #[diagnostic(code(meridian::validation))]
    Validation(ValidationErrors),

    #[error("Invalid escaped key `{key}`: {reason}")]
    #[diagnostic(
        code(meridian::invalid_escape),
        help("Escaped keys encode every character outside [a-zA-Z.-] as _<hex>_")
    )]
    InvalidEscape { key: String, reason: String },

    #[error("Config source is not open")]
    #[diagnostic(code(meridian::not_open))]
    NotOpen,

    #[error("I/O error: {0}")]
    #[diagnostic(code(meridian::io))]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(meridian::serde))]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(meridian::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("Kubernetes error: {0}")]
    #[diagnostic(code(meridian::kube))]
    Kube(#[from] kube::Error),

    #[error("Kubeconfig error: {0}")]
    #[diagnostic(code(meridian::kubeconfig))]
    KubeConfig(String),

    #[error("File watcher error: {0}")]
    #[diagnostic(
        code(meridian::watch),
        help("Hot reload cannot be trusted after a watcher failure; restart the process")
    )]
    Watch(#[from] notify::Error),
}

impl ConfigSourceError {
    pub fn malformed(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        ConfigSourceError::MalformedResource {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ConfigSourceError::AppNotFound(_) | ConfigSourceError::ResourceNotFound { .. }
        )
    }
}
