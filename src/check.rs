//! Offline validation of stored apps: every app must load, with its plan,
//! exactly as it would when served.

use std::path::Path;
use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::errors::ConfigSourceError;
use crate::model::AppContext;
use crate::resource::{DiskFs, FsLevel, Manager};
use crate::source::database::load_stored_app;
use crate::store;

#[derive(Debug)]
pub struct CheckFailure {
    pub app_id: String,
    pub error: ConfigSourceError,
}

#[derive(Debug, Default)]
pub struct CheckReport {
    pub checked: usize,
    pub failures: Vec<CheckFailure>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Check the given apps, or every stored app when `app_ids` is empty.
pub async fn check_database(
    db: &DatabaseConnection,
    builtin: &Manager,
    app_ids: &[String],
) -> Result<CheckReport, ConfigSourceError> {
    let app_ids = if app_ids.is_empty() {
        store::list_app_ids(db).await?
    } else {
        app_ids.to_vec()
    };

    let mut report = CheckReport::default();
    for app_id in app_ids {
        report.checked += 1;
        if let Err(error) = check_app(db, builtin, &app_id).await {
            tracing::warn!(app_id = %app_id, error = %error, "App config is invalid");
            report.failures.push(CheckFailure { app_id, error });
        }
    }

    tracing::info!(
        checked = report.checked,
        failed = report.failures.len(),
        "Checked database config sources"
    );
    Ok(report)
}

async fn check_app(
    db: &DatabaseConnection,
    builtin: &Manager,
    app_id: &str,
) -> Result<(), ConfigSourceError> {
    load_stored_app(db, builtin, app_id).await?;
    Ok(())
}

/// Load an app directory the same way the local source does.
pub fn check_directory(builtin: &Manager, dir: &Path) -> Result<AppContext, ConfigSourceError> {
    AppContext::build(builtin, Arc::new(DiskFs::new(dir, FsLevel::App)), Vec::new())
}
