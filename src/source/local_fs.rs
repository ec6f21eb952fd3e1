//! Single-app source backed by one directory on local disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use axum::http::request::Parts;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::ConfigSourceError;
use crate::model::AppContext;
use crate::resource::{DiskFs, FsLevel, Manager, APP_CONFIG_PATH, SECRET_CONFIG_PATH};
use crate::settings::Settings;
use crate::source::ContextResolver;

pub struct LocalFsSource {
    inner: Arc<Inner>,
    watch: bool,
    watching: Mutex<Option<Watching>>,
}

struct Inner {
    directory: PathBuf,
    builtin: Manager,
    current: ArcSwapOption<AppContext>,
    /// Held by whoever is writing files or building the next snapshot.
    /// Readers never take it.
    reload_lock: Mutex<()>,
}

struct Watching {
    token: CancellationToken,
    task: JoinHandle<()>,
    watcher: RecommendedWatcher,
}

impl LocalFsSource {
    pub fn new(settings: &Settings, builtin: Manager) -> Self {
        Self::with_directory(
            settings.config_source.directory.clone(),
            settings.config_source.watch,
            builtin,
        )
    }

    pub fn with_directory(directory: impl Into<PathBuf>, watch: bool, builtin: Manager) -> Self {
        Self {
            inner: Arc::new(Inner {
                directory: directory.into(),
                builtin,
                current: ArcSwapOption::empty(),
                reload_lock: Mutex::new(()),
            }),
            watch,
            watching: Mutex::new(None),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    /// Re-read both config files and publish a new snapshot. On failure the
    /// previous snapshot stays live.
    pub async fn reload(&self) -> Result<Arc<AppContext>, ConfigSourceError> {
        self.inner.reload().await
    }

    /// Write (`Some`) or delete (`None`) files in the app directory. A watching
    /// source picks the change up from the file events; otherwise the app is
    /// reloaded before returning. Concurrent updates apply one at a time, and
    /// no reload observes half of an update.
    pub async fn update_resources(
        &self,
        edits: Vec<(String, Option<Vec<u8>>)>,
    ) -> Result<(), ConfigSourceError> {
        let _guard = self.inner.reload_lock.lock().await;
        let fs = DiskFs::new(&self.inner.directory, FsLevel::App);
        for (path, data) in &edits {
            match data {
                Some(bytes) => fs.write(path, bytes)?,
                None => fs.remove(path)?,
            }
            tracing::debug!(path = %path, deleted = data.is_none(), "Updated local resource");
        }
        if !self.watch {
            self.inner.rebuild()?;
        }
        Ok(())
    }

    fn spawn_watcher(&self, directory: &Path) -> Result<Watching, ConfigSourceError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        // Events are filtered by file name in `touches_config`.
        watcher.watch(directory, RecursiveMode::NonRecursive)?;

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(Ok(event)) => {
                            if !touches_config(&event) {
                                continue;
                            }
                            tracing::info!(kind = ?event.kind, paths = ?event.paths, "Config file changed");
                            let _ = inner.reload().await;
                        }
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "File watcher failed; hot reload can no longer be trusted");
                            std::process::exit(1);
                        }
                        None => break,
                    }
                }
            }
            tracing::debug!("Config file watcher stopped");
        });

        Ok(Watching {
            token,
            task,
            watcher,
        })
    }
}

fn touches_config(event: &Event) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n == APP_CONFIG_PATH || n == SECRET_CONFIG_PATH)
        })
}

impl Inner {
    async fn reload(&self) -> Result<Arc<AppContext>, ConfigSourceError> {
        let _guard = self.reload_lock.lock().await;
        self.rebuild()
    }

    /// The caller holds `reload_lock`.
    fn rebuild(&self) -> Result<Arc<AppContext>, ConfigSourceError> {
        let previous = self.current.load_full().ok_or(ConfigSourceError::NotOpen)?;

        match AppContext::build(&self.builtin, previous.app_fs.clone(), previous.domains.clone()) {
            Ok(next) => {
                let next = Arc::new(next);
                self.current.store(Some(next.clone()));
                tracing::info!(app_id = %next.app_id, "Reloaded app config");
                Ok(next)
            }
            Err(e) => {
                tracing::warn!(
                    app_id = %previous.app_id,
                    error = %e,
                    "Reload failed; keeping the previous config"
                );
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ContextResolver for LocalFsSource {
    async fn open(&self) -> Result<(), ConfigSourceError> {
        let directory = std::fs::canonicalize(&self.inner.directory)?;
        {
            let _guard = self.inner.reload_lock.lock().await;
            let app_fs = Arc::new(DiskFs::new(&directory, FsLevel::App));
            let ctx = AppContext::build(&self.inner.builtin, app_fs, Vec::new())?;
            tracing::info!(
                app_id = %ctx.app_id,
                directory = %directory.display(),
                "Loaded app config from directory"
            );
            self.inner.current.store(Some(Arc::new(ctx)));
        }

        if self.watch {
            let mut watching = self.watching.lock().await;
            if watching.is_none() {
                *watching = Some(self.spawn_watcher(&directory)?);
                tracing::info!(directory = %directory.display(), "Watching config files");
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ConfigSourceError> {
        let Some(watching) = self.watching.lock().await.take() else {
            return Ok(());
        };
        watching.token.cancel();
        drop(watching.watcher);
        if let Err(e) = watching.task.await {
            tracing::warn!(error = %e, "Config file watcher task ended abnormally");
        }
        Ok(())
    }

    async fn resolve_app_id(&self, _request: &Parts) -> Result<String, ConfigSourceError> {
        self.inner
            .current
            .load_full()
            .map(|ctx| ctx.app_id.clone())
            .ok_or(ConfigSourceError::NotOpen)
    }

    async fn resolve_context(&self, _app_id: &str) -> Result<Arc<AppContext>, ConfigSourceError> {
        self.inner.current.load_full().ok_or(ConfigSourceError::NotOpen)
    }

    async fn reload_app(&self, _app_id: &str) {
        let _ = self.reload().await;
    }
}
