//! Multi-app source backed by the control-plane database.
//!
//! A cached app is rebuilt after `reload_app`, idle eviction, or a change
//! made through this source drops it. On PostgreSQL, changes made by other
//! processes arrive as NOTIFY messages on the channels below.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::request::Parts;
use dashmap::DashMap;
use sea_orm::sqlx::postgres::{PgListener, PgPool};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, TransactionTrait};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bag::ResourceBag;
use crate::errors::ConfigSourceError;
use crate::model::{AppConfig, AppContext, FeatureConfig};
use crate::resource::kinds::parse_failure;
use crate::resource::{FsLevel, Manager, MemoryFs, APP_CONFIG_PATH, FEATURE_CONFIG_PATH};
use crate::settings::{ResolveAppIdType, Settings};
use crate::source::{request_host, ContextResolver};
use crate::store::{self, DatabaseSourceRecord};

/// Payload: the app id.
pub const CONFIG_SOURCE_CHANGE_CHANNEL: &str = "config_source_change";
/// Payload: `<app id>:<domain>`.
pub const DOMAIN_CHANGE_CHANNEL: &str = "domain_change";
/// Payload: the plan name.
pub const PLAN_CHANGE_CHANNEL: &str = "plan_change";

const LISTEN_RETRY: Duration = Duration::from_secs(1);

pub struct DatabaseSource {
    db: DatabaseConnection,
    builtin: Manager,
    trust_proxy: bool,
    resolve_app_id_type: ResolveAppIdType,
    cache_ttl: Duration,
    cache: Arc<Cache>,
    tasks: Mutex<Option<Tasks>>,
}

struct Tasks {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// One cached app. The cell is filled at most once; a failed load removes
/// the entry so the next caller retries.
struct DbApp {
    cell: OnceCell<Arc<AppContext>>,
    last_used: AtomicI64,
}

/// Host and app caches, shared with the background tasks.
struct Cache {
    started: Instant,
    hosts: DashMap<String, String>,
    apps: DashMap<String, Arc<DbApp>>,
}

impl Cache {
    fn now(&self) -> i64 {
        self.started.elapsed().as_secs() as i64
    }

    fn invalidate_app(&self, app_id: &str) {
        self.apps.remove(app_id);
        tracing::debug!(app_id = %app_id, "Invalidated cached config");
    }

    fn invalidate_host(&self, domain: &str) {
        self.hosts.remove(domain);
        tracing::debug!(domain = %domain, "Invalidated cached host");
    }

    /// Drop every app on the plan. Apps still loading are dropped too, since
    /// they may have read the old plan.
    fn invalidate_plan(&self, plan_name: &str) {
        self.apps.retain(|_, app| {
            app.cell
                .get()
                .is_some_and(|ctx| ctx.plan_name != plan_name)
        });
        tracing::debug!(plan = %plan_name, "Invalidated cached configs on plan");
    }

    fn invalidate_all(&self) {
        self.apps.clear();
        self.hosts.clear();
        tracing::debug!("Invalidated all cached config");
    }

    fn handle_notification(&self, channel: &str, payload: &str) {
        tracing::debug!(channel = %channel, payload = %payload, "Config change notification");
        match channel {
            CONFIG_SOURCE_CHANGE_CHANNEL => self.invalidate_app(payload),
            DOMAIN_CHANGE_CHANNEL => match payload.split_once(':') {
                Some((app_id, domain)) => {
                    self.invalidate_host(domain);
                    self.invalidate_app(app_id);
                }
                None => {
                    tracing::warn!(payload = %payload, "Malformed domain change payload");
                    self.invalidate_all();
                }
            },
            PLAN_CHANGE_CHANNEL => self.invalidate_plan(payload),
            _ => tracing::debug!(channel = %channel, "Ignoring notification"),
        }
    }

    fn evict_idle(&self, idle: Duration) -> usize {
        let now = self.now();
        let idle = idle.as_secs() as i64;
        let before = self.apps.len();
        self.apps
            .retain(|_, app| now - app.last_used.load(Ordering::Relaxed) < idle);
        let deleted = before.saturating_sub(self.apps.len());
        if deleted > 0 {
            tracing::info!(deleted, "Cleaned cached app configs");
        }
        deleted
    }
}

/// The plan layer for `plan_name`. Apps without a plan, or on a plan that
/// has no row, get no plan layer.
async fn plan_fs<C: ConnectionTrait>(
    db: &C,
    plan_name: &str,
) -> Result<Option<MemoryFs>, ConfigSourceError> {
    if plan_name.is_empty() {
        return Ok(None);
    }
    let Some(plan) = store::get_plan_by_name(db, plan_name).await? else {
        tracing::warn!(plan = %plan_name, "App refers to an unknown plan");
        return Ok(None);
    };
    let mut fs = MemoryFs::new(FsLevel::Plan);
    if !plan.feature_config.trim().is_empty() {
        fs.insert(FEATURE_CONFIG_PATH, plan.feature_config.into_bytes());
    }
    Ok(Some(fs))
}

/// Build the snapshot of a stored app: built-in layers, then its plan, then
/// its own files.
pub async fn load_stored_app<C: ConnectionTrait>(
    db: &C,
    builtin: &Manager,
    app_id: &str,
) -> Result<AppContext, ConfigSourceError> {
    let record = store::get_source_by_app_id(db, app_id)
        .await?
        .ok_or_else(|| ConfigSourceError::AppNotFound(app_id.to_string()))?;
    let domains = store::get_domains_by_app_id(db, app_id).await?;

    let base = match plan_fs(db, &record.plan_name).await? {
        Some(fs) => builtin.overlay(Arc::new(fs)),
        None => builtin.clone(),
    };
    let app_fs = MemoryFs::from_bag(&record.data, FsLevel::App)?;
    let mut ctx = AppContext::build(&base, Arc::new(app_fs), domains)?;
    ctx.plan_name = record.plan_name;
    if ctx.app_id != app_id {
        tracing::warn!(
            app_id = %app_id,
            config_id = %ctx.app_id,
            "Stored app config has a different id than its row"
        );
        ctx.app_id = app_id.to_string();
    }
    Ok(ctx)
}

impl DatabaseSource {
    pub fn new(settings: &Settings, builtin: Manager, db: DatabaseConnection) -> Self {
        Self {
            db,
            builtin,
            trust_proxy: settings.server.trust_proxy,
            resolve_app_id_type: settings.config_source.resolve_app_id_type,
            cache_ttl: Duration::from_secs(settings.config_source.cache_ttl_seconds),
            cache: Arc::new(Cache {
                started: Instant::now(),
                hosts: DashMap::new(),
                apps: DashMap::new(),
            }),
            tasks: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn load_app(&self, app_id: &str) -> Result<Arc<AppContext>, ConfigSourceError> {
        tracing::debug!(app_id = %app_id, "Loading app config from database");
        let txn = store::begin_read_only(&self.db).await?;
        let ctx = load_stored_app(&txn, &self.builtin, app_id).await?;
        txn.commit().await?;
        Ok(Arc::new(ctx))
    }

    async fn resolve_by_domain(&self, request: &Parts) -> Result<String, ConfigSourceError> {
        let host = request_host(request, self.trust_proxy)
            .ok_or_else(|| ConfigSourceError::AppNotFound(String::new()))?;

        if let Some(app_id) = self.cache.hosts.get(&host) {
            return Ok(app_id.value().clone());
        }

        tracing::debug!(host = %host, "Resolving app id from database");
        let app_id = store::get_app_id_by_domain(&self.db, &host)
            .await?
            .ok_or_else(|| ConfigSourceError::AppNotFound(host.clone()))?;
        self.cache.hosts.insert(host, app_id.clone());
        Ok(app_id)
    }

    async fn resolve_by_path(&self, request: &Parts) -> Result<String, ConfigSourceError> {
        let app_id = request
            .uri
            .path()
            .trim_start_matches('/')
            .split('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigSourceError::AppNotFound(String::new()))?
            .to_string();
        // Make sure the app exists.
        self.resolve_context(&app_id).await?;
        Ok(app_id)
    }

    /// Store a new app. Fails with `DuplicatedAppId` if the app already has a
    /// row. The host of `http.public_origin` is registered as its domain.
    pub async fn create_database_source(
        &self,
        app_id: &str,
        files: BTreeMap<String, Vec<u8>>,
        plan_name: &str,
    ) -> Result<DatabaseSourceRecord, ConfigSourceError> {
        let bag = ResourceBag::from_files(files);
        let txn = self.db.begin().await?;

        if store::get_source_by_app_id(&txn, app_id).await?.is_some() {
            return Err(ConfigSourceError::DuplicatedAppId(app_id.to_string()));
        }
        let record = store::create_source(&txn, app_id, &bag, plan_name).await?;

        let host = bag
            .get(APP_CONFIG_PATH)
            .and_then(|bytes| AppConfig::parse(bytes).ok())
            .and_then(|cfg| cfg.public_host());
        if let Some(host) = &host {
            store::add_domain(&txn, app_id, host).await?;
        }

        txn.commit().await?;
        tracing::info!(app_id = %app_id, domain = ?host, files = bag.len(), "Created database config source");
        Ok(record)
    }

    /// Apply `(path, data)` edits to a stored app; `None` deletes the file.
    /// Returns whether anything changed. The cached snapshot is dropped either way.
    pub async fn update_database_source(
        &self,
        app_id: &str,
        edits: Vec<(String, Option<Vec<u8>>)>,
    ) -> Result<bool, ConfigSourceError> {
        let txn = self.db.begin().await?;
        let mut record = store::get_source_by_app_id(&txn, app_id)
            .await?
            .ok_or_else(|| ConfigSourceError::AppNotFound(app_id.to_string()))?;

        let mut updated = false;
        for (path, data) in edits {
            match data {
                None => updated |= record.data.remove(&path).is_some(),
                Some(bytes) => {
                    if record.data.get(&path) != Some(bytes.as_slice()) {
                        record.data.insert(&path, bytes);
                        updated = true;
                    }
                }
            }
        }

        if updated {
            record.updated_at = store::update_source_data(&txn, &record).await?;
        }
        txn.commit().await?;

        if updated {
            tracing::info!(app_id = %app_id, "Updated database config source");
        }
        self.invalidate_app(app_id);
        Ok(updated)
    }

    /// Map `domain` to an existing app.
    pub async fn add_domain(&self, app_id: &str, domain: &str) -> Result<(), ConfigSourceError> {
        let domain = domain.to_ascii_lowercase();
        let txn = self.db.begin().await?;
        if store::get_source_by_app_id(&txn, app_id).await?.is_none() {
            return Err(ConfigSourceError::AppNotFound(app_id.to_string()));
        }
        if store::get_app_id_by_domain(&txn, &domain).await?.is_some() {
            return Err(ConfigSourceError::DuplicatedDomain(domain));
        }
        store::add_domain(&txn, app_id, &domain).await?;
        txn.commit().await?;

        self.invalidate_host(&domain);
        self.invalidate_app(app_id);
        tracing::info!(app_id = %app_id, domain = %domain, "Added domain");
        Ok(())
    }

    /// Unmap `domain`. Returns whether it was mapped.
    pub async fn remove_domain(&self, domain: &str) -> Result<bool, ConfigSourceError> {
        let domain = domain.to_ascii_lowercase();
        let removed = store::remove_domain(&self.db, &domain).await?;

        self.invalidate_host(&domain);
        if let Some(app_id) = &removed {
            self.invalidate_app(app_id);
            tracing::info!(app_id = %app_id, domain = %domain, "Removed domain");
        }
        Ok(removed.is_some())
    }

    /// Create or replace a plan's `authgear.features.yaml`. An empty
    /// document means no limits.
    pub async fn upsert_plan(&self, name: &str, feature_config: &str) -> Result<(), ConfigSourceError> {
        if !feature_config.trim().is_empty() {
            FeatureConfig::parse(feature_config.as_bytes())
                .map_err(|e| parse_failure(FEATURE_CONFIG_PATH, e))?;
        }
        store::upsert_plan(&self.db, name, feature_config).await?;
        self.cache.invalidate_plan(name);
        tracing::info!(plan = %name, "Updated plan");
        Ok(())
    }

    pub fn invalidate_app(&self, app_id: &str) {
        self.cache.invalidate_app(app_id);
    }

    pub fn invalidate_host(&self, domain: &str) {
        self.cache.invalidate_host(domain);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Apply a change notification from another process.
    pub fn handle_notification(&self, channel: &str, payload: &str) {
        self.cache.handle_notification(channel, payload);
    }

    /// Drop cached apps that have not been resolved for `idle`.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        self.cache.evict_idle(idle)
    }

    pub fn cached_apps(&self) -> usize {
        self.cache.apps.len()
    }

    pub fn cached_hosts(&self) -> usize {
        self.cache.hosts.len()
    }
}

fn spawn_cleanup(cache: Arc<Cache>, ttl: Duration, token: CancellationToken) -> JoinHandle<()> {
    let period = ttl.clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    cache.evict_idle(ttl);
                }
            }
        }
    })
}

fn spawn_listener(pool: PgPool, cache: Arc<Cache>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listen(&pool, &cache, &token).await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Config change listener failed; retrying");
                    // Anything sent while disconnected is lost.
                    cache.invalidate_all();
                }
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(LISTEN_RETRY) => {}
            }
        }
    })
}

/// Returns `Ok` only when cancelled.
async fn listen(
    pool: &PgPool,
    cache: &Cache,
    token: &CancellationToken,
) -> Result<(), sea_orm::sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener
        .listen_all([
            CONFIG_SOURCE_CHANGE_CHANNEL,
            DOMAIN_CHANGE_CHANNEL,
            PLAN_CHANGE_CHANNEL,
        ])
        .await?;
    tracing::info!("Listening for config change notifications");

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            received = listener.try_recv() => match received? {
                Some(notification) => {
                    cache.handle_notification(notification.channel(), notification.payload());
                }
                None => {
                    // The listener reconnects on the next call.
                    tracing::warn!("Config change listener lost its connection");
                    cache.invalidate_all();
                }
            },
        }
    }
}

#[async_trait]
impl ContextResolver for DatabaseSource {
    async fn open(&self) -> Result<(), ConfigSourceError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Ok(());
        }

        let token = CancellationToken::new();
        let mut handles = vec![spawn_cleanup(
            self.cache.clone(),
            self.cache_ttl,
            token.clone(),
        )];
        if self.db.get_database_backend() == DbBackend::Postgres {
            handles.push(spawn_listener(
                self.db.get_postgres_connection_pool().clone(),
                self.cache.clone(),
                token.clone(),
            ));
        }

        *tasks = Some(Tasks { token, handles });
        tracing::info!(ttl_seconds = self.cache_ttl.as_secs(), "Database config source opened");
        Ok(())
    }

    async fn close(&self) -> Result<(), ConfigSourceError> {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return Ok(());
        };
        tasks.token.cancel();
        for handle in tasks.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        Ok(())
    }

    async fn resolve_app_id(&self, request: &Parts) -> Result<String, ConfigSourceError> {
        match self.resolve_app_id_type {
            ResolveAppIdType::Domain => self.resolve_by_domain(request).await,
            ResolveAppIdType::Path => self.resolve_by_path(request).await,
        }
    }

    async fn resolve_context(&self, app_id: &str) -> Result<Arc<AppContext>, ConfigSourceError> {
        let app = self
            .cache
            .apps
            .entry(app_id.to_string())
            .or_insert_with(|| {
                Arc::new(DbApp {
                    cell: OnceCell::new(),
                    last_used: AtomicI64::new(self.cache.now()),
                })
            })
            .value()
            .clone();

        match app.cell.get_or_try_init(|| self.load_app(app_id)).await {
            Ok(ctx) => {
                app.last_used.store(self.cache.now(), Ordering::Relaxed);
                Ok(ctx.clone())
            }
            Err(e) => {
                self.cache
                    .apps
                    .remove_if(app_id, |_, cached| Arc::ptr_eq(cached, &app));
                Err(e)
            }
        }
    }

    async fn reload_app(&self, app_id: &str) {
        self.invalidate_app(app_id);
    }
}
