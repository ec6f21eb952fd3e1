//! Cluster-wide source: one ConfigMap and one Secret per app, found by the
//! `authgear.com/app-id` label.
//!
//! The two kinds are watched independently. Each event replaces that kind's
//! slot for the app, then the snapshot is rebuilt from both slots while the
//! slot lock is held. Arrival order does not matter: the last rebuild always
//! sees the latest value of both slots. Every slot remembers the
//! `resourceVersion` it was written at, so an older observation (a slow
//! list, a replayed event) never replaces a newer one.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use axum::http::request::Parts;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::ObjectList;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::ConfigSourceError;
use crate::model::AppContext;
use crate::resource::{FsLevel, Manager, MemoryFs};
use crate::settings::Settings;
use crate::source::{ContextResolver, LABEL_APP_ID};

/// A Kubernetes object that carries files for one app.
pub trait AppObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
    const KIND: &'static str;

    /// The object's keys unescaped into file paths.
    fn app_fs(&self) -> Result<MemoryFs, ConfigSourceError>;

    fn slot(slots: &mut Slots) -> &mut Slot;
}

impl AppObject for ConfigMap {
    const KIND: &'static str = "ConfigMap";

    fn app_fs(&self) -> Result<MemoryFs, ConfigSourceError> {
        let text = self
            .data
            .iter()
            .flatten()
            .map(|(k, v)| (k.as_str(), v.as_bytes().to_vec()));
        let binary = self
            .binary_data
            .iter()
            .flatten()
            .map(|(k, v)| (k.as_str(), v.0.clone()));
        MemoryFs::from_escaped(text.chain(binary), FsLevel::App)
    }

    fn slot(slots: &mut Slots) -> &mut Slot {
        &mut slots.config_map
    }
}

impl AppObject for Secret {
    const KIND: &'static str = "Secret";

    fn app_fs(&self) -> Result<MemoryFs, ConfigSourceError> {
        let string_data = self
            .string_data
            .iter()
            .flatten()
            .map(|(k, v)| (k.as_str(), v.as_bytes().to_vec()));
        let data = self
            .data
            .iter()
            .flatten()
            .map(|(k, v)| (k.as_str(), v.0.clone()));
        MemoryFs::from_escaped(string_data.chain(data), FsLevel::App)
    }

    fn slot(slots: &mut Slots) -> &mut Slot {
        &mut slots.secret
    }
}

fn app_id_of<K: AppObject>(obj: &K) -> Option<String> {
    obj.labels()
        .get(LABEL_APP_ID)
        .filter(|id| !id.is_empty())
        .cloned()
}

/// Resource versions are etcd revisions in practice. One that does not parse
/// is treated as unordered.
fn parse_version(version: Option<&str>) -> Option<u64> {
    version.and_then(|v| v.parse().ok())
}

/// The latest observation of one kind for one app. `fs: None` with a
/// version is a deletion.
#[derive(Debug, Default, Clone)]
pub struct Slot {
    version: Option<u64>,
    fs: Option<Arc<MemoryFs>>,
}

impl Slot {
    /// Replace the slot unless `version` is older than what it holds.
    fn observe(&mut self, version: Option<u64>, fs: Option<Arc<MemoryFs>>) -> bool {
        if let (Some(current), Some(incoming)) = (self.version, version) {
            if incoming < current {
                return false;
            }
        }
        *self = Slot { version, fs };
        true
    }
}

#[derive(Debug, Default)]
pub struct Slots {
    config_map: Slot,
    secret: Slot,
}

impl Slots {
    fn is_empty(&self) -> bool {
        self.config_map.fs.is_none() && self.secret.fs.is_none()
    }
}

/// Per-app state: the latest file set of each object kind and the snapshot
/// built from them. Writers hold `slots` across the rebuild; readers only
/// load `snapshot`.
#[derive(Default)]
pub struct KubeApp {
    slots: Mutex<Slots>,
    snapshot: ArcSwapOption<AppContext>,
    last_used: AtomicI64,
}

/// One kind's result of listing an app's objects.
#[derive(Debug)]
pub struct Listed<'a, K> {
    /// The list's `resourceVersion`.
    pub version: Option<&'a str>,
    pub object: Option<&'a K>,
}

impl<'a, K: AppObject> Listed<'a, K> {
    pub fn from_list(list: &'a ObjectList<K>) -> Self {
        Self {
            version: list.metadata.resource_version.as_deref(),
            object: list.items.first(),
        }
    }

    /// An object is as new as its own version; an absence is as new as the
    /// list.
    fn into_observation(self) -> Result<(Option<u64>, Option<Arc<MemoryFs>>), ConfigSourceError> {
        match self.object {
            Some(obj) => Ok((
                parse_version(obj.resource_version().as_deref()),
                Some(Arc::new(obj.app_fs()?)),
            )),
            None => Ok((parse_version(self.version), None)),
        }
    }
}

struct Shared {
    builtin: Manager,
    apps: DashMap<String, Arc<KubeApp>>,
    started: Instant,
}

impl Shared {
    fn now(&self) -> i64 {
        self.started.elapsed().as_secs() as i64
    }

    fn app(&self, app_id: &str) -> Arc<KubeApp> {
        self.apps
            .entry(app_id.to_string())
            .or_insert_with(|| {
                let app = KubeApp::default();
                app.last_used.store(self.now(), Ordering::Relaxed);
                Arc::new(app)
            })
            .value()
            .clone()
    }

    async fn apply<K: AppObject>(&self, obj: &K) {
        let Some(app_id) = app_id_of(obj) else {
            return;
        };
        let fs = match obj.app_fs() {
            Ok(fs) => fs,
            Err(e) => {
                tracing::warn!(app_id = %app_id, kind = K::KIND, name = %obj.name_any(), error = %e, "Ignoring object with undecodable keys");
                return;
            }
        };
        let version = parse_version(obj.resource_version().as_deref());

        let app = self.app(&app_id);
        let mut slots = app.slots.lock().await;
        if !K::slot(&mut slots).observe(version, Some(Arc::new(fs))) {
            tracing::debug!(app_id = %app_id, kind = K::KIND, version = ?version, "Ignoring stale object");
            return;
        }
        tracing::info!(app_id = %app_id, kind = K::KIND, name = %obj.name_any(), "Object updated");
        let _ = self.rebuild(&app_id, &app, &slots);
    }

    async fn delete<K: AppObject>(&self, obj: &K) {
        let Some(app_id) = app_id_of(obj) else {
            return;
        };
        let version = parse_version(obj.resource_version().as_deref());

        let app = self.app(&app_id);
        let mut slots = app.slots.lock().await;
        if !K::slot(&mut slots).observe(version, None) {
            tracing::debug!(app_id = %app_id, kind = K::KIND, version = ?version, "Ignoring stale deletion");
            return;
        }
        tracing::info!(app_id = %app_id, kind = K::KIND, name = %obj.name_any(), "Object deleted");
        self.settle(&app_id, &app, &slots);
    }

    /// Clear kind `K` from every app that a completed re-list did not return.
    async fn prune<K: AppObject>(&self, seen: &HashSet<String>) {
        let missing: Vec<(String, Arc<KubeApp>)> = self
            .apps
            .iter()
            .filter(|entry| !seen.contains(entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (app_id, app) in missing {
            let mut slots = app.slots.lock().await;
            let slot = K::slot(&mut slots);
            if slot.fs.is_none() {
                continue;
            }
            slot.fs = None;
            tracing::info!(app_id = %app_id, kind = K::KIND, "Object gone after re-list");
            self.settle(&app_id, &app, &slots);
        }
    }

    /// Record a fresh list of both kinds and rebuild from the result.
    async fn apply_listed(
        &self,
        app_id: &str,
        config_map: Listed<'_, ConfigMap>,
        secret: Listed<'_, Secret>,
    ) -> Result<Arc<AppContext>, ConfigSourceError> {
        let (cm_version, cm_fs) = config_map.into_observation()?;
        let (secret_version, secret_fs) = secret.into_observation()?;

        let app = self.app(app_id);
        let mut slots = app.slots.lock().await;
        if !slots.config_map.observe(cm_version, cm_fs) {
            tracing::debug!(app_id = %app_id, kind = ConfigMap::KIND, "Listed object is older than the watched one");
        }
        if !slots.secret.observe(secret_version, secret_fs) {
            tracing::debug!(app_id = %app_id, kind = Secret::KIND, "Listed object is older than the watched one");
        }
        if slots.is_empty() {
            app.snapshot.store(None);
            return Err(ConfigSourceError::AppNotFound(app_id.to_string()));
        }
        self.rebuild(app_id, &app, &slots)
    }

    /// Drop the snapshot once both kinds are gone; otherwise rebuild.
    fn settle(&self, app_id: &str, app: &KubeApp, slots: &Slots) {
        if slots.is_empty() {
            app.snapshot.store(None);
            tracing::info!(app_id = %app_id, "App removed");
        } else {
            let _ = self.rebuild(app_id, app, slots);
        }
    }

    /// Rebuild the app's snapshot from both slots. A failed rebuild keeps the
    /// previous snapshot. The caller holds the slot lock.
    fn rebuild(
        &self,
        app_id: &str,
        app: &KubeApp,
        slots: &Slots,
    ) -> Result<Arc<AppContext>, ConfigSourceError> {
        if slots.is_empty() {
            return Err(ConfigSourceError::AppNotFound(app_id.to_string()));
        }

        let mut files = MemoryFs::new(FsLevel::App);
        for part in [&slots.config_map.fs, &slots.secret.fs].into_iter().flatten() {
            files.extend(part);
        }

        match AppContext::build(&self.builtin, Arc::new(files), Vec::new()) {
            Ok(mut ctx) => {
                ctx.app_id = app_id.to_string();
                let ctx = Arc::new(ctx);
                app.snapshot.store(Some(ctx.clone()));
                tracing::info!(app_id = %app_id, "Rebuilt app config");
                Ok(ctx)
            }
            Err(e) => {
                tracing::warn!(
                    app_id = %app_id,
                    error = %e,
                    has_previous = app.snapshot.load().is_some(),
                    "App config rebuild failed; keeping the previous config"
                );
                Err(e)
            }
        }
    }

    /// Drop snapshots idle for `idle`. Slots that hold objects stay, so a
    /// later event for one kind still rebuilds with the other.
    fn evict_idle(&self, idle: Duration) -> usize {
        let now = self.now();
        let idle = idle.as_secs() as i64;
        let mut deleted = 0;
        self.apps.retain(|_, app| {
            if now - app.last_used.load(Ordering::Relaxed) < idle {
                return true;
            }
            if app.snapshot.swap(None).is_some() {
                deleted += 1;
            }
            match app.slots.try_lock() {
                Ok(slots) => !slots.is_empty(),
                Err(_) => true,
            }
        });
        if deleted > 0 {
            tracing::info!(deleted, "Cleaned cached app configs");
        }
        deleted
    }

    fn cached_apps(&self) -> usize {
        self.apps
            .iter()
            .filter(|app| app.snapshot.load().is_some())
            .count()
    }
}

/// Feeds one watcher's events into the shared state. A re-list (`Init` up to
/// `InitDone`) clears this kind from the apps it did not return, which is how
/// deletions missed while disconnected are noticed.
pub struct WatchEvents<K> {
    shared: Arc<Shared>,
    relist: Option<HashSet<String>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: AppObject> WatchEvents<K> {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            relist: None,
            _kind: PhantomData,
        }
    }

    pub async fn handle(&mut self, event: Event<K>) {
        match event {
            Event::Init => {
                tracing::debug!(kind = K::KIND, "Watcher re-listing");
                self.relist = Some(HashSet::new());
            }
            Event::InitApply(obj) => {
                if let (Some(seen), Some(app_id)) = (self.relist.as_mut(), app_id_of(&obj)) {
                    seen.insert(app_id);
                }
                self.shared.apply(&obj).await;
            }
            Event::InitDone => {
                if let Some(seen) = self.relist.take() {
                    tracing::debug!(kind = K::KIND, apps = seen.len(), "Watcher initialized");
                    self.shared.prune::<K>(&seen).await;
                }
            }
            Event::Apply(obj) => self.shared.apply(&obj).await,
            Event::Delete(obj) => self.shared.delete(&obj).await,
        }
    }
}

struct Running {
    client: Client,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct KubernetesSource {
    shared: Arc<Shared>,
    watch: bool,
    kube_config: Option<PathBuf>,
    namespace: String,
    cache_ttl: Duration,
    running: Mutex<Option<Running>>,
}

impl KubernetesSource {
    pub fn new(settings: &Settings, builtin: Manager) -> Self {
        Self {
            shared: Arc::new(Shared {
                builtin,
                apps: DashMap::new(),
                started: Instant::now(),
            }),
            watch: settings.config_source.watch,
            kube_config: settings.config_source.kube_config.clone(),
            namespace: settings.config_source.kube_namespace.clone(),
            cache_ttl: Duration::from_secs(settings.config_source.cache_ttl_seconds),
            running: Mutex::new(None),
        }
    }

    pub fn app_selector(app_id: &str) -> String {
        format!("{LABEL_APP_ID}={app_id}")
    }

    pub async fn apply_config_map(&self, config_map: &ConfigMap) {
        self.shared.apply(config_map).await
    }

    pub async fn apply_secret(&self, secret: &Secret) {
        self.shared.apply(secret).await
    }

    pub async fn delete_config_map(&self, config_map: &ConfigMap) {
        self.shared.delete(config_map).await
    }

    pub async fn delete_secret(&self, secret: &Secret) {
        self.shared.delete(secret).await
    }

    /// Record the result of listing one app's objects.
    pub async fn apply_listed(
        &self,
        app_id: &str,
        config_map: Listed<'_, ConfigMap>,
        secret: Listed<'_, Secret>,
    ) -> Result<Arc<AppContext>, ConfigSourceError> {
        self.shared.apply_listed(app_id, config_map, secret).await
    }

    /// A handler for the event stream of a watcher on kind `K`.
    pub fn watch_events<K: AppObject>(&self) -> WatchEvents<K> {
        WatchEvents::new(self.shared.clone())
    }

    pub fn evict_idle(&self, idle: Duration) -> usize {
        self.shared.evict_idle(idle)
    }

    /// Apps with a built snapshot.
    pub fn cached_apps(&self) -> usize {
        self.shared.cached_apps()
    }

    fn touch(&self, app_id: &str) {
        if let Some(app) = self.shared.apps.get(app_id) {
            app.last_used.store(self.shared.now(), Ordering::Relaxed);
        }
    }

    async fn connect(&self) -> Result<Client, ConfigSourceError> {
        let config = match &self.kube_config {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| ConfigSourceError::KubeConfig(e.to_string()))?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| ConfigSourceError::KubeConfig(e.to_string()))?
            }
            None => kube::Config::infer()
                .await
                .map_err(|e| ConfigSourceError::KubeConfig(e.to_string()))?,
        };
        Ok(Client::try_from(config)?)
    }

    async fn client(&self) -> Option<Client> {
        self.running.lock().await.as_ref().map(|r| r.client.clone())
    }

    /// List the app's objects by label and rebuild its snapshot.
    async fn load_from_cluster(
        &self,
        client: Client,
        app_id: &str,
    ) -> Result<Arc<AppContext>, ConfigSourceError> {
        let params = ListParams::default().labels(&Self::app_selector(app_id));
        let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &self.namespace);
        let secrets: Api<Secret> = Api::namespaced(client, &self.namespace);

        let config_maps = config_maps.list(&params).await?;
        let secrets = secrets.list(&params).await?;
        if config_maps.items.len() > 1 || secrets.items.len() > 1 {
            tracing::warn!(
                app_id = %app_id,
                config_maps = config_maps.items.len(),
                secrets = secrets.items.len(),
                "More than one object per kind; using the first"
            );
        }

        self.shared
            .apply_listed(
                app_id,
                Listed::from_list(&config_maps),
                Listed::from_list(&secrets),
            )
            .await
    }

    async fn list_all(&self, client: &Client) -> Result<(), ConfigSourceError> {
        let params = ListParams::default().labels(LABEL_APP_ID);
        let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &self.namespace);
        let secrets: Api<Secret> = Api::namespaced(client.clone(), &self.namespace);
        for cm in config_maps.list(&params).await?.items {
            self.shared.apply(&cm).await;
        }
        for secret in secrets.list(&params).await?.items {
            self.shared.apply(&secret).await;
        }
        Ok(())
    }

    fn spawn_cleanup(&self, token: CancellationToken) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let ttl = self.cache_ttl;
        let period = ttl.clamp(Duration::from_secs(1), Duration::from_secs(60));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        shared.evict_idle(ttl);
                    }
                }
            }
        })
    }
}

fn spawn_watch<K: AppObject>(
    api: Api<K>,
    mut events: WatchEvents<K>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stream = watcher::watcher(api, watcher::Config::default().labels(LABEL_APP_ID))
            .default_backoff();
        let mut stream = std::pin::pin!(stream);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => events.handle(event).await,
                    Some(Err(e)) => {
                        tracing::warn!(kind = K::KIND, error = %e, "Watcher error, will retry");
                    }
                    None => break,
                }
            }
        }
        tracing::debug!(kind = K::KIND, "Watcher stopped");
    })
}

#[async_trait]
impl ContextResolver for KubernetesSource {
    async fn open(&self) -> Result<(), ConfigSourceError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let client = self.connect().await?;
        let token = CancellationToken::new();
        let mut tasks = vec![self.spawn_cleanup(token.clone())];

        if self.watch {
            let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &self.namespace);
            let secrets: Api<Secret> = Api::namespaced(client.clone(), &self.namespace);
            tasks.push(spawn_watch(config_maps, self.watch_events(), token.clone()));
            tasks.push(spawn_watch(secrets, self.watch_events(), token.clone()));
        } else {
            self.list_all(&client).await?;
        }

        tracing::info!(namespace = %self.namespace, watch = self.watch, "Kubernetes config source opened");
        *running = Some(Running {
            client,
            token,
            tasks,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), ConfigSourceError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        running.token.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Kubernetes background task ended abnormally");
            }
        }
        Ok(())
    }

    /// Apps are addressed by ID only.
    async fn resolve_app_id(&self, request: &Parts) -> Result<String, ConfigSourceError> {
        let host = request
            .headers
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        Err(ConfigSourceError::AppNotFound(host.to_string()))
    }

    async fn resolve_context(&self, app_id: &str) -> Result<Arc<AppContext>, ConfigSourceError> {
        let app = self.shared.apps.get(app_id).map(|a| a.value().clone());
        if let Some(app) = app {
            if let Some(ctx) = app.snapshot.load_full() {
                self.touch(app_id);
                return Ok(ctx);
            }

            // Evicted, or never built: the slots may still hold both objects.
            let slots = app.slots.lock().await;
            if let Some(ctx) = app.snapshot.load_full() {
                self.touch(app_id);
                return Ok(ctx);
            }
            if !slots.is_empty() {
                let ctx = self.shared.rebuild(app_id, &app, &slots)?;
                self.touch(app_id);
                return Ok(ctx);
            }
        }

        let client = self.client().await.ok_or(ConfigSourceError::NotOpen)?;
        let ctx = self.load_from_cluster(client, app_id).await?;
        self.touch(app_id);
        Ok(ctx)
    }

    async fn reload_app(&self, app_id: &str) {
        let app = self.shared.apps.get(app_id).map(|a| a.value().clone());
        let result = match self.client().await {
            Some(client) => self.load_from_cluster(client, app_id).await,
            None => match app {
                Some(app) => {
                    let slots = app.slots.lock().await;
                    self.shared.rebuild(app_id, &app, &slots)
                }
                None => Err(ConfigSourceError::AppNotFound(app_id.to_string())),
            },
        };
        if let Err(e) = result {
            tracing::warn!(app_id = %app_id, error = %e, "Reload failed");
        }
    }
}

/// Build the labelled objects for an app's files, as a provisioning tool
/// would: `authgear.secrets.yaml` in the Secret, everything else in the
/// ConfigMap.
pub fn app_objects(app_id: &str, files: &BTreeMap<String, Vec<u8>>) -> (ConfigMap, Secret) {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    let meta = |name: String| ObjectMeta {
        name: Some(name),
        labels: Some(BTreeMap::from([(LABEL_APP_ID.to_string(), app_id.to_string())])),
        ..Default::default()
    };

    let mut config_data = BTreeMap::new();
    let mut secret_data = BTreeMap::new();
    for (path, data) in files {
        let key = crate::pathcodec::escape_path(path);
        if path == crate::resource::SECRET_CONFIG_PATH {
            secret_data.insert(key, ByteString(data.clone()));
        } else {
            config_data.insert(key, ByteString(data.clone()));
        }
    }

    let config_map = ConfigMap {
        metadata: meta(format!("app-{app_id}")),
        binary_data: Some(config_data),
        ..Default::default()
    };
    let secret = Secret {
        metadata: meta(format!("app-{app_id}")),
        data: Some(secret_data),
        ..Default::default()
    };
    (config_map, secret)
}
