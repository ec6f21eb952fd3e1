mod helpers;

use std::sync::Arc;
use std::time::Duration;

use axum::http::request::Parts;
use axum::http::Request;
use helpers::{app_files, app_yaml, secrets_yaml, TestDb};
use meridian::bag::ResourceBag;
use meridian::check;
use meridian::errors::ConfigSourceError;
use meridian::resource::Manager;
use meridian::settings::{ResolveAppIdType, Settings, SourceType};
use meridian::source::database::{
    CONFIG_SOURCE_CHANGE_CHANNEL, DOMAIN_CHANGE_CHANNEL, PLAN_CHANGE_CHANNEL,
};
use meridian::source::{ContextResolver, DatabaseSource};
use meridian::store;

fn settings(resolve: ResolveAppIdType) -> Settings {
    let mut settings = Settings::default();
    settings.config_source.source_type = SourceType::Database;
    settings.config_source.resolve_app_id_type = resolve;
    settings
}

fn request(host: &str, path: &str) -> Parts {
    Request::builder()
        .uri(path)
        .header("host", host)
        .body(())
        .unwrap()
        .into_parts()
        .0
}

async fn source(db: &TestDb, resolve: ResolveAppIdType) -> DatabaseSource {
    let source = DatabaseSource::new(
        &settings(resolve),
        Manager::default(),
        db.connection().clone(),
    );
    source.open().await.unwrap();
    source
}

#[tokio::test]
async fn test_create_then_resolve_by_domain() {
    let db = TestDb::new().await;
    let source = source(&db, ResolveAppIdType::Domain).await;

    let record = source
        .create_database_source("acme", app_files("acme", "https://Acme.example.com"), "free")
        .await
        .unwrap();
    assert_eq!(record.app_id, "acme");
    assert_eq!(record.plan_name, "free");
    assert_eq!(record.data.len(), 2);

    let app_id = source
        .resolve_app_id(&request("acme.example.com:443", "/"))
        .await
        .unwrap();
    assert_eq!(app_id, "acme");

    let ctx = source.resolve_context(&app_id).await.unwrap();
    assert_eq!(ctx.app_id, "acme");
    assert_eq!(ctx.domains, vec!["acme.example.com".to_string()]);
    assert_eq!(source.cached_apps(), 1);

    source.close().await.unwrap();
    source.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_host_is_app_not_found() {
    let db = TestDb::new().await;
    let source = source(&db, ResolveAppIdType::Domain).await;

    let err = source
        .resolve_app_id(&request("nobody.example.com", "/"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigSourceError::AppNotFound(ref h) if h == "nobody.example.com"));

    let err = source.resolve_context("nobody").await.unwrap_err();
    assert!(matches!(err, ConfigSourceError::AppNotFound(_)));
}

#[tokio::test]
async fn test_duplicated_app_id() {
    let db = TestDb::new().await;
    let source = source(&db, ResolveAppIdType::Domain).await;

    source
        .create_database_source("acme", app_files("acme", "https://acme.example.com"), "")
        .await
        .unwrap();
    let err = source
        .create_database_source("acme", app_files("acme", "https://other.example.com"), "")
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigSourceError::DuplicatedAppId(ref id) if id == "acme"));

    // The failed create left nothing behind.
    assert_eq!(
        store::get_domains_by_app_id(db.connection(), "acme").await.unwrap(),
        vec!["acme.example.com".to_string()]
    );
}

#[tokio::test]
async fn test_update_invalidates_cached_app() {
    let db = TestDb::new().await;
    let source = source(&db, ResolveAppIdType::Domain).await;
    source
        .create_database_source("acme", app_files("acme", "https://acme.example.com"), "")
        .await
        .unwrap();

    let before = source.resolve_context("acme").await.unwrap();
    assert_eq!(before.secret_config().redis().unwrap().redis_url, "redis://localhost/0");

    let changed = source
        .update_database_source(
            "acme",
            vec![(
                "authgear.secrets.yaml".to_string(),
                Some(secrets_yaml("redis://updated/2").into_bytes()),
            )],
        )
        .await
        .unwrap();
    assert!(changed);

    let after = source.resolve_context("acme").await.unwrap();
    assert_eq!(after.secret_config().redis().unwrap().redis_url, "redis://updated/2");
    // The earlier snapshot is immutable.
    assert_eq!(before.secret_config().redis().unwrap().redis_url, "redis://localhost/0");

    let unchanged = source
        .update_database_source(
            "acme",
            vec![(
                "authgear.secrets.yaml".to_string(),
                Some(secrets_yaml("redis://updated/2").into_bytes()),
            )],
        )
        .await
        .unwrap();
    assert!(!unchanged);
}

#[tokio::test]
async fn test_update_unknown_app() {
    let db = TestDb::new().await;
    let source = source(&db, ResolveAppIdType::Domain).await;
    let err = source
        .update_database_source("ghost", vec![("a.txt".to_string(), None)])
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigSourceError::AppNotFound(_)));
}

#[tokio::test]
async fn test_resolve_by_path() {
    let db = TestDb::new().await;
    let source = source(&db, ResolveAppIdType::Path).await;
    source
        .create_database_source("acme", app_files("acme", "https://acme.example.com"), "")
        .await
        .unwrap();

    let app_id = source
        .resolve_app_id(&request("localhost", "/acme/_meridian/app"))
        .await
        .unwrap();
    assert_eq!(app_id, "acme");

    let err = source
        .resolve_app_id(&request("localhost", "/ghost/_meridian/app"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigSourceError::AppNotFound(_)));

    let err = source
        .resolve_app_id(&request("localhost", "/"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigSourceError::AppNotFound(_)));
}

#[tokio::test]
async fn test_invalid_stored_app_is_not_cached() {
    let db = TestDb::new().await;
    let source = source(&db, ResolveAppIdType::Domain).await;

    let mut files = app_files("broken", "https://broken.example.com");
    files.insert("authgear.yaml".to_string(), b"id: [".to_vec());
    store::create_source(db.connection(), "broken", &ResourceBag::from_files(files), "")
        .await
        .unwrap();

    let err = source.resolve_context("broken").await.unwrap_err();
    assert!(matches!(err, ConfigSourceError::MalformedResource { .. }), "{err:?}");

    source
        .update_database_source(
            "broken",
            vec![(
                "authgear.yaml".to_string(),
                Some(b"id: broken\nhttp:\n  public_origin: https://broken.example.com\n".to_vec()),
            )],
        )
        .await
        .unwrap();
    assert_eq!(source.resolve_context("broken").await.unwrap().app_id, "broken");
}

#[tokio::test]
async fn test_evict_idle() {
    let db = TestDb::new().await;
    let source = source(&db, ResolveAppIdType::Domain).await;
    source
        .create_database_source("acme", app_files("acme", "https://acme.example.com"), "")
        .await
        .unwrap();

    source.resolve_context("acme").await.unwrap();
    assert_eq!(source.evict_idle(Duration::from_secs(3600)), 0);
    assert_eq!(source.evict_idle(Duration::ZERO), 1);
    assert_eq!(source.cached_apps(), 0);

    // Evicted apps load again on demand.
    assert_eq!(source.resolve_context("acme").await.unwrap().app_id, "acme");
}

#[tokio::test]
async fn test_check_database_reports_each_failure() {
    let db = TestDb::new().await;
    let source = source(&db, ResolveAppIdType::Domain).await;
    source
        .create_database_source("good", app_files("good", "https://good.example.com"), "")
        .await
        .unwrap();

    let mut files = app_files("bad", "https://bad.example.com");
    files.remove("authgear.secrets.yaml");
    store::create_source(db.connection(), "bad", &ResourceBag::from_files(files), "")
        .await
        .unwrap();

    let report = check::check_database(db.connection(), &Manager::default(), &[])
        .await
        .unwrap();
    assert_eq!(report.checked, 2);
    assert!(!report.is_ok());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].app_id, "bad");
    assert!(matches!(
        report.failures[0].error,
        ConfigSourceError::ResourceNotFound { .. }
    ));

    let report = check::check_database(db.connection(), &Manager::default(), &["good".to_string()])
        .await
        .unwrap();
    assert!(report.is_ok());
    assert_eq!(report.checked, 1);
}

/// An app with `clients` public OAuth clients.
fn app_with_clients(app_id: &str, clients: usize) -> std::collections::BTreeMap<String, Vec<u8>> {
    let mut yaml = app_yaml(app_id, &format!("https://{app_id}.example.com"));
    yaml.push_str("oauth:\n  clients:\n");
    for i in 0..clients {
        yaml.push_str(&format!("    - client_id: c{i}\n"));
    }
    let mut files = app_files(app_id, &format!("https://{app_id}.example.com"));
    files.insert("authgear.yaml".to_string(), yaml.into_bytes());
    files
}

#[tokio::test]
async fn test_failed_load_is_not_cached() {
    let db = TestDb::new().await;
    let source = source(&db, ResolveAppIdType::Path).await;

    for _ in 0..3 {
        let err = source
            .resolve_app_id(&request("localhost", "/ghost/_meridian/app"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigSourceError::AppNotFound(_)));
    }
    assert_eq!(source.cached_apps(), 0);

    let mut files = app_files("broken", "https://broken.example.com");
    files.insert("authgear.yaml".to_string(), b"id: [".to_vec());
    store::create_source(db.connection(), "broken", &ResourceBag::from_files(files), "")
        .await
        .unwrap();
    assert!(source.resolve_context("broken").await.is_err());
    assert_eq!(source.cached_apps(), 0);
}

#[tokio::test]
async fn test_plan_limits_apply_to_its_apps() {
    let db = TestDb::new().await;
    let source = source(&db, ResolveAppIdType::Domain).await;

    source
        .upsert_plan("free", "oauth:\n  client:\n    maximum: 2\n")
        .await
        .unwrap();
    source
        .create_database_source("acme", app_with_clients("acme", 2), "free")
        .await
        .unwrap();
    source
        .create_database_source("other", app_with_clients("other", 2), "")
        .await
        .unwrap();

    let ctx = source.resolve_context("acme").await.unwrap();
    assert_eq!(ctx.plan_name, "free");
    assert_eq!(ctx.feature_config().oauth.client.maximum, Some(2));
    assert_eq!(ctx.resources.layers().len(), 2);
    let other = source.resolve_context("other").await.unwrap();
    assert_eq!(other.plan_name, "");
    assert_eq!(other.feature_config().oauth.client.maximum, None);
    assert_eq!(source.cached_apps(), 2);

    // Tightening the plan drops only the apps on it.
    source
        .upsert_plan("free", "oauth:\n  client:\n    maximum: 1\n")
        .await
        .unwrap();
    assert_eq!(source.cached_apps(), 1);
    let err = source.resolve_context("acme").await.unwrap_err();
    let ConfigSourceError::Validation(errs) = err else {
        panic!("expected a validation error, got {err:?}");
    };
    assert_eq!(errs.violations[0].location, "/oauth/clients");

    // The app's own features file replaces the plan's.
    source
        .update_database_source(
            "acme",
            vec![(
                "authgear.features.yaml".to_string(),
                Some(b"oauth:\n  client:\n    maximum: 3\n".to_vec()),
            )],
        )
        .await
        .unwrap();
    let ctx = source.resolve_context("acme").await.unwrap();
    assert_eq!(ctx.feature_config().oauth.client.maximum, Some(3));

    let report = check::check_database(db.connection(), &Manager::default(), &[])
        .await
        .unwrap();
    assert!(report.is_ok(), "{:?}", report.failures);
}

#[tokio::test]
async fn test_unknown_plan_and_invalid_plan() {
    let db = TestDb::new().await;
    let source = source(&db, ResolveAppIdType::Domain).await;

    source
        .create_database_source("acme", app_with_clients("acme", 4), "enterprise")
        .await
        .unwrap();
    let ctx = source.resolve_context("acme").await.unwrap();
    assert_eq!(ctx.plan_name, "enterprise");
    assert_eq!(ctx.feature_config().oauth.client.maximum, None);

    let err = source.upsert_plan("bad", "billing: {}\n").await.unwrap_err();
    assert!(matches!(err, ConfigSourceError::MalformedResource { .. }), "{err:?}");
    assert!(store::get_plan_by_name(db.connection(), "bad").await.unwrap().is_none());
}

#[tokio::test]
async fn test_domain_changes_clear_host_cache() {
    let db = TestDb::new().await;
    let source = source(&db, ResolveAppIdType::Domain).await;
    for app_id in ["acme", "beta"] {
        source
            .create_database_source(app_id, app_files(app_id, &format!("https://{app_id}.example.com")), "")
            .await
            .unwrap();
    }

    source.add_domain("acme", "Login.example.com").await.unwrap();
    let login = request("login.example.com", "/");
    assert_eq!(source.resolve_app_id(&login).await.unwrap(), "acme");
    assert_eq!(source.cached_hosts(), 1);
    let ctx = source.resolve_context("acme").await.unwrap();
    assert!(ctx.domains.contains(&"login.example.com".to_string()));

    let err = source.add_domain("beta", "login.example.com").await.unwrap_err();
    assert!(matches!(err, ConfigSourceError::DuplicatedDomain(ref d) if d == "login.example.com"));
    let err = source.add_domain("ghost", "ghost.example.com").await.unwrap_err();
    assert!(matches!(err, ConfigSourceError::AppNotFound(_)));

    assert!(source.remove_domain("login.example.com").await.unwrap());
    assert!(!source.remove_domain("login.example.com").await.unwrap());
    assert!(matches!(
        source.resolve_app_id(&login).await,
        Err(ConfigSourceError::AppNotFound(_))
    ));
    let ctx = source.resolve_context("acme").await.unwrap();
    assert_eq!(ctx.domains, vec!["acme.example.com".to_string()]);

    source.add_domain("beta", "login.example.com").await.unwrap();
    assert_eq!(source.resolve_app_id(&login).await.unwrap(), "beta");
}

#[tokio::test]
async fn test_notifications_from_other_writers() {
    let db = TestDb::new().await;
    let source = source(&db, ResolveAppIdType::Domain).await;
    source.upsert_plan("free", "").await.unwrap();
    source
        .create_database_source("acme", app_files("acme", "https://acme.example.com"), "free")
        .await
        .unwrap();
    source
        .create_database_source("beta", app_files("beta", "https://beta.example.com"), "")
        .await
        .unwrap();

    let host = request("acme.example.com", "/");
    assert_eq!(source.resolve_app_id(&host).await.unwrap(), "acme");

    // Another process moves the domain; the cache holds until told.
    store::remove_domain(db.connection(), "acme.example.com").await.unwrap();
    store::add_domain(db.connection(), "beta", "acme.example.com").await.unwrap();
    assert_eq!(source.resolve_app_id(&host).await.unwrap(), "acme");
    source.handle_notification(DOMAIN_CHANGE_CHANNEL, "acme:acme.example.com");
    assert_eq!(source.resolve_app_id(&host).await.unwrap(), "beta");

    source.resolve_context("acme").await.unwrap();
    source.resolve_context("beta").await.unwrap();
    assert_eq!(source.cached_apps(), 2);

    source.handle_notification("unrelated", "acme");
    assert_eq!(source.cached_apps(), 2);

    source.handle_notification(PLAN_CHANGE_CHANNEL, "free");
    assert_eq!(source.cached_apps(), 1);
    source.resolve_context("acme").await.unwrap();

    source.handle_notification(CONFIG_SOURCE_CHANGE_CHANNEL, "beta");
    assert_eq!(source.cached_apps(), 1);
    assert_eq!(source.resolve_context("beta").await.unwrap().domains.len(), 2);

    source.handle_notification(DOMAIN_CHANGE_CHANNEL, "garbled");
    assert_eq!(source.cached_apps(), 0);
    assert_eq!(source.cached_hosts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reload_races_with_readers() {
    let db = TestDb::new().await;
    let source = Arc::new(source(&db, ResolveAppIdType::Domain).await);
    source
        .create_database_source("acme", generation(0), "")
        .await
        .unwrap();

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let source = source.clone();
            tokio::spawn(async move {
                for _ in 0..25 {
                    let ctx = source.resolve_context("acme").await.unwrap();
                    // Both files always come from the same write.
                    let origin = &ctx.app_config().http.public_origin;
                    let redis = &ctx.secret_config().redis().unwrap().redis_url;
                    let n = origin
                        .trim_start_matches("https://gen")
                        .trim_end_matches(".example.com");
                    assert_eq!(redis, &format!("redis://gen{n}/0"));
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for n in 1..=5 {
        let edits = generation(n)
            .into_iter()
            .map(|(path, data)| (path, Some(data)))
            .collect();
        source.update_database_source("acme", edits).await.unwrap();
        source.reload_app("acme").await;
        tokio::task::yield_now().await;
    }

    for reader in readers {
        reader.await.unwrap();
    }
    let ctx = source.resolve_context("acme").await.unwrap();
    assert_eq!(ctx.app_config().http.public_origin, "https://gen5.example.com");
}

fn generation(n: usize) -> std::collections::BTreeMap<String, Vec<u8>> {
    std::collections::BTreeMap::from([
        (
            "authgear.yaml".to_string(),
            app_yaml("acme", &format!("https://gen{n}.example.com")).into_bytes(),
        ),
        (
            "authgear.secrets.yaml".to_string(),
            secrets_yaml(&format!("redis://gen{n}/0")).into_bytes(),
        ),
    ])
}
