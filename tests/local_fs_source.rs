mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::{app_yaml, secrets_yaml, write_app_dir};
use meridian::errors::ConfigSourceError;
use meridian::resource::Manager;
use meridian::source::{ContextResolver, LocalFsSource};
use tempfile::TempDir;

#[tokio::test]
async fn test_open_and_resolve() {
    let dir = TempDir::new().unwrap();
    write_app_dir(dir.path(), "demo", "http://demo.example.com");

    let source = LocalFsSource::with_directory(dir.path(), false, Manager::default());
    source.open().await.unwrap();

    let ctx = source.resolve_context("anything").await.unwrap();
    assert_eq!(ctx.app_id, "demo");
    assert_eq!(ctx.app_config().http.public_origin, "http://demo.example.com");
    assert_eq!(
        ctx.secret_config().redis().unwrap().redis_url,
        "redis://localhost/0"
    );

    source.close().await.unwrap();
}

#[tokio::test]
async fn test_open_rejects_invalid_app() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("authgear.yaml"),
        app_yaml("demo", "http://demo.example.com"),
    )
    .unwrap();
    // Only redis; every other required secret is missing.
    std::fs::write(
        dir.path().join("authgear.secrets.yaml"),
        "secrets:\n  - { key: redis, data: { redis_url: \"redis://x\" } }\n",
    )
    .unwrap();

    let source = LocalFsSource::with_directory(dir.path(), false, Manager::default());
    let err = source.open().await.unwrap_err();
    assert!(matches!(err, ConfigSourceError::Validation(_)), "{err:?}");
    assert!(matches!(
        source.resolve_context("demo").await,
        Err(ConfigSourceError::NotOpen)
    ));
}

#[tokio::test]
async fn test_failed_reload_keeps_previous_snapshot() {
    let dir = TempDir::new().unwrap();
    write_app_dir(dir.path(), "demo", "http://demo.example.com");

    let source = LocalFsSource::with_directory(dir.path(), false, Manager::default());
    source.open().await.unwrap();
    let before = source.resolve_context("demo").await.unwrap();

    std::fs::write(dir.path().join("authgear.yaml"), "id: [unterminated").unwrap();
    let err = source.reload().await.unwrap_err();
    assert!(matches!(err, ConfigSourceError::MalformedResource { .. }), "{err:?}");

    let after = source.resolve_context("demo").await.unwrap();
    assert!(Arc::ptr_eq(&before, &after));
}

#[tokio::test]
async fn test_update_resources_without_watch_reloads() {
    let dir = TempDir::new().unwrap();
    write_app_dir(dir.path(), "demo", "http://demo.example.com");

    let source = LocalFsSource::with_directory(dir.path(), false, Manager::default());
    source.open().await.unwrap();

    source
        .update_resources(vec![(
            "authgear.secrets.yaml".to_string(),
            Some(secrets_yaml("redis://updated/1").into_bytes()),
        )])
        .await
        .unwrap();

    let ctx = source.resolve_context("demo").await.unwrap();
    assert_eq!(ctx.secret_config().redis().unwrap().redis_url, "redis://updated/1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watch_picks_up_changes() {
    let dir = TempDir::new().unwrap();
    write_app_dir(dir.path(), "demo", "http://demo.example.com");

    let source = LocalFsSource::with_directory(dir.path(), true, Manager::default());
    source.open().await.unwrap();
    assert_eq!(source.resolve_context("demo").await.unwrap().app_id, "demo");

    std::fs::write(
        dir.path().join("authgear.yaml"),
        app_yaml("demo2", "http://demo2.example.com"),
    )
    .unwrap();

    let mut reloaded = false;
    for _ in 0..50 {
        if source.resolve_context("demo").await.unwrap().app_id == "demo2" {
            reloaded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(reloaded, "change was not picked up by the watcher");

    source.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_is_idempotent_and_stops_watching() {
    let dir = TempDir::new().unwrap();
    write_app_dir(dir.path(), "demo", "http://demo.example.com");

    let source = LocalFsSource::with_directory(dir.path(), true, Manager::default());
    source.open().await.unwrap();
    source.close().await.unwrap();
    source.close().await.unwrap();

    std::fs::write(
        dir.path().join("authgear.yaml"),
        app_yaml("demo2", "http://demo2.example.com"),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The last snapshot stays readable, but no longer follows the disk.
    assert_eq!(source.resolve_context("demo").await.unwrap().app_id, "demo");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_see_a_mixed_snapshot() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("authgear.yaml"),
        app_yaml("demo", "http://gen0.example.com"),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("authgear.secrets.yaml"),
        secrets_yaml("redis://gen0/0"),
    )
    .unwrap();

    let source = Arc::new(LocalFsSource::with_directory(
        dir.path(),
        false,
        Manager::default(),
    ));
    source.open().await.unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let source = source.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    let ctx = source.resolve_context("demo").await.unwrap();
                    let origin = &ctx.app_config().http.public_origin;
                    let generation = origin
                        .trim_start_matches("http://")
                        .trim_end_matches(".example.com");
                    let redis = &ctx.secret_config().redis().unwrap().redis_url;
                    assert_eq!(redis, &format!("redis://{generation}/0"));
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for generation in 1..=20 {
        source
            .update_resources(vec![
                (
                    "authgear.yaml".to_string(),
                    Some(app_yaml("demo", &format!("http://gen{generation}.example.com")).into_bytes()),
                ),
                (
                    "authgear.secrets.yaml".to_string(),
                    Some(secrets_yaml(&format!("redis://gen{generation}/0")).into_bytes()),
                ),
            ])
            .await
            .unwrap();
    }

    for reader in readers {
        reader.await.unwrap();
    }

    let ctx = source.resolve_context("demo").await.unwrap();
    assert_eq!(ctx.app_config().http.public_origin, "http://gen20.example.com");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_never_publish_a_mixed_snapshot() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("authgear.yaml"),
        app_yaml("demo", "http://gen0.example.com"),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("authgear.secrets.yaml"),
        secrets_yaml("redis://gen0/0"),
    )
    .unwrap();

    let source = Arc::new(LocalFsSource::with_directory(
        dir.path(),
        false,
        Manager::default(),
    ));
    source.open().await.unwrap();

    fn consistent(ctx: &meridian::model::AppContext) -> String {
        let generation = ctx
            .app_config()
            .http
            .public_origin
            .trim_start_matches("http://")
            .trim_end_matches(".example.com")
            .to_string();
        assert_eq!(
            ctx.secret_config().redis().unwrap().redis_url,
            format!("redis://{generation}/0")
        );
        generation
    }

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let source = source.clone();
            tokio::spawn(async move {
                for _ in 0..300 {
                    consistent(&source.resolve_context("demo").await.unwrap());
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    let writers: Vec<_> = (1..=4)
        .map(|writer| {
            let source = source.clone();
            tokio::spawn(async move {
                for i in 0..10 {
                    let generation = format!("gen{}", writer * 100 + i);
                    source
                        .update_resources(vec![
                            (
                                "authgear.yaml".to_string(),
                                Some(app_yaml("demo", &format!("http://{generation}.example.com")).into_bytes()),
                            ),
                            (
                                "authgear.secrets.yaml".to_string(),
                                Some(secrets_yaml(&format!("redis://{generation}/0")).into_bytes()),
                            ),
                        ])
                        .await
                        .unwrap();
                    // Explicit reloads race with the writers too.
                    source.reload().await.unwrap();
                }
            })
        })
        .collect();

    for task in writers.into_iter().chain(readers) {
        task.await.unwrap();
    }

    // The last published snapshot matches what is on disk.
    let published = consistent(&source.resolve_context("demo").await.unwrap());
    let on_disk = consistent(&source.reload().await.unwrap());
    assert_eq!(published, on_disk);
}
