mod helpers;

use std::path::PathBuf;

use helpers::{app_yaml, secrets_yaml};
use meridian::bag::ResourceBag;
use meridian::check;
use meridian::resource::Manager;
use meridian::settings::Settings;
use meridian::source::{ContextResolver, LocalFsSource};
use tempfile::TempDir;

fn builtin(dir: &TempDir) -> Manager {
    let mut settings = Settings::default();
    settings.resources.builtin_directory = Some(PathBuf::from(dir.path()));
    Manager::builtin(&settings)
}

#[tokio::test]
async fn test_app_layer_overrides_builtin_per_secret_key() {
    let base = TempDir::new().unwrap();
    std::fs::write(
        base.path().join("authgear.secrets.yaml"),
        secrets_yaml("redis://builtin/0"),
    )
    .unwrap();
    std::fs::write(
        base.path().join("authgear.yaml"),
        app_yaml("builtin", "https://builtin.example.com"),
    )
    .unwrap();

    let app = TempDir::new().unwrap();
    std::fs::write(
        app.path().join("authgear.yaml"),
        app_yaml("demo", "https://demo.example.com"),
    )
    .unwrap();
    // Only redis is overridden; the other secrets come from the base layer.
    std::fs::write(
        app.path().join("authgear.secrets.yaml"),
        "secrets:\n  - key: redis\n    data:\n      redis_url: redis://app/0\n",
    )
    .unwrap();

    let source = LocalFsSource::with_directory(app.path(), false, builtin(&base));
    source.open().await.unwrap();
    let ctx = source.resolve_context("demo").await.unwrap();

    assert_eq!(ctx.app_id, "demo");
    assert_eq!(ctx.app_config().http.public_origin, "https://demo.example.com");
    assert_eq!(ctx.secret_config().redis().unwrap().redis_url, "redis://app/0");
    assert_eq!(
        ctx.secret_config().database().unwrap().database_url,
        "postgres://localhost/app"
    );
    assert_eq!(ctx.resources.layers().len(), 2);
}

#[test]
fn test_builtin_only_file_is_visible_to_app() {
    let base = TempDir::new().unwrap();
    std::fs::create_dir_all(base.path().join("templates")).unwrap();
    std::fs::write(base.path().join("templates/welcome.html"), "hi").unwrap();

    let app = TempDir::new().unwrap();
    std::fs::write(
        app.path().join("authgear.yaml"),
        app_yaml("demo", "https://demo.example.com"),
    )
    .unwrap();
    std::fs::write(
        app.path().join("authgear.secrets.yaml"),
        secrets_yaml("redis://app/0"),
    )
    .unwrap();

    let ctx = check::check_directory(&builtin(&base), app.path()).unwrap();
    assert_eq!(ctx.resources.read_file("templates/welcome.html").unwrap(), b"hi");
}

#[test]
fn test_pack_then_unpack_directory() {
    let src = TempDir::new().unwrap();
    std::fs::create_dir_all(src.path().join("templates/en")).unwrap();
    std::fs::write(src.path().join("templates/en/a b.html"), "<p>").unwrap();
    std::fs::write(
        src.path().join("authgear.yaml"),
        app_yaml("demo", "https://demo.example.com"),
    )
    .unwrap();

    let json = ResourceBag::pack_directory(src.path()).unwrap().to_json().unwrap();

    let dst = TempDir::new().unwrap();
    ResourceBag::from_json(&json)
        .unwrap()
        .unpack_into(dst.path())
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(dst.path().join("templates/en/a b.html")).unwrap(),
        "<p>"
    );
    assert_eq!(
        std::fs::read_to_string(dst.path().join("authgear.yaml")).unwrap(),
        app_yaml("demo", "https://demo.example.com")
    );
}
