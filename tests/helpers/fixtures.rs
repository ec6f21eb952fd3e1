use std::collections::BTreeMap;
use std::path::Path;

/// `authgear.yaml` for `app_id`, served from `origin`.
pub fn app_yaml(app_id: &str, origin: &str) -> String {
    format!("id: {app_id}\nhttp:\n  public_origin: {origin}\n")
}

/// A secrets file that satisfies an app without hooks, SSO providers or
/// confidential clients.
pub fn secrets_yaml(redis_url: &str) -> String {
    format!(
        r#"secrets:
  - key: db
    data:
      database_url: postgres://localhost/app
  - key: redis
    data:
      redis_url: {redis_url}
  - key: admin-api.auth
    data:
      keys: [{{ kid: admin }}]
  - key: oauth
    data:
      keys: [{{ kid: oauth }}]
  - key: csrf
    data:
      keys: [{{ kid: csrf }}]
"#
    )
}

pub fn app_files(app_id: &str, origin: &str) -> BTreeMap<String, Vec<u8>> {
    BTreeMap::from([
        (
            "authgear.yaml".to_string(),
            app_yaml(app_id, origin).into_bytes(),
        ),
        (
            "authgear.secrets.yaml".to_string(),
            secrets_yaml("redis://localhost/0").into_bytes(),
        ),
    ])
}

/// Write a complete, valid app into `dir`.
pub fn write_app_dir(dir: &Path, app_id: &str, origin: &str) {
    for (path, data) in app_files(app_id, origin) {
        std::fs::write(dir.join(path), data).expect("Failed to write app file");
    }
}
