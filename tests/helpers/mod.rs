pub mod db;
pub mod fixtures;

pub use db::TestDb;
pub use fixtures::{app_files, app_yaml, secrets_yaml, write_app_dir};
