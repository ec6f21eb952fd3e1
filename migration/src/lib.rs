pub use sea_orm_migration::prelude::*;

mod m20250101_000001_create_config_sources;
mod m20250102_000001_add_domains;
mod m20250103_000001_create_plans;
mod m20250104_000001_add_change_notifications;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_config_sources::Migration),
            Box::new(m20250102_000001_add_domains::Migration),
            Box::new(m20250103_000001_create_plans::Migration),
            Box::new(m20250104_000001_add_change_notifications::Migration),
        ]
    }
}
