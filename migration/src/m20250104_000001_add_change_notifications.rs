use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseBackend;

#[derive(DeriveMigrationName)]
pub struct Migration;

/// (table, channel, payload expression over `{row}`)
const NOTIFIERS: [(&str, &str, &str); 3] = [
    ("config_sources", "config_source_change", "{row}.app_id"),
    ("domains", "domain_change", "{row}.app_id || ':' || {row}.domain"),
    ("plans", "plan_change", "{row}.name"),
];

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // LISTEN/NOTIFY only exists on PostgreSQL.
        if manager.get_database_backend() != DatabaseBackend::Postgres {
            return Ok(());
        }

        let db = manager.get_connection();
        for (table, channel, payload) in NOTIFIERS {
            let old = payload.replace("{row}", "OLD");
            let new = payload.replace("{row}", "NEW");
            db.execute_unprepared(&format!(
                r#"CREATE OR REPLACE FUNCTION notify_{channel}() RETURNS trigger AS $$
BEGIN
    IF TG_OP = 'DELETE' THEN
        PERFORM pg_notify('{channel}', {old});
        RETURN OLD;
    END IF;
    PERFORM pg_notify('{channel}', {new});
    IF TG_OP = 'UPDATE' AND ({old}) IS DISTINCT FROM ({new}) THEN
        PERFORM pg_notify('{channel}', {old});
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql"#
            ))
            .await?;
            db.execute_unprepared(&format!(
                "CREATE TRIGGER {table}_notify AFTER INSERT OR UPDATE OR DELETE ON {table} \
                 FOR EACH ROW EXECUTE FUNCTION notify_{channel}()"
            ))
            .await?;
        }
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        if manager.get_database_backend() != DatabaseBackend::Postgres {
            return Ok(());
        }

        let db = manager.get_connection();
        for (table, channel, _) in NOTIFIERS {
            db.execute_unprepared(&format!("DROP TRIGGER IF EXISTS {table}_notify ON {table}"))
                .await?;
            db.execute_unprepared(&format!("DROP FUNCTION IF EXISTS notify_{channel}()"))
                .await?;
        }
        Ok(())
    }
}
