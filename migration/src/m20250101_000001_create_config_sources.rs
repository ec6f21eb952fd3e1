use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // One row per app. `data` holds the JSON resource bag:
        // { "<escaped-path>": "<base64>" }
        manager
            .create_table(
                Table::create()
                    .table(ConfigSources::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ConfigSources::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string_uniq(ConfigSources::AppId))
                    .col(text(ConfigSources::Data))
                    .col(string(ConfigSources::PlanName).default(""))
                    .col(big_integer(ConfigSources::CreatedAt))
                    .col(big_integer(ConfigSources::UpdatedAt))
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ConfigSources::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ConfigSources {
    Table,
    Id,
    AppId,
    Data,
    PlanName,
    CreatedAt,
    UpdatedAt,
}
