//! Queries against the control-plane tables.

use chrono::Utc;
use sea_orm::{
    AccessMode, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    DatabaseTransaction, DbBackend, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
    TransactionTrait,
};

use crate::bag::ResourceBag;
use crate::entities;
use crate::errors::ConfigSourceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSourceRecord {
    pub id: String,
    pub app_id: String,
    pub data: ResourceBag,
    pub plan_name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DatabaseSourceRecord {
    fn from_model(model: entities::config_source::Model) -> Result<Self, ConfigSourceError> {
        let data = ResourceBag::from_json(&model.data).map_err(|e| {
            ConfigSourceError::malformed(format!("config_sources[{}].data", model.app_id), e)
        })?;
        Ok(Self {
            id: model.id,
            app_id: model.app_id,
            data,
            plan_name: model.plan_name,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

/// Start a transaction that only reads. SQLite has no read-only mode, so a
/// plain transaction is used there.
pub async fn begin_read_only(db: &DatabaseConnection) -> Result<DatabaseTransaction, DbErr> {
    match db.get_database_backend() {
        DbBackend::Sqlite => db.begin().await,
        _ => db.begin_with_config(None, Some(AccessMode::ReadOnly)).await,
    }
}

pub async fn get_source_by_app_id<C: ConnectionTrait>(
    db: &C,
    app_id: &str,
) -> Result<Option<DatabaseSourceRecord>, ConfigSourceError> {
    use entities::config_source::{Column, Entity};

    match Entity::find()
        .filter(Column::AppId.eq(app_id))
        .one(db)
        .await?
    {
        Some(model) => Ok(Some(DatabaseSourceRecord::from_model(model)?)),
        None => Ok(None),
    }
}

pub async fn create_source<C: ConnectionTrait>(
    db: &C,
    app_id: &str,
    data: &ResourceBag,
    plan_name: &str,
) -> Result<DatabaseSourceRecord, ConfigSourceError> {
    let now = Utc::now().timestamp();
    let id = uuid::Uuid::new_v4().to_string();

    let source = entities::config_source::ActiveModel {
        id: Set(id.clone()),
        app_id: Set(app_id.to_string()),
        data: Set(data.to_json()?),
        plan_name: Set(plan_name.to_string()),
        created_at: Set(now),
        updated_at: Set(now),
    };
    source.insert(db).await?;

    Ok(DatabaseSourceRecord {
        id,
        app_id: app_id.to_string(),
        data: data.clone(),
        plan_name: plan_name.to_string(),
        created_at: now,
        updated_at: now,
    })
}

pub async fn update_source_data<C: ConnectionTrait>(
    db: &C,
    record: &DatabaseSourceRecord,
) -> Result<i64, ConfigSourceError> {
    let now = Utc::now().timestamp();
    let source = entities::config_source::ActiveModel {
        id: Set(record.id.clone()),
        data: Set(record.data.to_json()?),
        updated_at: Set(now),
        ..Default::default()
    };
    source.update(db).await?;
    Ok(now)
}

pub async fn list_app_ids<C: ConnectionTrait>(db: &C) -> Result<Vec<String>, ConfigSourceError> {
    use entities::config_source::{Column, Entity};

    let ids = Entity::find()
        .select_only()
        .column(Column::AppId)
        .order_by_asc(Column::AppId)
        .into_tuple::<String>()
        .all(db)
        .await?;
    Ok(ids)
}

pub async fn get_app_id_by_domain<C: ConnectionTrait>(
    db: &C,
    domain: &str,
) -> Result<Option<String>, ConfigSourceError> {
    use entities::domain::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::Domain.eq(domain))
        .one(db)
        .await?
        .map(|model| model.app_id))
}

pub async fn get_domains_by_app_id<C: ConnectionTrait>(
    db: &C,
    app_id: &str,
) -> Result<Vec<String>, ConfigSourceError> {
    use entities::domain::{Column, Entity};

    let domains = Entity::find()
        .filter(Column::AppId.eq(app_id))
        .order_by_asc(Column::Domain)
        .all(db)
        .await?
        .into_iter()
        .map(|model| model.domain)
        .collect();
    Ok(domains)
}

pub async fn add_domain<C: ConnectionTrait>(
    db: &C,
    app_id: &str,
    domain: &str,
) -> Result<(), ConfigSourceError> {
    let row = entities::domain::ActiveModel {
        id: Set(uuid::Uuid::new_v4().to_string()),
        app_id: Set(app_id.to_string()),
        domain: Set(domain.to_ascii_lowercase()),
        created_at: Set(Utc::now().timestamp()),
    };
    row.insert(db).await?;
    Ok(())
}

/// Delete a domain mapping. Returns the app it pointed at, if any.
pub async fn remove_domain<C: ConnectionTrait>(
    db: &C,
    domain: &str,
) -> Result<Option<String>, ConfigSourceError> {
    use entities::domain::{Column, Entity};

    let domain = domain.to_ascii_lowercase();
    let Some(model) = Entity::find()
        .filter(Column::Domain.eq(domain.as_str()))
        .one(db)
        .await?
    else {
        return Ok(None);
    };
    Entity::delete_by_id(model.id).exec(db).await?;
    Ok(Some(model.app_id))
}

pub async fn get_plan_by_name<C: ConnectionTrait>(
    db: &C,
    name: &str,
) -> Result<Option<entities::plan::Model>, ConfigSourceError> {
    use entities::plan::{Column, Entity};

    Ok(Entity::find().filter(Column::Name.eq(name)).one(db).await?)
}

/// Create the plan or replace its feature config.
pub async fn upsert_plan<C: ConnectionTrait>(
    db: &C,
    name: &str,
    feature_config: &str,
) -> Result<(), ConfigSourceError> {
    let now = Utc::now().timestamp();
    match get_plan_by_name(db, name).await? {
        Some(existing) => {
            let plan = entities::plan::ActiveModel {
                id: Set(existing.id),
                feature_config: Set(feature_config.to_string()),
                updated_at: Set(now),
                ..Default::default()
            };
            plan.update(db).await?;
        }
        None => {
            let plan = entities::plan::ActiveModel {
                id: Set(uuid::Uuid::new_v4().to_string()),
                name: Set(name.to_string()),
                feature_config: Set(feature_config.to_string()),
                created_at: Set(now),
                updated_at: Set(now),
            };
            plan.insert(db).await?;
        }
    }
    Ok(())
}
