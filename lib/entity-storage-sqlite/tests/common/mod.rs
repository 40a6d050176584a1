#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use entity_storage::{
    ColumnMetadata, EntityManager, EntitySchema, RepositoryConnection, SchemaRegistry,
};
use entity_storage_sqlite::SqliteStore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub email: String,
}

impl User {
    pub fn new(name: &str, email: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            email: email.to_string(),
        }
    }
}

pub fn user_schema() -> EntitySchema {
    EntitySchema::builder("User", "users")
        .column(ColumnMetadata::integer("id").primary().increment())
        .column(ColumnMetadata::text("name"))
        .column(ColumnMetadata::text("email").unique())
        .build()
        .unwrap()
}

/// Register `schemas`, connect to a fresh in-memory database and create the
/// tables.
pub async fn setup(
    schemas: Vec<EntitySchema>,
) -> (EntityManager<SqliteStore>, Vec<Arc<EntitySchema>>) {
    let registry = Arc::new(SchemaRegistry::new());
    let registered = schemas
        .into_iter()
        .map(|schema| registry.register(schema).unwrap())
        .collect();
    registry.initialize();

    let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
    let manager = EntityManager::new(store, registry);
    manager.synchronize().await.unwrap();
    (manager, registered)
}

pub async fn setup_users() -> (EntityManager<SqliteStore>, Arc<EntitySchema>) {
    let (manager, mut schemas) = setup(vec![user_schema()]).await;
    let users = schemas.remove(0);
    (manager, users)
}
