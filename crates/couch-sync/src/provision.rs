//! Store provisioning: create the database and install the collection view.
//!
//! The collection view projects every document whose id has a collection
//! prefix, and which is not soft-deleted, to a row keyed by that prefix. The
//! collection read path depends on it.

use crate::config::SyncConfig;
use crate::database::{Database, DbError, ViewRow};
use crate::document::{collection_name, Document};
use crate::error::{Result, SyncError};
use serde_json::{json, Map, Value};
use tracing::{error, info};

/// Design document key recording the options the views were built with.
const OPTIONS_KEY: &str = "syncOptions";

/// Outcome of `ensure_store`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    /// Store already existed; nothing was written
    Existing,
    /// Store was created and the design document installed
    Installed,
}

/// CouchDB map function equivalent to `collection_row`.
pub fn collection_map_source(soft_delete_field: &str) -> String {
    format!(
        "function(doc) {{ if (!doc[{field}] && doc._id.indexOf('/') > 0) emit(doc._id.split('/')[0], doc); }}",
        field = Value::String(soft_delete_field.to_string())
    )
}

/// Body of the design document holding the collection view.
pub fn design_document(config: &SyncConfig) -> Map<String, Value> {
    let mut views = Map::new();
    views.insert(
        config.collection_view.clone(),
        json!({ "map": collection_map_source(&config.soft_delete_field) }),
    );

    let mut body = Map::new();
    body.insert("language".into(), json!("javascript"));
    body.insert("views".into(), Value::Object(views));
    body.insert(
        OPTIONS_KEY.into(),
        json!({ "softDeleteField": config.soft_delete_field }),
    );
    body
}

/// Whether a design document body defines `view`.
pub fn defines_view(design: &Map<String, Value>, view: &str) -> bool {
    design
        .get("views")
        .and_then(Value::as_object)
        .is_some_and(|views| views.contains_key(view))
}

/// Soft-delete field a design document's views were built with.
pub fn soft_delete_field(design: &Map<String, Value>, view: &str) -> Option<String> {
    if !defines_view(design, view) {
        return None;
    }
    design
        .get(OPTIONS_KEY)
        .and_then(|options| options.get("softDeleteField"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Row the collection view emits for `doc`, if any.
pub fn collection_row(doc: &Document, soft_delete_field: &str) -> Option<ViewRow> {
    if doc.is_soft_deleted(soft_delete_field) {
        return None;
    }
    let key = collection_name(&doc.id)?;
    let value = serde_json::to_value(doc).ok()?;
    Some(ViewRow {
        id: doc.id.clone(),
        key: key.to_string(),
        value,
    })
}

/// Make sure the backing store exists, creating and provisioning it if not.
pub async fn ensure_store(db: &dyn Database, config: &SyncConfig) -> Result<Provisioned> {
    let exists = db.exists().await.map_err(|e| {
        error!("Failed to check database {}: {}", config.database, e);
        install_error(config, e)
    })?;

    if exists {
        info!("Connected to {}", config.database);
        return Ok(Provisioned::Existing);
    }

    info!("Database {} did not exist; creating", config.database);
    install(db, config).await?;
    Ok(Provisioned::Installed)
}

/// Create the store and save the design document.
pub async fn install(db: &dyn Database, config: &SyncConfig) -> Result<()> {
    db.create().await.map_err(|e| {
        error!("Failed to create database {}: {}", config.database, e);
        install_error(config, e)
    })?;

    let design = design_document(config);
    db.save(&config.design_document, None, &design)
        .await
        .map_err(|e| {
            error!("Failed to install {}: {}", config.design_document, e);
            install_error(config, e)
        })?;

    info!(
        "Installed {} with view {}",
        config.design_document, config.collection_view
    );
    Ok(())
}

fn install_error(config: &SyncConfig, source: DbError) -> SyncError {
    SyncError::Backend {
        operation: "install",
        id: config.database.clone(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDatabase;

    fn doc(id: &str, body: Value) -> Document {
        Document::new(id, Some("1-a".parse().unwrap()), body.as_object().cloned().unwrap())
    }

    #[test]
    fn test_collection_row_projection() {
        let row = collection_row(&doc("widgets/1", json!({"name": "a"})), "isDeleted").unwrap();
        assert_eq!(row.key, "widgets");
        assert_eq!(row.id, "widgets/1");
        assert_eq!(row.value["name"], json!("a"));
        assert_eq!(row.value["_id"], json!("widgets/1"));

        assert!(collection_row(&doc("widgets/1", json!({"isDeleted": true})), "isDeleted").is_none());
        assert!(collection_row(&doc("widgets/1", json!({"isDeleted": 1})), "isDeleted").is_none());
        assert!(collection_row(&doc("widgets/1", json!({"isDeleted": 0})), "isDeleted").is_some());
        assert!(collection_row(&doc("widgets", json!({})), "isDeleted").is_none());
    }

    #[test]
    fn test_map_source_mentions_field() {
        let source = collection_map_source("isDeleted");
        assert!(source.contains("doc[\"isDeleted\"]"));
        assert!(source.contains("emit(doc._id.split('/')[0], doc)"));
    }

    #[test]
    fn test_design_document_shape() {
        let config = SyncConfig::default();
        let design = design_document(&config);
        assert!(defines_view(&design, "collection"));
        assert!(!defines_view(&design, "other"));
        assert_eq!(
            soft_delete_field(&design, "collection").as_deref(),
            Some("isDeleted")
        );
    }

    #[tokio::test]
    async fn test_ensure_store_installs_once() {
        let db = InMemoryDatabase::new();
        let config = SyncConfig::default();

        assert_eq!(ensure_store(&db, &config).await.unwrap(), Provisioned::Installed);
        assert!(db.exists().await.unwrap());
        let design = db.get("_design/backbone").await.unwrap();
        assert!(defines_view(&design.body, "collection"));

        assert_eq!(ensure_store(&db, &config).await.unwrap(), Provisioned::Existing);
        assert_eq!(db.doc_count(), 1);
    }

    #[tokio::test]
    async fn test_installed_view_answers_queries() {
        let db = InMemoryDatabase::new();
        let config = SyncConfig::default();
        ensure_store(&db, &config).await.unwrap();

        db.save("widgets/1", None, json!({"name": "a"}).as_object().unwrap())
            .await
            .unwrap();
        db.save("widgets/2", None, json!({"isDeleted": true}).as_object().unwrap())
            .await
            .unwrap();
        db.save("gadgets/1", None, &Map::new()).await.unwrap();

        let rows = db.view("_design/backbone", "collection", "widgets").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "widgets/1");

        let rows = db.view("_design/backbone", "collection", "empty").await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_install_surfaces_create_failure() {
        let db = InMemoryDatabase::existing();
        let err = install(&db, &SyncConfig::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::Backend { operation: "install", .. }));
    }
}
