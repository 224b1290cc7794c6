//! Local entities and collections: the in-memory mirror of stored documents.
//!
//! An `Entity` is a shared handle to an entity's state; the dispatcher and the
//! reconciler both mutate entities in place, so callers holding a handle see
//! writes and remote changes as they land.

use crate::document::{DocId, Document, Revision};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// In-memory state of one entity.
#[derive(Debug)]
struct Model {
    /// Collection that owns the entity
    collection: String,
    /// Assigned on create, never changed afterwards
    id: Option<DocId>,
    /// Revision last confirmed by the database
    rev: Option<Revision>,
    /// Attributes, excluding `_id` and `_rev`
    attributes: Map<String, Value>,
}

/// Shared handle to one entity's state.
#[derive(Debug, Clone)]
pub struct Entity {
    inner: Arc<Mutex<Model>>,
}

impl Entity {
    /// A new, unsaved entity in `collection`.
    pub fn new(collection: impl Into<String>, attributes: Map<String, Value>) -> Self {
        Self::from_model(Model {
            collection: collection.into(),
            id: None,
            rev: None,
            attributes: strip_reserved(attributes),
        })
    }

    /// An entity mirroring a stored document.
    pub fn from_document(doc: Document) -> Result<Self, crate::document::DocIdError> {
        let id = doc.doc_id()?;
        Ok(Self::from_model(Model {
            collection: id.collection().to_string(),
            id: Some(id),
            rev: doc.rev,
            attributes: strip_reserved(doc.body),
        }))
    }

    fn from_model(model: Model) -> Self {
        Self {
            inner: Arc::new(Mutex::new(model)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Model> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn collection(&self) -> String {
        self.lock().collection.clone()
    }

    pub fn id(&self) -> Option<DocId> {
        self.lock().id.clone()
    }

    pub fn rev(&self) -> Option<Revision> {
        self.lock().rev.clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().attributes.get(key).cloned()
    }

    /// Set one attribute. `_id` and `_rev` are managed by sync and ignored here.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if is_reserved(&key) {
            return;
        }
        self.lock().attributes.insert(key, value);
    }

    pub fn attributes(&self) -> Map<String, Value> {
        self.lock().attributes.clone()
    }

    /// Record the id and first revision assigned by a create.
    ///
    /// Returns false (and changes nothing) if the entity already has an id.
    pub(crate) fn assign(&self, id: DocId, rev: Revision) -> bool {
        let mut model = self.lock();
        if model.id.is_some() {
            return false;
        }
        model.id = Some(id);
        model.rev = Some(rev);
        true
    }

    /// Record a newer revision. Older ones are ignored.
    pub(crate) fn set_rev(&self, rev: Revision) {
        let mut model = self.lock();
        if model.rev.as_ref().is_none_or(|current| rev > *current) {
            model.rev = Some(rev);
        }
    }

    /// Replace all attributes and the revision with those of `doc`.
    ///
    /// Attributes missing from `doc` are dropped, so fields removed upstream
    /// disappear locally too. A `doc` without a revision keeps the current one.
    pub(crate) fn replace_with(&self, doc: &Document) {
        let mut model = self.lock();
        model.attributes = strip_reserved(doc.body.clone());
        if let Some(rev) = &doc.rev {
            model.rev = Some(rev.clone());
        }
    }

    /// Attributes plus `_id`, as written to the database.
    pub fn to_json(&self) -> Map<String, Value> {
        let model = self.lock();
        let mut json = model.attributes.clone();
        if let Some(id) = &model.id {
            json.insert("_id".into(), Value::String(id.to_string()));
        }
        json
    }

    /// Whether two handles point at the same entity.
    pub fn ptr_eq(&self, other: &Entity) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn is_reserved(key: &str) -> bool {
    key == "_id" || key == "_rev"
}

fn strip_reserved(mut attributes: Map<String, Value>) -> Map<String, Value> {
    attributes.remove("_id");
    attributes.remove("_rev");
    attributes
}

/// Named, ordered set of entities sharing an id prefix.
#[derive(Debug, Clone)]
pub struct LocalCollection {
    name: String,
    entities: Arc<Mutex<Vec<Entity>>>,
}

impl LocalCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entities: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entity>> {
        self.entities.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create an unsaved entity and add it to this collection.
    pub fn build(&self, attributes: Map<String, Value>) -> Entity {
        let entity = Entity::new(self.name.clone(), attributes);
        self.add(entity.clone());
        entity
    }

    /// Append an entity unless the same handle or id is already present.
    pub fn add(&self, entity: Entity) -> bool {
        let id = entity.id();
        let mut entities = self.lock();
        let duplicate = entities
            .iter()
            .any(|e| e.ptr_eq(&entity) || (id.is_some() && e.id() == id));
        if duplicate {
            return false;
        }
        entities.push(entity);
        true
    }

    pub fn get(&self, id: &DocId) -> Option<Entity> {
        self.lock()
            .iter()
            .find(|e| e.id().as_ref() == Some(id))
            .cloned()
    }

    pub fn remove(&self, id: &DocId) -> Option<Entity> {
        let mut entities = self.lock();
        let index = entities.iter().position(|e| e.id().as_ref() == Some(id))?;
        Some(entities.remove(index))
    }

    /// Add an entity mirroring `doc`.
    pub fn insert_document(&self, doc: Document) -> Option<Entity> {
        let entity = Entity::from_document(doc).ok()?;
        self.add(entity.clone()).then_some(entity)
    }

    /// Make the contents mirror `docs`, in order.
    ///
    /// Entities already present under a document's id are updated in place, so
    /// handles held elsewhere stay attached. Entities with no matching
    /// document, including unsaved ones, are dropped.
    pub fn reset(&self, docs: Vec<Document>) {
        let mut entities = self.lock();
        let mut merged: Vec<Entity> = Vec::with_capacity(docs.len());
        for doc in docs {
            let Ok(id) = doc.doc_id() else {
                continue;
            };
            if merged.iter().any(|e| e.id().as_ref() == Some(&id)) {
                continue;
            }
            match entities.iter().find(|e| e.id().as_ref() == Some(&id)) {
                Some(existing) => {
                    existing.replace_with(&doc);
                    merged.push(existing.clone());
                }
                None => {
                    if let Ok(entity) = Entity::from_document(doc) {
                        merged.push(entity);
                    }
                }
            }
        }
        *entities = merged;
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.lock().clone()
    }

    pub fn first(&self) -> Option<Entity> {
        self.lock().first().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Registry of local collections, looked up by name.
#[derive(Debug, Clone, Default)]
pub struct Collections {
    inner: Arc<RwLock<HashMap<String, LocalCollection>>>,
}

impl Collections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collection, replacing any previous one with the same name.
    pub fn register(&self, collection: LocalCollection) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(collection.name().to_string(), collection);
    }

    pub fn unregister(&self, name: &str) -> Option<LocalCollection> {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    pub fn get(&self, name: &str) -> Option<LocalCollection> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{SyncRequest, SyncTarget, Verb, WriteKind};
    use serde_json::json;

    fn attrs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn doc(id: &str, rev: &str, body: Value) -> Document {
        Document::new(id, Some(rev.parse().unwrap()), attrs(body))
    }

    #[test]
    fn test_entity_ignores_reserved_attributes() {
        let entity = Entity::new("widgets", attrs(json!({"name": "a", "_id": "x", "_rev": "1-a"})));
        assert_eq!(entity.attributes(), attrs(json!({"name": "a"})));

        entity.set("_rev", json!("9-z"));
        assert!(entity.rev().is_none());
    }

    #[test]
    fn test_to_json_includes_id() {
        let entity = Entity::new("widgets", attrs(json!({"name": "a"})));
        assert!(!entity.to_json().contains_key("_id"));

        let id = DocId::new("widgets", "1").unwrap();
        assert!(entity.assign(id, Revision::new(1, "a")));
        assert_eq!(entity.to_json().get("_id"), Some(&json!("widgets/1")));
    }

    #[test]
    fn test_assign_only_once() {
        let entity = Entity::new("widgets", Map::new());
        assert!(entity.assign(DocId::new("widgets", "1").unwrap(), Revision::new(1, "a")));
        assert!(!entity.assign(DocId::new("widgets", "2").unwrap(), Revision::new(1, "b")));
        assert_eq!(entity.id().unwrap().suffix(), "1");
    }

    #[test]
    fn test_replace_with_drops_missing_attributes() {
        let entity = Entity::from_document(doc("widgets/1", "1-a", json!({"name": "a", "extra": 1})))
            .unwrap();

        entity.replace_with(&doc("widgets/1", "2-b", json!({"name": "b"})));

        assert_eq!(entity.attributes(), attrs(json!({"name": "b"})));
        assert_eq!(entity.rev().unwrap().generation(), 2);
    }

    #[test]
    fn test_replace_with_keeps_revision_when_doc_has_none() {
        let entity = Entity::from_document(doc("widgets/1", "2-a", json!({"name": "a"}))).unwrap();

        entity.replace_with(&Document::new("widgets/1", None, attrs(json!({"name": "b"}))));

        assert_eq!(entity.get("name"), Some(json!("b")));
        assert_eq!(entity.rev(), Some(Revision::new(2, "a")));
        // Still resolves as an update, not a second create.
        assert!(matches!(
            SyncRequest::resolve(Verb::Update, SyncTarget::Entity(entity)),
            Ok(SyncRequest::Write { kind: WriteKind::Update, .. })
        ));
    }

    #[test]
    fn test_collection_lookup_and_remove() {
        let collection = LocalCollection::new("widgets");
        collection.insert_document(doc("widgets/1", "1-a", json!({"name": "a"})));
        collection.insert_document(doc("widgets/2", "1-b", json!({"name": "b"})));
        assert_eq!(collection.len(), 2);

        let id = DocId::parse("widgets/1").unwrap();
        assert_eq!(collection.get(&id).unwrap().get("name"), Some(json!("a")));

        assert!(collection.remove(&id).is_some());
        assert!(collection.remove(&id).is_none());
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn test_collection_rejects_duplicates() {
        let collection = LocalCollection::new("widgets");
        assert!(collection.insert_document(doc("widgets/1", "1-a", json!({}))).is_some());
        assert!(collection.insert_document(doc("widgets/1", "1-a", json!({}))).is_none());

        let entity = collection.build(Map::new());
        assert!(!collection.add(entity));
        assert_eq!(collection.len(), 2);
    }

    #[test]
    fn test_reset_replaces_contents() {
        let collection = LocalCollection::new("widgets");
        collection.build(attrs(json!({"name": "unsaved"})));

        collection.reset(vec![
            doc("widgets/1", "3-a", json!({"name": "a"})),
            doc("_design/backbone", "1-a", json!({})),
        ]);

        assert_eq!(collection.len(), 1);
        assert_eq!(collection.first().unwrap().get("name"), Some(json!("a")));
    }

    #[test]
    fn test_reset_keeps_held_handles_attached() {
        let collection = LocalCollection::new("widgets");
        let held = collection
            .insert_document(doc("widgets/1", "1-a", json!({"name": "a", "size": 1})))
            .unwrap();
        collection.insert_document(doc("widgets/2", "1-b", json!({"name": "gone"})));

        collection.reset(vec![
            doc("widgets/3", "1-c", json!({"name": "new"})),
            doc("widgets/1", "2-a", json!({"name": "a2"})),
        ]);

        assert_eq!(collection.len(), 2);
        let id = DocId::parse("widgets/1").unwrap();
        assert!(collection.get(&id).unwrap().ptr_eq(&held));
        assert_eq!(held.attributes(), attrs(json!({"name": "a2"})));
        assert_eq!(held.rev().unwrap().generation(), 2);
        assert!(collection.get(&DocId::parse("widgets/2").unwrap()).is_none());
        assert_eq!(collection.first().unwrap().get("name"), Some(json!("new")));
    }

    #[test]
    fn test_registry() {
        let registry = Collections::new();
        registry.register(LocalCollection::new("widgets"));
        assert!(registry.get("widgets").is_some());
        assert!(registry.get("gadgets").is_none());
        assert!(registry.unregister("widgets").is_some());
        assert!(registry.get("widgets").is_none());
    }
}
