//! Normalized entity store.
//!
//! Nested documents are flattened into per-type collections keyed by id;
//! child fields keep only id references after normalization. Merges are
//! shallow per record (new fields overwrite, absent fields survive), and
//! removal cascades through the schema's declared child relations.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use skein_api::{Cardinality, Relation, SchemaRegistry, SyncError};

/// Nesting levels tolerated while flattening a document. The schema graph is
/// acyclic in practice, but the input is not trusted to prove it.
const MAX_NESTING: usize = 64;

pub type Record = Map<String, Value>;

/// Which part of the store a merge or removal addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeScope {
    Global,
    Parent { ty: String, id: String },
}

/// Structured merge strategy: scope plus reset flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePolicy {
    pub scope: MergeScope,
    pub reset: bool,
}

impl MergePolicy {
    /// Non-destructive global merge.
    pub fn merge() -> Self {
        Self {
            scope: MergeScope::Global,
            reset: false,
        }
    }

    pub fn scoped(ty: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            scope: MergeScope::Parent {
                ty: ty.into(),
                id: id.into(),
            },
            reset: false,
        }
    }

    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }
}

/// Value of a parent's child field after a child operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildLink {
    Many(Vec<String>),
    One(Option<String>),
}

/// The flat, id-indexed cache of all known entities.
#[derive(Debug, Clone)]
pub struct EntityStore {
    registry: Arc<SchemaRegistry>,
    collections: HashMap<String, HashMap<String, Record>>,
}

impl EntityStore {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            collections: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// All records of a type, by its collection name. Empty when the
    /// collection was never created.
    pub fn collection(&self, ty: &str) -> Option<&HashMap<String, Record>> {
        self.collections.get(self.collection_name(ty))
    }

    pub fn get(&self, ty: &str, id: &str) -> Option<&Record> {
        self.collection(ty)?.get(id)
    }

    pub fn contains(&self, ty: &str, id: &str) -> bool {
        self.get(ty, id).is_some()
    }

    /// Current value of a record's child field, if cached.
    pub fn child_field(&self, ty: &str, id: &str, key: &str) -> Option<Value> {
        self.get(ty, id)?.get(key).cloned()
    }

    /// Merge one document; returns the id of the top-level record.
    pub fn merge_one(&mut self, ty: &str, doc: &Value) -> Result<String, SyncError> {
        let obj = doc
            .as_object()
            .ok_or_else(|| SyncError::malformed(format!("{ty} document is not an object")))?;
        self.normalize(ty, obj.clone(), 0)
    }

    /// Merge a sequence of documents; input order drives iteration only.
    pub fn merge_many(&mut self, ty: &str, docs: &[Value]) -> Result<Vec<String>, SyncError> {
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(self.merge_one(ty, doc)?);
        }
        Ok(ids)
    }

    /// Remove a record and everything it owns. Absent records are a no-op.
    pub fn remove_one(&mut self, ty: &str, id: &str) {
        let registry = Arc::clone(&self.registry);
        let mut worklist: Vec<(String, String)> = vec![(ty.to_string(), id.to_string())];

        while let Some((ty, id)) = worklist.pop() {
            let name = self.collection_name(&ty).to_string();
            let Some(record) = self
                .collections
                .get_mut(&name)
                .and_then(|collection| collection.remove(&id))
            else {
                continue;
            };

            let Some(descriptor) = registry.descriptor(&ty) else {
                continue;
            };
            for relation in &descriptor.dependencies {
                let child_ty = relation.child_type().to_string();
                let owned: Vec<String> = match record.get(&relation.key) {
                    Some(Value::Array(ids)) => ids.iter().filter_map(value_to_id).collect(),
                    Some(Value::String(id)) => vec![id.clone()],
                    Some(Value::Null) | None => {
                        // Field never cached: fall back to every known id of
                        // the child collection.
                        self.collection(&child_ty)
                            .map(|c| c.keys().cloned().collect())
                            .unwrap_or_default()
                    }
                    Some(_) => Vec::new(),
                };
                worklist.extend(owned.into_iter().map(|cid| (child_ty.clone(), cid)));
            }
        }
    }

    /// Remove the listed ids, or the whole collection (with cascade) when
    /// `ids` is `None`: the reset behavior.
    pub fn remove_many(&mut self, ty: &str, ids: Option<&[String]>) {
        let ids: Vec<String> = match ids {
            Some(ids) => ids.to_vec(),
            None => self
                .collection(ty)
                .map(|c| c.keys().cloned().collect())
                .unwrap_or_default(),
        };
        for id in ids {
            self.remove_one(ty, &id);
        }
    }

    /// Merge `data` into a parent's child relation.
    ///
    /// The child data is merged into its own collection regardless; the
    /// parent's field is only rewritten when the parent record exists, and
    /// the returned link is `None` otherwise. An unknown `child_key` is a
    /// full no-op.
    pub fn merge_child(
        &mut self,
        parent_ty: &str,
        parent_id: &str,
        child_key: &str,
        data: &Value,
        reset: bool,
    ) -> Result<Option<ChildLink>, SyncError> {
        let Some(relation) = self.relation(parent_ty, child_key) else {
            debug!(parent_ty, child_key, "no declared relation; skipping child merge");
            return Ok(None);
        };
        let child_ty = relation.child_type().to_string();

        let link = match relation.cardinality {
            Cardinality::Many => {
                let docs = as_documents(data);
                let fresh = self.merge_many(&child_ty, &docs)?;
                if !self.contains(parent_ty, parent_id) {
                    return Ok(None);
                }
                let merged = if reset {
                    fresh
                } else {
                    merge_unique(self.field_ids(parent_ty, parent_id, child_key), fresh)
                };
                self.set_child_field(
                    parent_ty,
                    parent_id,
                    child_key,
                    Value::Array(merged.iter().cloned().map(Value::String).collect()),
                );
                ChildLink::Many(merged)
            }
            Cardinality::One => {
                let doc = match data {
                    Value::Array(items) if items.len() == 1 => &items[0],
                    other => other,
                };
                let id = self.merge_one(&child_ty, doc)?;
                if !self.contains(parent_ty, parent_id) {
                    return Ok(None);
                }
                self.set_child_field(parent_ty, parent_id, child_key, Value::String(id.clone()));
                ChildLink::One(Some(id))
            }
        };
        Ok(Some(link))
    }

    /// Remove child ids from a parent's relation and rewrite the field to
    /// the remaining set. With `ids = None`, exactly the ids currently
    /// listed on the parent's field are removed.
    pub fn remove_child(
        &mut self,
        parent_ty: &str,
        parent_id: &str,
        child_key: &str,
        ids: Option<&[String]>,
    ) -> Option<ChildLink> {
        let relation = self.relation(parent_ty, child_key)?;
        let child_ty = relation.child_type().to_string();

        let listed = ids
            .map(<[String]>::to_vec)
            .unwrap_or_else(|| self.field_ids(parent_ty, parent_id, child_key));
        self.remove_many(&child_ty, Some(&listed));

        let link = match relation.cardinality {
            Cardinality::Many => {
                let remaining = if ids.is_some() {
                    self.field_ids(parent_ty, parent_id, child_key)
                        .into_iter()
                        .filter(|id| !listed.contains(id))
                        .collect()
                } else {
                    Vec::new()
                };
                let field = Value::Array(remaining.iter().cloned().map(Value::String).collect());
                self.set_child_field(parent_ty, parent_id, child_key, field);
                ChildLink::Many(remaining)
            }
            Cardinality::One => {
                self.set_child_field(parent_ty, parent_id, child_key, Value::Null);
                ChildLink::One(None)
            }
        };
        Some(link)
    }

    /// Merge `data` under a structured policy: bare objects are treated as a
    /// one-element collection; `reset` removes the previous scope content
    /// first; a parent scope routes through the child operations.
    pub fn apply(&mut self, ty: &str, data: &Value, policy: &MergePolicy) -> Result<(), SyncError> {
        match &policy.scope {
            MergeScope::Parent { ty: parent_ty, id: parent_id } => {
                let parent_ty = parent_ty.clone();
                let parent_id = parent_id.clone();
                if policy.reset {
                    self.remove_child(&parent_ty, &parent_id, ty, None);
                }
                self.merge_child(&parent_ty, &parent_id, ty, data, policy.reset)?;
            }
            MergeScope::Global => {
                if policy.reset {
                    self.remove_many(ty, None);
                }
                let docs = as_documents(data);
                self.merge_many(ty, &docs)?;
            }
        }
        Ok(())
    }

    /// Remove ids under a scope; `None` clears everything the scope lists.
    pub fn apply_remove(&mut self, ty: &str, ids: Option<&[String]>, scope: &MergeScope) {
        match scope {
            MergeScope::Parent { ty: parent_ty, id: parent_id } => {
                let parent_ty = parent_ty.clone();
                let parent_id = parent_id.clone();
                self.remove_child(&parent_ty, &parent_id, ty, ids);
            }
            MergeScope::Global => self.remove_many(ty, ids),
        }
    }

    fn normalize(&mut self, ty: &str, mut obj: Record, depth: usize) -> Result<String, SyncError> {
        if depth > MAX_NESTING {
            return Err(SyncError::DepthLimit);
        }
        let id = record_id(&obj)
            .ok_or_else(|| SyncError::malformed(format!("{ty} document carries no id")))?;

        let relations: Vec<Relation> = self
            .registry
            .descriptor(ty)
            .map(|d| d.dependencies.clone())
            .unwrap_or_default();

        for relation in &relations {
            let Some(value) = obj.remove(&relation.key) else {
                continue;
            };
            let flattened = match relation.cardinality {
                Cardinality::Many => {
                    let items = match value {
                        Value::Array(items) => items,
                        other => vec![other],
                    };
                    let mut ids = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            Value::Object(child) => {
                                ids.push(self.normalize(relation.child_type(), child, depth + 1)?);
                            }
                            other => {
                                // Already a reference; keep it.
                                if let Some(id) = value_to_id(&other) {
                                    ids.push(id);
                                }
                            }
                        }
                    }
                    Value::Array(ids.into_iter().map(Value::String).collect())
                }
                Cardinality::One => match value {
                    Value::Object(child) => {
                        Value::String(self.normalize(relation.child_type(), child, depth + 1)?)
                    }
                    other => other,
                },
            };
            obj.insert(relation.key.clone(), flattened);
        }

        let name = self.collection_name(ty).to_string();
        let slot = self
            .collections
            .entry(name)
            .or_default()
            .entry(id.clone())
            .or_default();
        for (key, value) in obj {
            slot.insert(key, value);
        }
        Ok(id)
    }

    /// Collection name for a type; types without a descriptor use their own
    /// name as the collection.
    fn collection_name<'a>(&'a self, ty: &'a str) -> &'a str {
        self.registry.collection_name(ty).unwrap_or(ty)
    }

    fn relation(&self, parent_ty: &str, child_key: &str) -> Option<Relation> {
        self.registry
            .descriptor(parent_ty)?
            .dependencies
            .iter()
            .find(|r| r.key == child_key)
            .cloned()
    }

    /// Ids currently listed on a parent's child field.
    fn field_ids(&self, ty: &str, id: &str, key: &str) -> Vec<String> {
        match self.get(ty, id).and_then(|record| record.get(key)) {
            Some(Value::Array(ids)) => ids.iter().filter_map(value_to_id).collect(),
            Some(Value::String(id)) => vec![id.clone()],
            _ => Vec::new(),
        }
    }

    fn set_child_field(&mut self, ty: &str, id: &str, key: &str, value: Value) {
        let name = self.collection_name(ty).to_string();
        if let Some(record) = self
            .collections
            .get_mut(&name)
            .and_then(|collection| collection.get_mut(id))
        {
            record.insert(key.to_string(), value);
        }
    }
}

/// Id of a document: `meta.id`, falling back to a top-level `id`.
fn record_id(doc: &Record) -> Option<String> {
    doc.get("meta")
        .and_then(|meta| meta.get("id"))
        .or_else(|| doc.get("id"))
        .and_then(value_to_id)
}

/// An id reference on the wire: a string, or a number stringified the same
/// way merges stringify numeric ids.
pub(crate) fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A bare object is a one-element collection.
fn as_documents(data: &Value) -> Vec<Value> {
    match data {
        Value::Array(items) => items.clone(),
        Value::Object(_) => vec![data.clone()],
        _ => Vec::new(),
    }
}

/// Union preserving existing order, new ids appended, duplicate-safe.
fn merge_unique(existing: Vec<String>, fresh: Vec<String>) -> Vec<String> {
    let mut merged = existing;
    for id in fresh {
        if !merged.contains(&id) {
            merged.push(id);
        }
    }
    merged
}
