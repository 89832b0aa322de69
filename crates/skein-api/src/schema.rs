//! Entity type descriptors and the schema registry.
//!
//! A descriptor declares the flat collection an entity type lives in and the
//! child relations it owns. The registry is loaded once at startup and read
//! everywhere; looking up an unknown type yields `None`, which callers treat
//! as "this type has no declared children".

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How many children a relation owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    Many,
}

/// A child relation on a parent entity type.
///
/// `child_type` defaults to `key` when absent, matching schema documents
/// where the field name and the child type coincide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub key: String,
    #[serde(rename = "type")]
    pub cardinality: Cardinality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_type: Option<String>,
}

impl Relation {
    pub fn many(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            cardinality: Cardinality::Many,
            child_type: None,
        }
    }

    pub fn one(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            cardinality: Cardinality::One,
            child_type: None,
        }
    }

    /// The entity type the relation points at.
    pub fn child_type(&self) -> &str {
        self.child_type.as_deref().unwrap_or(&self.key)
    }
}

/// Schema metadata for one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Collection name the type's records are stored under.
    pub name: String,
    /// Declared child relations, in ownership order.
    #[serde(default)]
    pub dependencies: Vec<Relation>,
}

/// Read-only map from entity type name to its descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaRegistry {
    types: HashMap<String, Descriptor>,
}

impl SchemaRegistry {
    pub fn new(types: HashMap<String, Descriptor>) -> Self {
        Self { types }
    }

    /// Parse a registry from a schema-tree JSON document.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn descriptor(&self, ty: &str) -> Option<&Descriptor> {
        self.types.get(ty)
    }

    pub fn collection_name(&self, ty: &str) -> Option<&str> {
        self.types.get(ty).map(|d| d.name.as_str())
    }

    /// The device-tree schema: networks own devices, devices own values,
    /// values own states; users, states and acl/permission stand alone.
    pub fn device_tree() -> Self {
        fn entry(name: &str, dependencies: Vec<Relation>) -> Descriptor {
            Descriptor {
                name: name.to_string(),
                dependencies,
            }
        }

        let mut types = HashMap::new();
        types.insert("user".to_string(), entry("users", vec![]));
        types.insert("state".to_string(), entry("states", vec![]));
        types.insert("value".to_string(), entry("values", vec![Relation::many("state")]));
        types.insert("device".to_string(), entry("devices", vec![Relation::many("value")]));
        types.insert("network".to_string(), entry("networks", vec![Relation::many("device")]));
        types.insert("permission".to_string(), entry("permission", vec![]));
        types.insert("acl".to_string(), entry("acl", vec![Relation::many("permission")]));
        Self::new(types)
    }
}
