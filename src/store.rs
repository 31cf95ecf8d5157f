//! # Shared Store
//!
//! The [`Store`] is the only channel nodes use to exchange data: `prep`
//! reads from it, `post` writes to it, and `exec` never touches it. It is a
//! keyed mapping of JSON document values with three extras on top of a plain
//! map:
//!
//! - **Schema**: keys may be bound to a [`TypeTag`]; a write whose value does
//!   not match fails with [`PipeFlowError::TypeKind`] and leaves the store
//!   untouched.
//! - **Observers**: callbacks fired synchronously after each successful
//!   write, in registration order, with `(key, old_value, new_value)`.
//!   Observer failures are logged and never fail the write.
//! - **Snapshots**: the store serialises to a deterministic JSON document
//!   (`{name, schema, data}`) for checkpoint rows and on-disk snapshots, and
//!   reconstructs from either with its schema intact, so type checks keep
//!   working across resumes.

use crate::{BoxError, PipeFlowError, PipeFlowResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Expected value shape for a schema-bound key.
///
/// Tags serialise as `str | int | float | bool | list | mapping | null` in
/// snapshot documents and checkpoint rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeTag {
    Str,
    Int,
    Float,
    Bool,
    List,
    #[serde(rename = "mapping")]
    Map,
    Null,
}

impl TypeTag {
    /// Whether `value` satisfies this tag.
    ///
    /// Booleans are not integers. Integers satisfy `Float` only when
    /// `widening` is on. `List` and `Map` accept any element content.
    pub fn matches(&self, value: &Value, widening: bool) -> bool {
        match self {
            TypeTag::Str => value.is_string(),
            TypeTag::Int => value.is_i64() || value.is_u64(),
            TypeTag::Float => value.is_f64() || (widening && value.is_number()),
            TypeTag::Bool => value.is_boolean(),
            TypeTag::List => value.is_array(),
            TypeTag::Map => value.is_object(),
            TypeTag::Null => value.is_null(),
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            TypeTag::Str => "str",
            TypeTag::Int => "int",
            TypeTag::Float => "float",
            TypeTag::Bool => "bool",
            TypeTag::List => "list",
            TypeTag::Map => "mapping",
            TypeTag::Null => "null",
        };
        f.write_str(tag)
    }
}

/// The tag-style name of a value's runtime type, for error messages.
pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

/// Callback invoked after each successful write with
/// `(key, old_value, new_value)`.
pub type Observer = Arc<dyn Fn(&str, Option<&Value>, &Value) -> Result<(), BoxError> + Send + Sync>;

/// Token returned by [`Store::add_observer`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// On-disk and in-row document shape. BTreeMaps give stable key ordering so
/// snapshots of equal stores are byte-identical.
#[derive(Serialize, Deserialize)]
struct SnapshotDoc {
    name: String,
    schema: BTreeMap<String, TypeTag>,
    data: BTreeMap<String, Value>,
}

/// Typed, observable shared state passed through a flow.
pub struct Store {
    name: String,
    schema: HashMap<String, TypeTag>,
    data: HashMap<String, Value>,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
    numeric_widening: bool,
}

impl Store {
    /// Create an empty store with no schema.
    pub fn new(name: impl Into<String>) -> Self {
        Store {
            name: name.into(),
            schema: HashMap::new(),
            data: HashMap::new(),
            observers: Vec::new(),
            next_observer: 0,
            numeric_widening: false,
        }
    }

    /// Create a store whose listed keys are type-checked on every write.
    pub fn with_schema<K, I>(name: impl Into<String>, schema: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, TypeTag)>,
    {
        let mut store = Store::new(name);
        store.schema = schema.into_iter().map(|(k, t)| (k.into(), t)).collect();
        store
    }

    /// Allow integer values to satisfy `Float` schema entries.
    ///
    /// Off by default: the schema match is strict. Runtime-only; the flag is
    /// not part of snapshots.
    pub fn set_numeric_widening(&mut self, on: bool) {
        self.numeric_widening = on;
    }

    /// The store's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The schema bound at construction or restore time.
    pub fn schema(&self) -> &HashMap<String, TypeTag> {
        &self.schema
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> PipeFlowResult<Value> {
        self.data
            .get(key)
            .cloned()
            .ok_or_else(|| PipeFlowError::MissingKey(key.to_string()))
    }

    /// Get a value and deserialise it into `T`.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> PipeFlowResult<T> {
        let value = self.get(key)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Set a value, type-checking against the schema first.
    ///
    /// On a schema mismatch nothing is assigned and no observer fires.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> PipeFlowResult<()> {
        let key = key.into();
        if let Some(expected) = self.schema.get(&key) {
            if !expected.matches(&value, self.numeric_widening) {
                return Err(PipeFlowError::TypeKind {
                    expected: *expected,
                    actual: value_kind(&value),
                    key,
                });
            }
        }
        let old = self.data.insert(key.clone(), value.clone());
        for (id, observer) in &self.observers {
            if let Err(err) = observer(&key, old.as_ref(), &value) {
                warn!(key = %key, observer = id.0, %err, "store observer failed");
            }
        }
        Ok(())
    }

    /// Serialise `value` and set it under `key`. Schema checks apply to the
    /// serialised form.
    pub fn set_as<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> PipeFlowResult<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value)
    }

    /// Whether a key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// All keys currently present.
    pub fn keys(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Register an observer; it fires after every later successful write.
    pub fn add_observer<F>(&mut self, observer: F) -> ObserverId
    where
        F: Fn(&str, Option<&Value>, &Value) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Arc::new(observer)));
        id
    }

    /// Unregister an observer. Returns whether it was registered.
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    fn to_doc(&self) -> SnapshotDoc {
        SnapshotDoc {
            name: self.name.clone(),
            schema: self.schema.iter().map(|(k, t)| (k.clone(), *t)).collect(),
            data: self.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }

    fn from_doc(doc: SnapshotDoc) -> Self {
        Store {
            name: doc.name,
            schema: doc.schema.into_iter().collect(),
            data: doc.data.into_iter().collect(),
            observers: Vec::new(),
            next_observer: 0,
            numeric_widening: false,
        }
    }

    /// Serialise to the checkpoint document `{name, schema, data}`.
    pub fn to_json(&self) -> PipeFlowResult<String> {
        Ok(serde_json::to_string(&self.to_doc())?)
    }

    /// Reconstruct a store from a checkpoint document, schema included.
    pub fn from_json(json: &str) -> PipeFlowResult<Self> {
        let doc: SnapshotDoc = serde_json::from_str(json)?;
        Ok(Store::from_doc(doc))
    }

    /// Write a snapshot file, creating parent directories as needed.
    ///
    /// The write is atomic: a temp file in the same directory is renamed
    /// into place, so a reader never sees a half-written document.
    pub fn snapshot(&self, path: impl AsRef<Path>) -> PipeFlowResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&self.to_doc())?;
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Reconstruct a store from a snapshot file.
    pub fn restore(path: impl AsRef<Path>) -> PipeFlowResult<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        Store::from_json(&json)
    }
}

impl Clone for Store {
    fn clone(&self) -> Self {
        Store {
            name: self.name.clone(),
            schema: self.schema.clone(),
            data: self.data.clone(),
            observers: self.observers.clone(),
            next_observer: self.next_observer,
            numeric_widening: self.numeric_widening,
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("data", &self.data)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl PartialEq for Store {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.schema == other.schema && self.data == other.data
    }
}
