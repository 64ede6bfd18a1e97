//! Graph delta model.
//!
//! A [`GraphDelta`] is an ordered list of node/edge operations produced by one
//! source, with explicit causal parents. Operation kinds and targets are
//! closed enums so every consumer matches them exhaustively.

use crate::clock::VectorClock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// Kind of mutation carried by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Create a node or edge
    Add,
    /// Change fields of an existing node or edge
    Update,
    /// Delete a node or edge
    Remove,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Add => write!(f, "add"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Remove => write!(f, "remove"),
        }
    }
}

/// What an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// A graph node
    Node,
    /// A graph edge
    Edge,
}

/// A fully qualified target: kind plus identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetRef {
    /// Node or edge
    pub kind: TargetKind,
    /// Target identifier
    pub id: String,
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TargetKind::Node => write!(f, "node:{}", self.id),
            TargetKind::Edge => write!(f, "edge:{}", self.id),
        }
    }
}

/// A single mutation inside a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaOperation {
    /// Mutation kind
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// Node or edge
    pub target: TargetKind,
    /// Identifier of the node or edge
    pub target_id: String,
    /// Field values (JSON object for add/update)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Dot-separated field path the data applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Causal snapshot at the time the operation was made
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<VectorClock>,
}

impl DeltaOperation {
    fn new(kind: OperationKind, target: TargetKind, target_id: impl Into<String>) -> Self {
        Self {
            kind,
            target,
            target_id: target_id.into(),
            data: None,
            path: None,
            vector: None,
        }
    }

    /// An add operation carrying initial data.
    #[must_use]
    pub fn add(target: TargetKind, target_id: impl Into<String>, data: Value) -> Self {
        Self::new(OperationKind::Add, target, target_id).with_data(data)
    }

    /// An update operation carrying changed fields.
    #[must_use]
    pub fn update(target: TargetKind, target_id: impl Into<String>, data: Value) -> Self {
        Self::new(OperationKind::Update, target, target_id).with_data(data)
    }

    /// A remove operation.
    #[must_use]
    pub fn remove(target: TargetKind, target_id: impl Into<String>) -> Self {
        Self::new(OperationKind::Remove, target, target_id)
    }

    /// Attach data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach a field path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attach a vector clock snapshot.
    #[must_use]
    pub fn with_vector(mut self, vector: VectorClock) -> Self {
        self.vector = Some(vector);
        self
    }

    /// The node or edge this operation touches.
    #[must_use]
    pub fn target_ref(&self) -> TargetRef {
        TargetRef {
            kind: self.target,
            id: self.target_id.clone(),
        }
    }
}

/// An ordered set of graph mutations from a single source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDelta {
    /// Unique delta identifier
    pub id: String,
    /// Creation time in milliseconds since UNIX epoch
    pub timestamp: i64,
    /// Operations in application order
    pub operations: Vec<DeltaOperation>,
    /// Schema/model version of the producer
    pub version: String,
    /// Producing source
    pub source_id: String,
    /// Ids of deltas that must be applied first
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Ids folded into this delta by a merge
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<String>,
}

impl GraphDelta {
    /// Create an empty delta.
    #[must_use]
    pub fn new(id: impl Into<String>, source_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: id.into(),
            timestamp,
            operations: Vec::new(),
            version: "1".to_string(),
            source_id: source_id.into(),
            dependencies: Vec::new(),
            merged_from: Vec::new(),
        }
    }

    /// Create an empty delta with a fresh random id.
    #[must_use]
    pub fn generate(source_id: impl Into<String>, timestamp: i64) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), source_id, timestamp)
    }

    /// Append an operation.
    #[must_use]
    pub fn with_operation(mut self, op: DeltaOperation) -> Self {
        self.operations.push(op);
        self
    }

    /// Declare a causal parent.
    #[must_use]
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Whether `id` is a declared parent of this delta.
    #[must_use]
    pub fn depends_on(&self, id: &str) -> bool {
        self.dependencies.iter().any(|d| d == id)
    }

    /// All ids this delta stands for once applied (itself plus merged ids).
    pub fn covered_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.id.as_str()).chain(self.merged_from.iter().map(String::as_str))
    }

    /// Distinct targets touched by the delta.
    #[must_use]
    pub fn targets(&self) -> BTreeSet<TargetRef> {
        self.operations.iter().map(DeltaOperation::target_ref).collect()
    }

    /// Merge of the vector snapshots carried by the operations.
    #[must_use]
    pub fn clock(&self) -> VectorClock {
        let mut clock = VectorClock::new();
        for vector in self.operations.iter().filter_map(|op| op.vector.as_ref()) {
            clock.merge(vector);
        }
        clock
    }

    /// Structural hash of the canonicalized operation list.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let ops = serde_json::to_value(&self.operations).unwrap_or(Value::Null);
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.source_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(canonical_json(&ops).as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    /// Parse from the JSON envelope.
    ///
    /// # Errors
    ///
    /// Returns error if the JSON does not describe a delta.
    pub fn from_json(json: &str) -> Result<Self, DeltaError> {
        serde_json::from_str(json).map_err(|e| DeltaError::Decode(e.to_string()))
    }

    /// Serialize to the JSON envelope.
    ///
    /// # Errors
    ///
    /// Returns error if a data value cannot be serialized.
    pub fn to_json(&self) -> Result<String, DeltaError> {
        serde_json::to_string(self).map_err(|e| DeltaError::Encode(e.to_string()))
    }
}

/// Serialize a JSON value with object keys sorted at every level.
///
/// Used wherever a hash must not depend on map iteration order.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Errors for delta encoding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeltaError {
    /// Serialization failed
    #[error("delta encode error: {0}")]
    Encode(String),
    /// Deserialization failed
    #[error("delta decode error: {0}")]
    Decode(String),
}
