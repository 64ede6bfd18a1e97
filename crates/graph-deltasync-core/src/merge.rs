//! Field-level merge semantics for graph operations.
//!
//! Defines how concurrent operations on the same node or edge are combined.
//!
//! # Resolution Strategies
//!
//! | Strategy | Behavior |
//! |----------|----------|
//! | LastWriterWins | later timestamp wins (source id tiebreaker) |
//! | FirstWriterWins | earlier timestamp wins |
//! | Merge | disjoint fields deep-merged, else LWW |
//! | OperationalTransform | later ops transformed against earlier, else Merge |
//! | UserIntervention | conflict deferred to the caller |

use crate::delta::DeltaOperation;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

/// How the resolver settles a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    /// Later timestamp wins entirely
    #[default]
    LastWriterWins,
    /// Earlier timestamp wins entirely
    FirstWriterWins,
    /// Combine disjoint fields, falling back to last-writer-wins
    Merge,
    /// Transform operations against each other, falling back to merge
    OperationalTransform,
    /// Defer to the caller
    UserIntervention,
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "lww" | "last-writer-wins" => Ok(Self::LastWriterWins),
            "fww" | "first-writer-wins" => Ok(Self::FirstWriterWins),
            "merge" => Ok(Self::Merge),
            "ot" | "operational-transform" => Ok(Self::OperationalTransform),
            "manual" | "user-intervention" => Ok(Self::UserIntervention),
            other => Err(format!("unknown resolution strategy '{other}'")),
        }
    }
}

/// Dot-separated path to a field of a node or edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldPath {
    /// Path segments from the record root
    pub segments: Vec<String>,
}

impl FieldPath {
    /// The record root (covers every field).
    #[must_use]
    pub fn root() -> Self {
        Self { segments: vec![] }
    }

    /// Append a segment.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Parse from dot notation; the empty string is the root.
    #[must_use]
    pub fn parse(path: &str) -> Self {
        if path.is_empty() {
            return Self::root();
        }
        Self {
            segments: path.split('.').map(str::to_string).collect(),
        }
    }

    /// Whether `self` equals `other` or is an ancestor of it.
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.segments.len() <= other.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// Whether either path contains the other.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

/// The path an operation is anchored at.
#[must_use]
pub fn operation_path(op: &DeltaOperation) -> FieldPath {
    op.path.as_deref().map_or_else(FieldPath::root, FieldPath::parse)
}

/// Leaf field paths written by an operation.
///
/// Object data expands into one path per leaf; scalar or missing data writes
/// the anchor path as a whole.
#[must_use]
pub fn written_paths(op: &DeltaOperation) -> Vec<FieldPath> {
    let base = operation_path(op);
    let mut out = Vec::new();
    match &op.data {
        Some(Value::Object(map)) if !map.is_empty() => collect_leaves(&base, map, &mut out),
        _ => out.push(base),
    }
    out
}

fn collect_leaves(base: &FieldPath, map: &Map<String, Value>, out: &mut Vec<FieldPath>) {
    for (key, value) in map {
        let path = base.child(key.clone());
        match value {
            Value::Object(inner) if !inner.is_empty() => collect_leaves(&path, inner, out),
            _ => out.push(path),
        }
    }
}

/// Whether two operations write overlapping fields.
#[must_use]
pub fn fields_overlap(a: &DeltaOperation, b: &DeltaOperation) -> bool {
    let left = written_paths(a);
    let right = written_paths(b);
    left.iter().any(|l| right.iter().any(|r| l.overlaps(r)))
}

/// Recursively merge `overlay` into `base`.
///
/// Objects merge key by key; any other value in `overlay` replaces `base`.
#[must_use]
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(left), Value::Object(right)) => {
            let mut merged = left.clone();
            for (key, value) in right {
                let combined = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), combined);
            }
            Value::Object(merged)
        }
        (_, other) => other.clone(),
    }
}

/// Operation data re-rooted at the record root by nesting it under its path.
#[must_use]
pub fn rooted_data(op: &DeltaOperation) -> Value {
    let mut value = op.data.clone().unwrap_or(Value::Null);
    for segment in operation_path(op).segments.iter().rev() {
        let mut map = Map::new();
        map.insert(segment.clone(), value);
        value = Value::Object(map);
    }
    value
}

/// Combine the data of two operations on the same target.
///
/// Keeps a shared anchor path when both use the same one; otherwise the
/// result is rooted. `overlay` wins on overlapping scalars.
#[must_use]
pub fn combine_data(base: &DeltaOperation, overlay: &DeltaOperation) -> (Option<String>, Value) {
    if base.path == overlay.path {
        let left = base.data.clone().unwrap_or(Value::Null);
        let right = overlay.data.clone().unwrap_or(Value::Null);
        (base.path.clone(), deep_merge(&left, &right))
    } else {
        (None, deep_merge(&rooted_data(base), &rooted_data(overlay)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::TargetKind;
    use serde_json::json;

    #[test]
    fn strategy_parsing() {
        assert_eq!("merge".parse::<ResolutionStrategy>(), Ok(ResolutionStrategy::Merge));
        assert_eq!("LWW".parse::<ResolutionStrategy>(), Ok(ResolutionStrategy::LastWriterWins));
        assert_eq!(
            "operational_transform".parse::<ResolutionStrategy>(),
            Ok(ResolutionStrategy::OperationalTransform)
        );
        assert!("coin-flip".parse::<ResolutionStrategy>().is_err());
    }

    #[test]
    fn path_prefix_relations() {
        let style = FieldPath::parse("style");
        let color = FieldPath::parse("style.color");
        let label = FieldPath::parse("label");

        assert!(style.is_prefix_of(&color));
        assert!(!color.is_prefix_of(&style));
        assert!(color.overlaps(&style));
        assert!(!label.overlaps(&style));
        assert!(FieldPath::root().overlaps(&label));
        assert_eq!(color.to_string(), "style.color");
    }

    #[test]
    fn written_paths_expand_objects() {
        let op = DeltaOperation::update(
            TargetKind::Node,
            "n",
            json!({"color": "red", "border": {"width": 2}}),
        )
        .with_path("style");

        let mut paths: Vec<String> = written_paths(&op).iter().map(ToString::to_string).collect();
        paths.sort();
        assert_eq!(paths, vec!["style.border.width", "style.color"]);
    }

    #[test]
    fn disjoint_fields_do_not_overlap() {
        let a = DeltaOperation::update(TargetKind::Node, "n", json!({"label": "A"}));
        let b = DeltaOperation::update(TargetKind::Node, "n", json!({"weight": 3}));
        let c = DeltaOperation::update(TargetKind::Node, "n", json!({"label": "C"}));

        assert!(!fields_overlap(&a, &b));
        assert!(fields_overlap(&a, &c));
        assert!(fields_overlap(&a, &DeltaOperation::remove(TargetKind::Node, "n")));
    }

    #[test]
    fn deep_merge_nested() {
        let merged = deep_merge(
            &json!({"style": {"color": "red"}, "label": "x"}),
            &json!({"style": {"width": 1}, "label": "y"}),
        );
        assert_eq!(
            merged,
            json!({"style": {"color": "red", "width": 1}, "label": "y"})
        );
    }

    #[test]
    fn combine_data_roots_different_paths() {
        let a = DeltaOperation::update(TargetKind::Node, "n", json!({"color": "red"}))
            .with_path("style");
        let b = DeltaOperation::update(TargetKind::Node, "n", json!({"label": "L"}));

        let (path, data) = combine_data(&a, &b);
        assert!(path.is_none());
        assert_eq!(data, json!({"style": {"color": "red"}, "label": "L"}));
    }
}
