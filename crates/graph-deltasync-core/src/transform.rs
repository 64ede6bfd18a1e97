//! Operational transform for concurrent graph operations.
//!
//! An operation is transformed against a concurrent operation on the same
//! target so both can apply: anchor paths that do not nest pass through
//! unchanged, nested ones have their data deep-merged with the concurrent
//! write underneath. A remove has no meaningful transform.

use crate::delta::{DeltaOperation, GraphDelta, OperationKind};
use crate::merge::{combine_data, operation_path};

/// Transform `op` so it can be applied after the concurrent `against`.
///
/// # Errors
///
/// Returns [`TransformError::Remove`] when either operation removes the
/// shared target.
pub fn transform(
    op: &DeltaOperation,
    against: &DeltaOperation,
) -> Result<DeltaOperation, TransformError> {
    if op.target != against.target || op.target_id != against.target_id {
        return Ok(op.clone());
    }

    if op.kind == OperationKind::Remove || against.kind == OperationKind::Remove {
        return Err(TransformError::Remove {
            target_id: op.target_id.clone(),
        });
    }

    if !operation_path(op).overlaps(&operation_path(against)) {
        return Ok(op.clone());
    }

    let (path, data) = combine_data(against, op);
    let mut transformed = op.clone();
    transformed.path = path;
    transformed.data = Some(data);
    Ok(transformed)
}

/// Transform every operation of `delta` against all operations of `against`.
///
/// # Errors
///
/// Fails if any pairwise transform fails.
pub fn transform_delta(delta: &GraphDelta, against: &GraphDelta) -> Result<GraphDelta, TransformError> {
    let mut out = delta.clone();
    for op in &mut out.operations {
        for other in &against.operations {
            *op = transform(op, other)?;
        }
    }
    Ok(out)
}

/// Errors from operational transform.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    /// A remove on the shared target makes the transform undefined
    #[error("cannot transform against a remove of {target_id}")]
    Remove {
        /// The removed target
        target_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::TargetKind;
    use serde_json::json;

    #[test]
    fn disjoint_paths_pass_through() {
        let op = DeltaOperation::update(TargetKind::Node, "n", json!({"x": 1})).with_path("pos");
        let other =
            DeltaOperation::update(TargetKind::Node, "n", json!({"color": "red"})).with_path("style");

        assert_eq!(transform(&op, &other).unwrap(), op);
    }

    #[test]
    fn nested_paths_deep_merge() {
        let op = DeltaOperation::update(TargetKind::Node, "n", json!({"width": 2}))
            .with_path("style");
        let other = DeltaOperation::update(TargetKind::Node, "n", json!({"style": {"color": "red"}}));

        let transformed = transform(&op, &other).unwrap();
        assert_eq!(transformed.kind, OperationKind::Update);
        assert_eq!(
            transformed.data,
            Some(json!({"style": {"color": "red", "width": 2}}))
        );
    }

    #[test]
    fn other_targets_untouched() {
        let op = DeltaOperation::update(TargetKind::Edge, "n", json!({"w": 1}));
        let other = DeltaOperation::remove(TargetKind::Node, "n");

        assert_eq!(transform(&op, &other).unwrap(), op);
    }

    #[test]
    fn remove_is_undefined() {
        let op = DeltaOperation::update(TargetKind::Node, "n", json!({"w": 1}));
        let other = DeltaOperation::remove(TargetKind::Node, "n");

        let err = tokio_test::assert_err!(transform(&op, &other));
        assert_eq!(
            err,
            TransformError::Remove {
                target_id: "n".to_string()
            }
        );
        assert!(transform(&other, &op).is_err());
    }

    #[test]
    fn delta_transform_applies_all_ops() {
        let base = GraphDelta::new("a", "s1", 1).with_operation(DeltaOperation::update(
            TargetKind::Node,
            "n",
            json!({"label": "A"}),
        ));
        let later = GraphDelta::new("b", "s2", 2)
            .with_operation(DeltaOperation::update(TargetKind::Node, "n", json!({"size": 4})))
            .with_operation(DeltaOperation::add(TargetKind::Node, "m", json!({})));

        let out = tokio_test::assert_ok!(transform_delta(&later, &base));
        assert_eq!(out.operations[0].data, Some(json!({"label": "A", "size": 4})));
        assert_eq!(out.operations[1], later.operations[1]);
    }
}
