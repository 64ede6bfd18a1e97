//! # Graph-ΔSync Core
//!
//! Delta model, causal clocks, and conflict resolution for Graph-ΔSync.
//!
//! This crate provides:
//! - Vector clocks for causal ordering between sources
//! - The graph delta model (node/edge operations with explicit parents)
//! - Field-level merge and operational transform of concurrent operations
//! - A conflict resolver with dependency-gated, idempotent application

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod applied;
pub mod clock;
pub mod conflict;
pub mod delta;
pub mod merge;
pub mod transform;

pub use applied::AppliedLog;
pub use clock::{now_ms, CausalOrder, VectorClock, VectorClockManager};
pub use conflict::{
    ApplyOutcome, ApplyStatus, Conflict, ConflictError, ConflictKind, ConflictResolver, Resolution,
    ResolverConfig, ResolverStats,
};
pub use delta::{canonical_json, DeltaError, DeltaOperation, GraphDelta, OperationKind, TargetKind, TargetRef};
pub use merge::{FieldPath, ResolutionStrategy};
pub use transform::{transform, transform_delta, TransformError};
