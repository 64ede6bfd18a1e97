//! # Graph-ΔSync Engine
//!
//! Runtime components for replicating graph deltas between sources.
//!
//! This crate provides:
//! - Bloom-filtered duplicate suppression and per-source ordered delivery
//! - Prioritized batching with in-batch conflict resolution
//! - Baseline diff, minified and binary payload compression
//! - A durable offline queue with acknowledged delivery and bounded retries
//! - A [`SyncEngine`] tying them to a [`Transport`]

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batcher;
pub mod compression;
pub mod dedup;
pub mod engine;
pub mod filter;
pub mod queue;
pub mod store;
pub mod timer;
pub mod transport;

pub use batcher::{AddOutcome, BatchPayload, BatcherConfig, OperationPriorities, UpdateBatch, UpdateBatcher};
pub use compression::{Baseline, CompressionConfig, CompressionError, DeltaCompressor};
pub use dedup::{DedupConfig, DedupEvent, DedupStats, MessageDeduplicator, Receipt, Verdict};
pub use engine::{EngineConfig, EngineError, EngineStats, GraphSink, LocalUpdate, SyncEngine};
pub use filter::{BloomFilter, DuplicateFilter, FilterVerdict, HashRing};
pub use queue::{DeadLetterHandler, OfflineQueueManager, QueueConfig, QueueError, QueueState, SyncReport};
pub use store::{MemoryQueueStore, QueueStore, StoreError};
pub use timer::TimerSet;
pub use transport::{Delivery, MemoryTransport, MessageHandler, Subscription, Transport, TransportError};
