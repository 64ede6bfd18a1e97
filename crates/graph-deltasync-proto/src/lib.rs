//! # Graph-ΔSync Protocol
//!
//! Wire envelopes and channel naming for delta replication.
//!
//! ## Messages
//!
//! - `OrderedMessage`: per-source sequenced envelope with a content hash
//! - `MessageGroup`: queued messages of one type sent together
//! - `AckBatch`: batched acknowledgement of delivered messages
//! - `ResyncRequest`: request for retransmission after a gap or integrity failure
//!
//! ## Channels
//!
//! Channel scheme: `graph-deltasync/v1/{tenant}/{channel}`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod topics;

pub use messages::{
    AckBatch, CompressedDelta, Encoding, MessageError, MessageGroup, OrderedMessage, Payload,
    QueueMetadata, QueuedMessage, ResyncReason, ResyncRequest, SequenceRange, WireMessage,
};
pub use topics::{Channel, ChannelScheme};
