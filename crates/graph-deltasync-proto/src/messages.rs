//! Protocol messages for delta replication.

use graph_deltasync_core::{canonical_json, GraphDelta};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Message type of an ordered message carrying a single delta.
pub const TYPE_DELTA: &str = "delta";
/// Message type of an ordered message carrying a list of deltas.
pub const TYPE_BATCH: &str = "batch";
/// Message type of an ordered message carrying a compressed batch.
pub const TYPE_COMPRESSED: &str = "compressed";
/// Queue record type wrapping an ordered message.
pub const TYPE_ORDERED: &str = "ordered";

/// A per-source sequenced envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedMessage {
    /// Unique message identifier
    pub id: String,
    /// Per-source sequence number, starting at 1
    pub sequence_number: u64,
    /// Creation time in milliseconds since UNIX epoch
    pub timestamp: i64,
    /// Payload type (`delta`, `batch`, `compressed`)
    #[serde(rename = "type")]
    pub message_type: String,
    /// Payload
    pub data: Value,
    /// Content hash over (type, data, sourceId, sequenceNumber)
    pub hash: String,
    /// Producing source
    pub source_id: String,
    /// Whether the receiver must acknowledge delivery
    #[serde(rename = "acknowledgementRequired", default)]
    pub ack_required: bool,
}

impl OrderedMessage {
    /// Create a message with a fresh id and its content hash.
    #[must_use]
    pub fn new(
        source_id: impl Into<String>,
        sequence_number: u64,
        message_type: impl Into<String>,
        data: Value,
        timestamp: i64,
    ) -> Self {
        let source_id = source_id.into();
        let message_type = message_type.into();
        let hash = Self::compute_hash(&message_type, &data, &source_id, sequence_number);
        Self {
            id: Uuid::new_v4().to_string(),
            sequence_number,
            timestamp,
            message_type,
            data,
            hash,
            source_id,
            ack_required: false,
        }
    }

    /// Require an acknowledgement from the receiver.
    #[must_use]
    pub fn with_ack(mut self) -> Self {
        self.ack_required = true;
        self
    }

    /// Structural hash of the identifying content of a message.
    #[must_use]
    pub fn compute_hash(message_type: &str, data: &Value, source_id: &str, sequence_number: u64) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(message_type.as_bytes());
        hasher.update(&[0]);
        hasher.update(canonical_json(data).as_bytes());
        hasher.update(&[0]);
        hasher.update(source_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(&sequence_number.to_be_bytes());
        hasher.finalize().to_hex().to_string()
    }

    /// Whether the carried hash matches the content.
    #[must_use]
    pub fn verify_hash(&self) -> bool {
        self.hash == Self::compute_hash(&self.message_type, &self.data, &self.source_id, self.sequence_number)
    }

    /// Decode the typed payload.
    ///
    /// # Errors
    ///
    /// Returns error if the type is unknown or the data does not match it.
    pub fn payload(&self) -> Result<Payload, MessageError> {
        Payload::decode(&self.message_type, &self.data)
    }
}

/// Typed payload of an ordered message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A single delta
    Delta(GraphDelta),
    /// A list of resolved deltas
    Batch(Vec<GraphDelta>),
    /// A compressed list of deltas
    Compressed(CompressedDelta),
}

impl Payload {
    /// Message type string of this payload.
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Payload::Delta(_) => TYPE_DELTA,
            Payload::Batch(_) => TYPE_BATCH,
            Payload::Compressed(_) => TYPE_COMPRESSED,
        }
    }

    /// Encode as JSON data.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_value(&self) -> Result<Value, MessageError> {
        let value = match self {
            Payload::Delta(delta) => serde_json::to_value(delta),
            Payload::Batch(deltas) => serde_json::to_value(deltas),
            Payload::Compressed(compressed) => serde_json::to_value(compressed),
        };
        value.map_err(|e| MessageError::Serialize(e.to_string()))
    }

    /// Decode from a message type and JSON data.
    ///
    /// # Errors
    ///
    /// Returns error if the type is unknown or the data does not match it.
    pub fn decode(message_type: &str, data: &Value) -> Result<Self, MessageError> {
        let de = |e: serde_json::Error| MessageError::Deserialize(e.to_string());
        match message_type {
            TYPE_DELTA => serde_json::from_value(data.clone()).map(Payload::Delta).map_err(de),
            TYPE_BATCH => serde_json::from_value(data.clone()).map(Payload::Batch).map_err(de),
            TYPE_COMPRESSED => serde_json::from_value(data.clone())
                .map(Payload::Compressed)
                .map_err(de),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

/// Encoding of a compressed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    /// Patch against the last state of the same source
    StructuralDiff,
    /// JSON with shortened field keys
    Minified,
    /// Base64 CBOR
    Binary,
}

/// Compressed payload envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedDelta {
    /// Identifier of the compressed content
    pub id: String,
    /// Compression time in milliseconds since UNIX epoch
    pub timestamp: i64,
    /// Always `true`; lets receivers detect the envelope
    pub compressed: bool,
    /// How `data` is encoded
    pub encoding: Encoding,
    /// Encoded payload
    pub data: String,
    /// Size of the fresh JSON encoding in bytes
    pub original_size: usize,
    /// Size of `data` in bytes
    pub compressed_size: usize,
    /// Checksum of `data`
    pub checksum: String,
}

/// Queued messages of a single type sent together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageGroup {
    /// Shared message type
    pub message_type: String,
    /// Queue records in send order
    pub messages: Vec<QueuedMessage>,
}

impl MessageGroup {
    /// Ids of the grouped messages.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.messages.iter().map(|m| m.id.clone()).collect()
    }
}

/// Batched acknowledgement of delivered messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckBatch {
    /// Source acknowledging delivery
    pub acker_id: String,
    /// Source whose messages are acknowledged
    pub source_id: String,
    /// Acknowledged message ids
    pub ids: Vec<String>,
}

/// Why a full state is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResyncReason {
    /// A gap could not be closed in time
    Gap,
    /// A compressed payload failed its checksum
    ChecksumMismatch,
    /// A diff referenced a baseline the receiver does not hold
    BaselineMismatch,
    /// A payload could not be decoded
    Decode,
    /// Missing messages were skipped after the gap timeout
    Skipped,
}

/// Inclusive range of sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceRange {
    /// First sequence in the range
    pub start: u64,
    /// Last sequence in the range
    pub end: u64,
}

impl SequenceRange {
    /// Range covering `start..=end`.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Range holding one sequence.
    #[must_use]
    pub fn single(sequence: u64) -> Self {
        Self::new(sequence, sequence)
    }

    /// Number of sequences covered.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    /// Always false; a range holds at least one sequence.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `sequence` falls inside the range.
    #[must_use]
    pub fn contains(&self, sequence: u64) -> bool {
        (self.start..=self.end).contains(&sequence)
    }
}

/// Request for retransmission or full state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncRequest {
    /// Source asking for state
    pub requester_id: String,
    /// Source whose stream is affected
    pub source_id: String,
    /// Missing sequence ranges, if known
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<SequenceRange>,
    /// Trigger
    pub reason: ResyncReason,
}

/// Optional bookkeeping of a queue record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetadata {
    /// Earliest time of the next send attempt (ms since epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<i64>,
    /// Last failure reported for this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// The record stays queued until the receiver acknowledges it
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ack_required: bool,
    /// Time of the last accepted send (ms since epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<i64>,
}

/// Persisted queue record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    /// Message identifier
    pub id: String,
    /// Message type
    #[serde(rename = "type")]
    pub message_type: String,
    /// Payload
    pub data: Value,
    /// Enqueue time in milliseconds since UNIX epoch
    pub timestamp: i64,
    /// Failed send attempts so far
    pub retry_count: u32,
    /// Higher is sent first
    pub priority: u8,
    /// Backoff and failure bookkeeping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<QueueMetadata>,
}

impl QueuedMessage {
    /// Create a queue record.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        message_type: impl Into<String>,
        data: Value,
        priority: u8,
        timestamp: i64,
    ) -> Self {
        Self {
            id: id.into(),
            message_type: message_type.into(),
            data,
            timestamp,
            retry_count: 0,
            priority,
            metadata: None,
        }
    }

    /// Wrap an ordered message for the offline queue.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn from_ordered(message: &OrderedMessage, priority: u8) -> Result<Self, MessageError> {
        let data = serde_json::to_value(message).map_err(|e| MessageError::Serialize(e.to_string()))?;
        let mut record = Self::new(message.id.clone(), TYPE_ORDERED, data, priority, message.timestamp);
        if message.ack_required {
            record.metadata = Some(QueueMetadata {
                ack_required: true,
                ..QueueMetadata::default()
            });
        }
        Ok(record)
    }

    /// Whether the record waits for an acknowledgement after sending.
    #[must_use]
    pub fn ack_required(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.ack_required)
    }

    /// Whether the record was sent and is waiting for its acknowledgement.
    #[must_use]
    pub fn in_flight(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.sent_at.is_some())
    }

    /// Record an accepted send; the record is retried at `ack_deadline`
    /// unless acknowledged first.
    pub fn mark_sent(&mut self, sent_at: i64, ack_deadline: i64) {
        let metadata = self.metadata.get_or_insert_with(QueueMetadata::default);
        metadata.sent_at = Some(sent_at);
        metadata.next_attempt_at = Some(ack_deadline);
    }

    /// Unwrap an ordered message.
    ///
    /// # Errors
    ///
    /// Returns error if this record does not carry an ordered message.
    pub fn to_ordered(&self) -> Result<OrderedMessage, MessageError> {
        if self.message_type != TYPE_ORDERED {
            return Err(MessageError::UnknownType(self.message_type.clone()));
        }
        serde_json::from_value(self.data.clone()).map_err(|e| MessageError::Deserialize(e.to_string()))
    }

    /// Earliest time this record may be sent.
    #[must_use]
    pub fn next_attempt_at(&self) -> i64 {
        self.metadata
            .as_ref()
            .and_then(|m| m.next_attempt_at)
            .unwrap_or(self.timestamp)
    }

    /// Whether the record may be sent at `now_ms`.
    #[must_use]
    pub fn is_ready(&self, now_ms: i64) -> bool {
        self.next_attempt_at() <= now_ms
    }

    /// Record a failed attempt and schedule the next one.
    pub fn record_failure(&mut self, error: impl Into<String>, next_attempt_at: i64) {
        self.retry_count += 1;
        let metadata = self.metadata.get_or_insert_with(QueueMetadata::default);
        metadata.sent_at = None;
        metadata.next_attempt_at = Some(next_attempt_at);
        metadata.last_error = Some(error.into());
    }
}

/// Everything that travels over a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WireMessage {
    /// A single sequenced message
    Ordered(OrderedMessage),
    /// Queue records of one type
    Group(MessageGroup),
    /// Batched acknowledgement
    Ack(AckBatch),
    /// Request for full state
    Resync(ResyncRequest),
}

impl WireMessage {
    /// Short name of the variant, used for logging and routing.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Ordered(_) => "ordered",
            WireMessage::Group(_) => "group",
            WireMessage::Ack(_) => "ack",
            WireMessage::Resync(_) => "resync",
        }
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }

    /// Deserialize from JSON.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        serde_json::from_str(json).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// Payload type not understood
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use graph_deltasync_core::{DeltaOperation, TargetKind};
    use serde_json::json;

    fn sample_delta() -> GraphDelta {
        GraphDelta::new("d1", "server", 1_704_067_200_000)
            .with_operation(DeltaOperation::update(TargetKind::Node, "n1", json!({"label": "A"})))
    }

    #[test]
    fn ordered_envelope_field_names() {
        let msg = OrderedMessage::new("tab-1", 7, TYPE_DELTA, json!({"x": 1}), 42).with_ack();
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["sequenceNumber"], 7);
        assert_eq!(value["type"], "delta");
        assert_eq!(value["sourceId"], "tab-1");
        assert_eq!(value["acknowledgementRequired"], true);
    }

    #[test]
    fn hash_is_structural() {
        let a = OrderedMessage::new("s", 1, TYPE_DELTA, json!({"a": 1, "b": 2}), 0);
        let b = OrderedMessage::new("s", 1, TYPE_DELTA, serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap(), 99);
        let c = OrderedMessage::new("s", 2, TYPE_DELTA, json!({"a": 1, "b": 2}), 0);

        assert_ne!(a.id, b.id);
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
        assert!(a.verify_hash());

        let mut tampered = a.clone();
        tampered.data = json!({"a": 2});
        assert!(!tampered.verify_hash());
    }

    #[test]
    fn payload_decodes_by_type() {
        let delta = sample_delta();
        let payload = Payload::Batch(vec![delta.clone()]);
        let msg = OrderedMessage::new("server", 1, payload.message_type(), payload.to_value().unwrap(), 0);

        assert_eq!(msg.payload().unwrap(), Payload::Batch(vec![delta]));
        assert!(matches!(
            Payload::decode("snapshot", &json!({})),
            Err(MessageError::UnknownType(_))
        ));
    }

    #[test]
    fn wire_message_cbor_roundtrip() {
        let ordered = OrderedMessage::new("server", 3, TYPE_DELTA, serde_json::to_value(sample_delta()).unwrap(), 5);
        let queued = QueuedMessage::from_ordered(&ordered, 2).unwrap();
        let wire = WireMessage::Group(MessageGroup {
            message_type: TYPE_ORDERED.to_string(),
            messages: vec![queued],
        });

        let bytes = wire.to_cbor().unwrap();
        let decoded = WireMessage::from_cbor(&bytes).unwrap();
        assert_eq!(decoded, wire);

        let WireMessage::Group(group) = decoded else {
            panic!("expected group");
        };
        assert_eq!(group.ids(), vec![ordered.id.clone()]);
        assert_eq!(group.messages[0].to_ordered().unwrap(), ordered);
    }

    #[test]
    fn wire_message_json_is_tagged() {
        let wire = WireMessage::Resync(ResyncRequest {
            requester_id: "tab".to_string(),
            source_id: "server".to_string(),
            missing: vec![SequenceRange::single(3), SequenceRange::new(7, 9)],
            reason: ResyncReason::ChecksumMismatch,
        });
        let json = wire.to_json().unwrap();
        assert!(json.contains(r#""kind":"resync""#));
        assert!(json.contains(r#""missing":[{"start":3,"end":3},{"start":7,"end":9}]"#));
        assert!(json.contains(r#""reason":"checksum-mismatch""#));
        assert_eq!(WireMessage::from_json(&json).unwrap(), wire);
        assert_eq!(wire.kind(), "resync");
    }

    #[test]
    fn queue_record_backoff() {
        let mut record = QueuedMessage::new("m1", TYPE_ORDERED, json!({}), 1, 100);
        assert!(record.is_ready(100));

        record.record_failure("timeout", 1_100);
        assert_eq!(record.retry_count, 1);
        assert!(!record.is_ready(500));
        assert!(record.is_ready(1_100));

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["retryCount"], 1);
        assert_eq!(value["metadata"]["nextAttemptAt"], 1_100);
        assert_eq!(value["metadata"]["lastError"], "timeout");
        assert!(value["metadata"].get("ackRequired").is_none());
    }

    #[test]
    fn ordered_records_wait_for_acknowledgement() {
        let ordered = OrderedMessage::new("server", 1, TYPE_DELTA, json!({}), 100).with_ack();
        let mut record = QueuedMessage::from_ordered(&ordered, 2).unwrap();
        assert!(record.ack_required());
        assert!(!record.in_flight());

        record.mark_sent(100, 10_100);
        assert!(record.in_flight());
        assert!(!record.is_ready(5_000));
        assert!(record.is_ready(10_100));

        record.record_failure("acknowledgement timed out", 11_000);
        assert!(!record.in_flight());
        assert!(record.ack_required());

        let plain = OrderedMessage::new("server", 2, TYPE_DELTA, json!({}), 100);
        assert!(!QueuedMessage::from_ordered(&plain, 2).unwrap().ack_required());
    }

    #[test]
    fn sequence_ranges_are_inclusive() {
        let range = SequenceRange::new(4, 6);
        assert_eq!(range.len(), 3);
        assert!(range.contains(4) && range.contains(6));
        assert!(!range.contains(7));
        assert_eq!(SequenceRange::single(9).len(), 1);
    }
}
