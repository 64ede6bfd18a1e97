//! Delta compression.
//!
//! Payloads are encoded one of three ways:
//!
//! | Encoding | Data |
//! |----------|------|
//! | `structural-diff` | JSON patch against the last state exchanged for the source |
//! | `minified` | JSON with envelope keys shortened |
//! | `binary` | base64 of CBOR |
//!
//! A diff is used only when it is materially smaller than a fresh encoding.
//! Every payload carries a checksum that is verified before decoding.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use graph_deltasync_core::{canonical_json, now_ms, GraphDelta};
use graph_deltasync_proto::{CompressedDelta, Encoding};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Envelope keys and their short forms.
const KEY_MAP: &[(&str, &str)] = &[
    ("id", "k"),
    ("timestamp", "t"),
    ("operations", "o"),
    ("version", "v"),
    ("sourceId", "s"),
    ("dependencies", "d"),
    ("mergedFrom", "m"),
    ("type", "y"),
    ("target", "g"),
    ("targetId", "i"),
    ("data", "a"),
    ("path", "p"),
    ("vector", "c"),
];

/// Keys whose values are user content and never rewritten.
const OPAQUE_KEYS: &[&str] = &["data", "vector"];

/// Compressor configuration.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// A diff is used when `diff_len < diff_ratio * fresh_len`
    pub diff_ratio: f64,
    /// Use CBOR instead of minified JSON for fresh encodings
    pub prefer_binary: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            diff_ratio: 0.5,
            prefer_binary: false,
        }
    }
}

/// Last state exchanged with a source.
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    /// Content id of the state
    pub id: String,
    /// The state itself
    pub value: Value,
}

impl Baseline {
    fn of(value: Value) -> Self {
        Self {
            id: content_id(&value),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum Segment {
    Index(usize),
    Key(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum PatchOp {
    Set {
        path: Vec<Segment>,
        value: Value,
    },
    Remove {
        path: Vec<Segment>,
    },
    Splice {
        path: Vec<Segment>,
        at: usize,
        remove: usize,
        insert: Vec<Value>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct DiffPayload {
    base: String,
    ops: Vec<PatchOp>,
}

/// Encodes and decodes delta payloads against per-source baselines.
///
/// Baselines for sent and received payloads are kept apart so one instance
/// can serve both directions of a stream.
#[derive(Debug, Default)]
pub struct DeltaCompressor {
    config: CompressionConfig,
    sent: HashMap<String, Baseline>,
    received: HashMap<String, Baseline>,
}

impl DeltaCompressor {
    /// Create a compressor.
    #[must_use]
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config,
            sent: HashMap::new(),
            received: HashMap::new(),
        }
    }

    /// Compress a single delta from `delta.source_id`.
    ///
    /// # Errors
    ///
    /// Returns error if the delta cannot be serialized.
    pub fn compress_delta(&mut self, delta: &GraphDelta) -> Result<CompressedDelta, CompressionError> {
        let value = serde_json::to_value(delta).map_err(|e| CompressionError::Encode(e.to_string()))?;
        self.compress_value(&delta.source_id, value)
    }

    /// Decompress a single delta received from `source_id`.
    ///
    /// # Errors
    ///
    /// Returns error on checksum mismatch, unknown baseline, or bad data.
    pub fn decompress_delta(
        &mut self,
        source_id: &str,
        compressed: &CompressedDelta,
    ) -> Result<GraphDelta, CompressionError> {
        let value = self.decompress_value(source_id, compressed)?;
        serde_json::from_value(value).map_err(|e| CompressionError::Decode(e.to_string()))
    }

    /// Decompress a list of deltas received from `source_id`.
    ///
    /// # Errors
    ///
    /// Returns error on checksum mismatch, unknown baseline, or bad data.
    pub fn decompress_batch(
        &mut self,
        source_id: &str,
        compressed: &CompressedDelta,
    ) -> Result<Vec<GraphDelta>, CompressionError> {
        let value = self.decompress_value(source_id, compressed)?;
        serde_json::from_value(value).map_err(|e| CompressionError::Decode(e.to_string()))
    }

    /// Compress a list of deltas on a blocking worker.
    ///
    /// The worker gets an owned snapshot of the sender baseline; the new
    /// baseline is stored once the worker returns.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails or the worker panics.
    pub async fn compress_batch(
        &mut self,
        source_id: &str,
        deltas: Vec<GraphDelta>,
    ) -> Result<CompressedDelta, CompressionError> {
        let config = self.config.clone();
        let baseline = self.sent.get(source_id).cloned();

        let (compressed, next) = tokio::task::spawn_blocking(move || {
            let value = serde_json::to_value(&deltas).map_err(|e| CompressionError::Encode(e.to_string()))?;
            encode(&config, baseline.as_ref(), value)
        })
        .await
        .map_err(|e| CompressionError::Encode(format!("compression worker failed: {e}")))??;

        self.sent.insert(source_id.to_string(), next);
        Ok(compressed)
    }

    /// Compress an arbitrary JSON state for a source.
    ///
    /// # Errors
    ///
    /// Returns error if the fresh encoding fails.
    pub fn compress_value(&mut self, source_id: &str, value: Value) -> Result<CompressedDelta, CompressionError> {
        let (compressed, next) = encode(&self.config, self.sent.get(source_id), value)?;
        tracing::debug!(
            source_id,
            encoding = ?compressed.encoding,
            original = compressed.original_size,
            compressed = compressed.compressed_size,
            "Compressed payload"
        );
        self.sent.insert(source_id.to_string(), next);
        Ok(compressed)
    }

    /// Decompress an arbitrary JSON state from a source.
    ///
    /// # Errors
    ///
    /// Returns error on checksum mismatch, unknown baseline, or bad data.
    pub fn decompress_value(&mut self, source_id: &str, compressed: &CompressedDelta) -> Result<Value, CompressionError> {
        let value = decode(self.received.get(source_id), compressed)?;
        self.received.insert(source_id.to_string(), Baseline::of(value.clone()));
        Ok(value)
    }

    /// Forget what was last sent for a source; the next payload is fresh.
    pub fn reset_sent(&mut self, source_id: &str) {
        self.sent.remove(source_id);
    }

    /// Forget what was last received from a source.
    pub fn reset_received(&mut self, source_id: &str) {
        self.received.remove(source_id);
    }

    /// Last state sent for a source.
    #[must_use]
    pub fn sent_baseline(&self, source_id: &str) -> Option<&Baseline> {
        self.sent.get(source_id)
    }
}

/// Encode a value without a baseline using a fixed fresh encoding.
///
/// # Errors
///
/// Returns error for [`Encoding::StructuralDiff`], which needs a baseline.
pub fn encode_fresh(encoding: Encoding, value: &Value) -> Result<CompressedDelta, CompressionError> {
    let original_size = serialized_len(value)?;
    let data = match encoding {
        Encoding::Minified => minified(value)?,
        Encoding::Binary => binary(value)?,
        Encoding::StructuralDiff => return Err(CompressionError::BaselineMismatch),
    };
    Ok(envelope(content_id(value), encoding, data, original_size))
}

/// Decode a payload that does not depend on a baseline.
///
/// # Errors
///
/// Returns error on checksum mismatch, bad data, or a structural diff.
pub fn decode_fresh(compressed: &CompressedDelta) -> Result<Value, CompressionError> {
    decode(None, compressed)
}

fn encode(
    config: &CompressionConfig,
    baseline: Option<&Baseline>,
    value: Value,
) -> Result<(CompressedDelta, Baseline), CompressionError> {
    let original_size = serialized_len(&value)?;
    let (fresh_encoding, fresh) = if config.prefer_binary {
        (Encoding::Binary, binary(&value)?)
    } else {
        (Encoding::Minified, minified(&value)?)
    };

    let mut chosen = (fresh_encoding, fresh);
    if let Some(base) = baseline {
        let mut ops = Vec::new();
        diff(&base.value, &value, &mut Vec::new(), &mut ops);
        let payload = DiffPayload {
            base: base.id.clone(),
            ops,
        };
        let patch = serde_json::to_string(&payload).map_err(|e| CompressionError::Encode(e.to_string()))?;
        #[allow(clippy::cast_precision_loss)]
        let worthwhile = (patch.len() as f64) < config.diff_ratio * chosen.1.len() as f64;
        if worthwhile {
            chosen = (Encoding::StructuralDiff, patch);
        }
    }

    let next = Baseline::of(value);
    let compressed = envelope(next.id.clone(), chosen.0, chosen.1, original_size);
    Ok((compressed, next))
}

fn decode(baseline: Option<&Baseline>, compressed: &CompressedDelta) -> Result<Value, CompressionError> {
    if checksum(&compressed.data) != compressed.checksum {
        tracing::warn!(payload_id = %compressed.id, "Compressed payload failed checksum");
        return Err(CompressionError::ChecksumMismatch {
            id: compressed.id.clone(),
        });
    }

    let value = match compressed.encoding {
        Encoding::Minified => {
            let short: Value =
                serde_json::from_str(&compressed.data).map_err(|e| CompressionError::Decode(e.to_string()))?;
            rewrite_keys(&short, false)
        }
        Encoding::Binary => {
            let bytes = STANDARD
                .decode(&compressed.data)
                .map_err(|e| CompressionError::Decode(e.to_string()))?;
            ciborium::from_reader(bytes.as_slice()).map_err(|e| CompressionError::Decode(e.to_string()))?
        }
        Encoding::StructuralDiff => {
            let payload: DiffPayload =
                serde_json::from_str(&compressed.data).map_err(|e| CompressionError::Decode(e.to_string()))?;
            let base = baseline
                .filter(|b| b.id == payload.base)
                .ok_or(CompressionError::BaselineMismatch)?;
            let mut value = base.value.clone();
            for op in payload.ops {
                apply(&mut value, op)?;
            }
            value
        }
    };

    if content_id(&value) != compressed.id {
        return Err(CompressionError::ChecksumMismatch {
            id: compressed.id.clone(),
        });
    }
    Ok(value)
}

fn envelope(id: String, encoding: Encoding, data: String, original_size: usize) -> CompressedDelta {
    CompressedDelta {
        id,
        timestamp: now_ms(),
        compressed: true,
        encoding,
        checksum: checksum(&data),
        original_size,
        compressed_size: data.len(),
        data,
    }
}

/// Short BLAKE3 checksum of encoded data.
#[must_use]
pub fn checksum(data: &str) -> String {
    blake3::hash(data.as_bytes()).to_hex()[..16].to_string()
}

fn content_id(value: &Value) -> String {
    blake3::hash(canonical_json(value).as_bytes()).to_hex()[..16].to_string()
}

fn serialized_len(value: &Value) -> Result<usize, CompressionError> {
    serde_json::to_string(value)
        .map(|s| s.len())
        .map_err(|e| CompressionError::Encode(e.to_string()))
}

fn minified(value: &Value) -> Result<String, CompressionError> {
    serde_json::to_string(&rewrite_keys(value, true)).map_err(|e| CompressionError::Encode(e.to_string()))
}

fn binary(value: &Value) -> Result<String, CompressionError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| CompressionError::Encode(e.to_string()))?;
    Ok(STANDARD.encode(bytes))
}

/// Shorten (or expand) envelope keys, leaving opaque values untouched.
fn rewrite_keys(value: &Value, shorten: bool) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, inner) in map {
                let (long, renamed): (&str, &str) = if shorten {
                    let short = KEY_MAP.iter().find(|(l, _)| l == key).map_or(key.as_str(), |(_, s)| *s);
                    (key.as_str(), short)
                } else {
                    let long = KEY_MAP.iter().find(|(_, s)| s == key).map_or(key.as_str(), |(l, _)| *l);
                    (long, long)
                };
                let inner = if OPAQUE_KEYS.contains(&long) {
                    inner.clone()
                } else {
                    rewrite_keys(inner, shorten)
                };
                out.insert(renamed.to_string(), inner);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| rewrite_keys(v, shorten)).collect()),
        other => other.clone(),
    }
}

fn diff(old: &Value, new: &Value, path: &mut Vec<Segment>, ops: &mut Vec<PatchOp>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            for key in a.keys().filter(|k| !b.contains_key(*k)) {
                let mut p = path.clone();
                p.push(Segment::Key(key.clone()));
                ops.push(PatchOp::Remove { path: p });
            }
            for (key, vb) in b {
                path.push(Segment::Key(key.clone()));
                match a.get(key) {
                    Some(va) => diff(va, vb, path, ops),
                    None => ops.push(PatchOp::Set {
                        path: path.clone(),
                        value: vb.clone(),
                    }),
                }
                path.pop();
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            let common = a.len().min(b.len());
            for i in 0..common {
                path.push(Segment::Index(i));
                diff(&a[i], &b[i], path, ops);
                path.pop();
            }
            if a.len() != b.len() {
                ops.push(PatchOp::Splice {
                    path: path.clone(),
                    at: common,
                    remove: a.len() - common,
                    insert: b[common..].to_vec(),
                });
            }
        }
        _ => ops.push(PatchOp::Set {
            path: path.clone(),
            value: new.clone(),
        }),
    }
}

fn resolve<'a>(root: &'a mut Value, path: &[Segment]) -> Result<&'a mut Value, CompressionError> {
    let mut current = root;
    for segment in path {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get_mut(key),
            (Segment::Index(i), Value::Array(items)) => items.get_mut(*i),
            _ => None,
        }
        .ok_or_else(|| CompressionError::Decode("patch path does not exist".to_string()))?;
    }
    Ok(current)
}

fn apply(root: &mut Value, op: PatchOp) -> Result<(), CompressionError> {
    let invalid = || CompressionError::Decode("invalid patch target".to_string());
    match op {
        PatchOp::Set { path, value } => {
            let Some((last, parent)) = path.split_last() else {
                *root = value;
                return Ok(());
            };
            match (last, resolve(root, parent)?) {
                (Segment::Key(key), Value::Object(map)) => {
                    map.insert(key.clone(), value);
                }
                (Segment::Index(i), Value::Array(items)) if *i < items.len() => items[*i] = value,
                _ => return Err(invalid()),
            }
        }
        PatchOp::Remove { path } => {
            let (last, parent) = path.split_last().ok_or_else(invalid)?;
            match (last, resolve(root, parent)?) {
                (Segment::Key(key), Value::Object(map)) => {
                    map.remove(key);
                }
                _ => return Err(invalid()),
            }
        }
        PatchOp::Splice {
            path,
            at,
            remove,
            insert,
        } => {
            let Value::Array(items) = resolve(root, &path)? else {
                return Err(invalid());
            };
            if at + remove > items.len() {
                return Err(invalid());
            }
            items.splice(at..at + remove, insert);
        }
    }
    Ok(())
}

/// Errors from compression and decompression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompressionError {
    /// Data does not match its checksum; request full state
    #[error("checksum mismatch for payload {id}")]
    ChecksumMismatch {
        /// Payload id
        id: String,
    },
    /// A diff references a state the receiver does not hold
    #[error("diff baseline does not match the last received state")]
    BaselineMismatch,
    /// Data could not be decoded
    #[error("decode error: {0}")]
    Decode(String),
    /// Data could not be encoded
    #[error("encode error: {0}")]
    Encode(String),
}

impl CompressionError {
    /// Whether the caller must fall back to requesting full state.
    #[must_use]
    pub fn needs_resync(&self) -> bool {
        matches!(
            self,
            CompressionError::ChecksumMismatch { .. } | CompressionError::BaselineMismatch | CompressionError::Decode(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graph_deltasync_core::{DeltaOperation, TargetKind};
    use serde_json::json;

    fn large_delta(id: &str, label: &str) -> GraphDelta {
        let mut delta = GraphDelta::new(id, "server", 1_000).with_dependency("root");
        for i in 0..40 {
            delta = delta.with_operation(
                DeltaOperation::update(
                    TargetKind::Node,
                    format!("node-{i}"),
                    json!({"label": format!("{label}-{i}"), "weight": i, "style": {"color": "blue"}}),
                )
                .with_path("attrs"),
            );
        }
        delta
    }

    #[test]
    fn fresh_encodings_round_trip() {
        let delta = large_delta("d1", "x");
        let value = serde_json::to_value(&delta).unwrap();

        for encoding in [Encoding::Minified, Encoding::Binary] {
            let compressed = encode_fresh(encoding, &value).unwrap();
            assert!(compressed.compressed);
            assert_eq!(compressed.encoding, encoding);
            let decoded: GraphDelta = serde_json::from_value(decode_fresh(&compressed).unwrap()).unwrap();
            assert_eq!(decoded, delta);
        }
    }

    #[test]
    fn minified_keeps_user_keys() {
        let delta = GraphDelta::new("d", "s", 1).with_operation(DeltaOperation::update(
            TargetKind::Edge,
            "e",
            json!({"id": "user-id", "k": 1, "type": "user-type"}),
        ));
        let value = serde_json::to_value(&delta).unwrap();
        let compressed = encode_fresh(Encoding::Minified, &value).unwrap();

        assert!(compressed.compressed_size < compressed.original_size);
        assert_eq!(decode_fresh(&compressed).unwrap(), value);
    }

    #[test]
    fn diff_used_when_materially_smaller() {
        let mut sender = DeltaCompressor::default();
        let mut receiver = DeltaCompressor::default();

        let first = sender.compress_delta(&large_delta("d1", "x")).unwrap();
        assert_eq!(first.encoding, Encoding::Minified);
        receiver.decompress_delta("server", &first).unwrap();

        let mut second_delta = large_delta("d2", "x");
        second_delta.operations[3].data = Some(json!({"label": "changed", "weight": 3, "style": {"color": "blue"}}));
        second_delta.operations.pop();
        let second = sender.compress_delta(&second_delta).unwrap();
        assert_eq!(second.encoding, Encoding::StructuralDiff);
        assert!(second.compressed_size < second.original_size / 4);

        assert_eq!(receiver.decompress_delta("server", &second).unwrap(), second_delta);
    }

    #[test]
    fn unrelated_payload_stays_fresh() {
        let mut sender = DeltaCompressor::default();
        sender.compress_delta(&large_delta("d1", "x")).unwrap();
        let other = GraphDelta::new("tiny", "server", 5);
        assert_eq!(sender.compress_delta(&other).unwrap().encoding, Encoding::Minified);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut sender = DeltaCompressor::default();
        let mut receiver = DeltaCompressor::default();

        let first = sender.compress_delta(&large_delta("d1", "x")).unwrap();
        receiver.decompress_delta("server", &first).unwrap();
        let baseline_before = receiver.received.get("server").cloned();

        let mut second = sender.compress_delta(&large_delta("d2", "x")).unwrap();
        assert_eq!(second.encoding, Encoding::StructuralDiff);
        second.checksum = "0000000000000000".to_string();

        let err = receiver.decompress_delta("server", &second).unwrap_err();
        assert_eq!(err, CompressionError::ChecksumMismatch { id: second.id.clone() });
        assert!(err.needs_resync());
        assert_eq!(receiver.received.get("server").cloned(), baseline_before);
    }

    #[test]
    fn tampered_data_is_rejected() {
        let value = json!({"id": "x", "n": 1});
        let mut compressed = encode_fresh(Encoding::Minified, &value).unwrap();
        compressed.data = compressed.data.replace('1', "2");
        assert!(matches!(
            decode_fresh(&compressed),
            Err(CompressionError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn diff_without_baseline_is_rejected() {
        let mut sender = DeltaCompressor::default();
        sender.compress_delta(&large_delta("d1", "x")).unwrap();
        let diffed = sender.compress_delta(&large_delta("d2", "x")).unwrap();

        let mut fresh_receiver = DeltaCompressor::default();
        assert_eq!(
            fresh_receiver.decompress_delta("server", &diffed),
            Err(CompressionError::BaselineMismatch)
        );

        sender.reset_sent("server");
        let again = sender.compress_delta(&large_delta("d3", "x")).unwrap();
        assert_eq!(again.encoding, Encoding::Minified);
    }

    #[test]
    fn binary_preferred_when_configured() {
        let mut compressor = DeltaCompressor::new(CompressionConfig {
            prefer_binary: true,
            ..CompressionConfig::default()
        });
        let delta = large_delta("d1", "x");
        let compressed = compressor.compress_delta(&delta).unwrap();
        assert_eq!(compressed.encoding, Encoding::Binary);
        assert_eq!(compressor.decompress_delta("server", &compressed).unwrap(), delta);
    }

    #[tokio::test]
    async fn batch_compression_runs_off_thread() {
        let mut sender = DeltaCompressor::default();
        let mut receiver = DeltaCompressor::default();
        let batch = vec![large_delta("d1", "x"), large_delta("d2", "y")];

        let compressed = tokio_test::assert_ok!(sender.compress_batch("server", batch.clone()).await);
        assert!(sender.sent_baseline("server").is_some());
        assert_eq!(receiver.decompress_batch("server", &compressed).unwrap(), batch);
    }

    #[test]
    fn patch_ops_cover_removal_and_splice() {
        let old = json!({"a": 1, "b": [1, 2, 3], "c": {"d": true}});
        let new = json!({"b": [1, 5], "c": {"d": true, "e": null}});
        let mut ops = Vec::new();
        diff(&old, &new, &mut Vec::new(), &mut ops);

        let mut patched = old.clone();
        for op in ops {
            apply(&mut patched, op).unwrap();
        }
        assert_eq!(patched, new);
    }
}
