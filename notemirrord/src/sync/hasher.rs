use notemirror_core::PageSnapshot;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

/// Timestamp-independent digest of a node's semantic content.
///
/// The canonical value covers title, icon, cover and properties (with
/// timestamp keys removed) plus a per-child summary of only id, type and
/// has_children. Nested child content is deliberately excluded so a child
/// edit cannot change its parent's hash. serde_json's map is BTreeMap-backed,
/// so serialization is key-sorted and the digest is deterministic.
pub fn content_hash(snapshot: &PageSnapshot) -> String {
    let mut canonical = Map::new();
    canonical.insert(
        "title".to_string(),
        snapshot.extra.get("title").cloned().unwrap_or(Value::Null),
    );
    canonical.insert(
        "icon".to_string(),
        snapshot.icon.clone().unwrap_or(Value::Null),
    );
    canonical.insert(
        "cover".to_string(),
        snapshot.cover.clone().unwrap_or(Value::Null),
    );
    canonical.insert(
        "properties".to_string(),
        scrub_timestamps(snapshot.properties.clone()),
    );
    canonical.insert(
        "children".to_string(),
        Value::Array(
            snapshot
                .blocks
                .iter()
                .map(|block| {
                    json!({
                        "id": block.id,
                        "type": block.block_type,
                        "has_children": block.has_children,
                    })
                })
                .collect(),
        ),
    );

    let serialized = Value::Object(canonical).to_string();
    hex::encode(Sha256::digest(serialized.as_bytes()))
}

// Metadata churn on *_time keys must never shift the digest.
fn scrub_timestamps(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| !key.ends_with("_time"))
                .map(|(key, value)| (key, scrub_timestamps(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(scrub_timestamps).collect()),
        other => other,
    }
}
