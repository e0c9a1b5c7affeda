use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Block types whose payload carries a downloadable attachment.
const RESOURCE_BLOCK_TYPES: &[&str] = &["image", "file", "video", "audio", "pdf"];

const CHILD_PAGE_TYPE: &str = "child_page";

/// Canonical form of a node id: lowercase, ASCII hyphens removed.
///
/// The API accepts ids both with and without hyphen grouping; all id equality
/// in this system is decided after normalization.
pub fn normalize_node_id(id: &str) -> String {
    id.trim().replace('-', "").to_ascii_lowercase()
}

/// Lightweight per-node metadata as returned by `GET /v1/nodes/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeMetadata {
    pub id: String,
    #[serde(default)]
    pub last_edited_time: Option<String>,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub icon: Option<Value>,
    #[serde(default)]
    pub cover: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One content unit within a node. A block of type `child_page` is a boundary
/// to another top-level node; its children are never inlined here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    pub id: String,
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub has_children: bool,
    #[serde(default)]
    pub children: Vec<Block>,
    #[serde(flatten)]
    pub data: Value,
}

impl Block {
    pub fn is_child_page(&self) -> bool {
        self.block_type == CHILD_PAGE_TYPE
    }

    /// URL of the attachment carried by this block, if its type is one of the
    /// resource-bearing kinds. The payload nests the URL under either a
    /// `file` (API-hosted) or `external` object.
    pub fn resource_url(&self) -> Option<&str> {
        if !RESOURCE_BLOCK_TYPES.contains(&self.block_type.as_str()) {
            return None;
        }
        let payload = self.data.get(&self.block_type)?;
        payload
            .get("file")
            .or_else(|| payload.get("external"))?
            .get("url")?
            .as_str()
    }
}

/// One page of a node's direct children.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockPage {
    pub results: Vec<Block>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// A node's full fetched state: metadata plus the deep block tree (nested
/// blocks inlined, child-page boundaries not crossed). Built once per fetch,
/// written once, then discarded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageSnapshot {
    pub id: String,
    #[serde(default)]
    pub last_edited_time: Option<String>,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub icon: Option<Value>,
    #[serde(default)]
    pub cover: Option<Value>,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PageSnapshot {
    pub fn from_parts(metadata: NodeMetadata, blocks: Vec<Block>) -> Self {
        Self {
            id: normalize_node_id(&metadata.id),
            last_edited_time: metadata.last_edited_time,
            properties: metadata.properties,
            icon: metadata.icon,
            cover: metadata.cover,
            blocks,
            extra: metadata.extra,
        }
    }
}
