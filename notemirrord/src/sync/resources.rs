use std::collections::{HashMap, HashSet};

use notemirror_core::{ApiError, Block, NodeClient, normalize_node_id};
use parking_lot::Mutex as SyncMutex;
use thiserror::Error;
use tracing::debug;

use super::fetch;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("api error: {0}")]
    Api(#[from] ApiError),
}

/// A downloadable attachment reference found in a block tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedResource {
    pub resource_id: String,
    pub url: String,
}

enum WorkItem {
    /// A child page whose block tree still needs fetching.
    Page { id: String },
    /// An already-fetched block tree belonging to `owner`.
    Blocks { owner: String, blocks: Vec<Block> },
}

/// Assigns every attachment in a tree to exactly one owning node. The map is
/// rebuilt fresh at the start of each top-level run; a resource shared across
/// branches belongs to whichever branch pre-order reaches first, so it is
/// downloaded exactly once.
pub struct ResourceTracker {
    client: NodeClient,
    owners: SyncMutex<HashMap<String, String>>,
}

impl ResourceTracker {
    pub fn new(client: NodeClient) -> Self {
        Self {
            client,
            owners: SyncMutex::new(HashMap::new()),
        }
    }

    /// Pre-order walk over the whole hierarchy under `root_id`, using an
    /// explicit work list rather than call-stack recursion. Child pages are
    /// refetched here even though the main pass fetches them again later;
    /// that duplication is accepted for the determinism it buys (the whole
    /// map is built before any concurrent dispatch begins).
    pub async fn build_resource_map(
        &self,
        root_id: &str,
        root_blocks: &[Block],
    ) -> Result<usize, ResourceError> {
        let mut owners = HashMap::new();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(root_id.to_string());
        let mut work = vec![WorkItem::Blocks {
            owner: root_id.to_string(),
            blocks: root_blocks.to_vec(),
        }];

        while let Some(item) = work.pop() {
            match item {
                WorkItem::Page { id } => {
                    let blocks = fetch::fetch_blocks_deep(&self.client, &id).await?;
                    work.push(WorkItem::Blocks { owner: id, blocks });
                }
                WorkItem::Blocks { owner, blocks } => {
                    let mut child_pages = Vec::new();
                    scan_blocks(&owner, &blocks, &mut owners, &mut child_pages);
                    // Reverse so the LIFO work list visits siblings in
                    // document order.
                    for page_id in child_pages.into_iter().rev() {
                        if visited.insert(page_id.clone()) {
                            work.push(WorkItem::Page { id: page_id });
                        }
                    }
                }
            }
        }

        let count = owners.len();
        debug!(root = root_id, resources = count, "resource ownership map built");
        *self.owners.lock() = owners;
        Ok(count)
    }

    /// Resources in `blocks` that belong to `node_id`. Blocks nested inside a
    /// child-page boundary are skipped; they are extracted when that page is
    /// processed.
    pub fn extract_owned_resources(&self, blocks: &[Block], node_id: &str) -> Vec<OwnedResource> {
        let owners = self.owners.lock();
        let mut found = Vec::new();
        let mut stack: Vec<&Block> = blocks.iter().rev().collect();
        while let Some(block) = stack.pop() {
            if block.is_child_page() {
                continue;
            }
            if let Some(url) = block.resource_url() {
                let resource_id = normalize_node_id(&block.id);
                if owners.get(&resource_id).map(String::as_str) == Some(node_id) {
                    found.push(OwnedResource {
                        resource_id,
                        url: url.to_string(),
                    });
                }
            }
            for child in block.children.iter().rev() {
                stack.push(child);
            }
        }
        found
    }
}

fn scan_blocks(
    owner: &str,
    blocks: &[Block],
    owners: &mut HashMap<String, String>,
    child_pages: &mut Vec<String>,
) {
    let mut stack: Vec<&Block> = blocks.iter().rev().collect();
    while let Some(block) = stack.pop() {
        if block.is_child_page() {
            child_pages.push(normalize_node_id(&block.id));
            continue;
        }
        if block.resource_url().is_some() {
            owners
                .entry(normalize_node_id(&block.id))
                .or_insert_with(|| owner.to_string());
        }
        for child in block.children.iter().rev() {
            stack.push(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn image_block(id: &str, url: &str) -> serde_json::Value {
        json!({ "id": id, "type": "image", "image": { "file": { "url": url } } })
    }

    #[tokio::test]
    async fn shared_resource_belongs_to_first_branch_in_preorder() {
        let server = MockServer::start().await;
        // Child page c1 references the same resource the root references.
        Mock::given(method("GET"))
            .and(path("/v1/nodes/c1/children"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [ image_block("shared1", "https://cdn.example/s.png") ],
                "has_more": false
            })))
            .mount(&server)
            .await;

        let client = NodeClient::with_base_url(&server.uri(), "t").unwrap();
        let tracker = ResourceTracker::new(client);

        let root_blocks: Vec<Block> = serde_json::from_value(json!([
            image_block("shared1", "https://cdn.example/s.png"),
            { "id": "c1", "type": "child_page", "has_children": true,
              "child_page": { "title": "Sub" } }
        ]))
        .unwrap();

        let count = tracker.build_resource_map("root1", &root_blocks).await.unwrap();
        assert_eq!(count, 1);

        let root_owned = tracker.extract_owned_resources(&root_blocks, "root1");
        assert_eq!(root_owned.len(), 1);
        assert_eq!(root_owned[0].resource_id, "shared1");

        let child_blocks: Vec<Block> = serde_json::from_value(json!([
            image_block("shared1", "https://cdn.example/s.png")
        ]))
        .unwrap();
        assert!(tracker.extract_owned_resources(&child_blocks, "c1").is_empty());
    }

    #[tokio::test]
    async fn resources_inside_child_page_belong_to_that_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/nodes/c1/children"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [ image_block("pic1", "https://cdn.example/p.png") ],
                "has_more": false
            })))
            .mount(&server)
            .await;

        let client = NodeClient::with_base_url(&server.uri(), "t").unwrap();
        let tracker = ResourceTracker::new(client);

        let root_blocks: Vec<Block> = serde_json::from_value(json!([
            { "id": "c1", "type": "child_page", "has_children": true,
              "child_page": { "title": "Sub" } }
        ]))
        .unwrap();
        tracker.build_resource_map("root1", &root_blocks).await.unwrap();

        // Extraction at the root never descends through the boundary.
        assert!(tracker.extract_owned_resources(&root_blocks, "root1").is_empty());

        let child_blocks: Vec<Block> = serde_json::from_value(json!([
            image_block("pic1", "https://cdn.example/p.png")
        ]))
        .unwrap();
        let owned = tracker.extract_owned_resources(&child_blocks, "c1");
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].url, "https://cdn.example/p.png");
    }

    #[tokio::test]
    async fn map_is_rebuilt_per_run() {
        let server = MockServer::start().await;
        let client = NodeClient::with_base_url(&server.uri(), "t").unwrap();
        let tracker = ResourceTracker::new(client);

        let first: Vec<Block> = serde_json::from_value(json!([
            image_block("old1", "https://cdn.example/old.png")
        ]))
        .unwrap();
        tracker.build_resource_map("root1", &first).await.unwrap();

        let second: Vec<Block> = serde_json::from_value(json!([
            image_block("new1", "https://cdn.example/new.png")
        ]))
        .unwrap();
        tracker.build_resource_map("root2", &second).await.unwrap();

        assert!(tracker.extract_owned_resources(&first, "root1").is_empty());
        assert_eq!(tracker.extract_owned_resources(&second, "root2").len(), 1);
    }
}
