use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::{BoxFuture, join_all};
use notemirror_core::{ApiError, Block, NodeClient, NodeMetadata, PageSnapshot, normalize_node_id};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::cache::{CacheError, CacheStore};
use super::detector::{ChangeDetector, DetectError};
use super::fetch;
use super::hasher::content_hash;
use super::parse_timestamp;
use super::paths::{self, PathError};
use super::resources::{ResourceError, ResourceTracker};
use super::transfer::AttachmentDownloader;
use super::writer::{SnapshotWriter, WriteError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("change detection error: {0}")]
    Detect(#[from] DetectError),
    #[error("resource tracking error: {0}")]
    Resource(#[from] ResourceError),
    #[error("snapshot write error: {0}")]
    Write(#[from] WriteError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("time parse error: {0}")]
    Time(#[from] time::error::Parse),
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub recursive: bool,
    pub include_resources: bool,
    /// How many sibling child-page branches run concurrently. Zero or
    /// negative selects strictly serial processing.
    pub concurrency_limit: i32,
    pub enable_cache: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            include_resources: true,
            concurrency_limit: 3,
            enable_cache: true,
        }
    }
}

/// Orchestrates fetch → detect → persist → download → recurse per node.
/// Every collaborator is constructor-injected; nothing global beyond the
/// tracing subscriber installed by the binary.
pub struct SyncCoordinator {
    client: NodeClient,
    output_root: PathBuf,
    cache: Arc<Mutex<CacheStore>>,
    detector: ChangeDetector,
    tracker: ResourceTracker,
    writer: SnapshotWriter,
    downloader: AttachmentDownloader,
}

impl SyncCoordinator {
    pub fn new(client: NodeClient, output_root: &Path) -> Self {
        let cache = Arc::new(Mutex::new(CacheStore::new(output_root)));
        let writer = SnapshotWriter::new(output_root);
        let detector = ChangeDetector::new(client.clone(), cache.clone(), writer.clone());
        let tracker = ResourceTracker::new(client.clone());
        Self {
            client,
            output_root: output_root.to_path_buf(),
            cache,
            detector,
            tracker,
            writer,
            downloader: AttachmentDownloader::new(),
        }
    }

    pub fn with_downloader(mut self, downloader: AttachmentDownloader) -> Self {
        self.downloader = downloader;
        self
    }

    /// Top-level run loop. Each root is attempted independently; a failing
    /// root is logged and counted but never stops the others. Returns the
    /// number of roots that failed.
    pub async fn run(&self, roots: &[String], options: &SyncOptions) -> usize {
        self.detector.reset();
        let mut failed = 0;
        for root in roots {
            info!(root = %root, "syncing root node");
            if let Err(err) = self
                .process_node(root.clone(), Vec::new(), true, options)
                .await
            {
                error!(root = %root, error = %err, "root sync failed");
                failed += 1;
            }
        }
        failed
    }

    /// Per-node pipeline. Boxed because child-page dispatch recurses.
    pub fn process_node<'a>(
        &'a self,
        id: String,
        ancestors: Vec<String>,
        is_root: bool,
        options: &'a SyncOptions,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(async move {
            let id = normalize_node_id(&id);
            let metadata = match self.client.get_node_metadata(&id).await {
                Ok(metadata) => metadata,
                Err(err) => {
                    error!(node = %id, ancestors = ?ancestors, error = %err, "metadata fetch failed");
                    return Err(err.into());
                }
            };
            let remote_ts = parse_timestamp(metadata.last_edited_time.as_deref())?;

            if options.enable_cache
                && !self.detector.should_update(&id, remote_ts, &ancestors).await?
            {
                if let Some(changed) = self.detector.take_updated_children(&id) {
                    return self.partial_update(&id, changed, options).await;
                }
                debug!(node = %id, "cache hit");
                return Ok(());
            }

            self.full_update(&id, metadata, remote_ts, &ancestors, is_root, options)
                .await
        })
    }

    /// Refetch only the flagged descendants of an unchanged ancestor. The
    /// ancestor's own file and cache record stay untouched; each descendant
    /// goes through the same pipeline with its chain resolved from the cache
    /// tree loaded by the change check.
    async fn partial_update(
        &self,
        id: &str,
        changed: Vec<String>,
        options: &SyncOptions,
    ) -> Result<(), SyncError> {
        info!(node = %id, changed = changed.len(), "partial update of flagged descendants");
        // Ownership is rebuilt even though the root itself is unchanged; a
        // changed descendant may carry attachments no previous map has seen.
        // The root's block tree comes from its persisted snapshot, so the
        // unchanged root is not refetched.
        if options.include_resources {
            let blocks = match self.writer.load(id, &[]).await? {
                Some(snapshot) => snapshot.blocks,
                None => fetch::fetch_blocks_deep(&self.client, id).await?,
            };
            self.tracker.build_resource_map(id, &blocks).await?;
        }
        let mut children = Vec::with_capacity(changed.len());
        {
            let cache = self.cache.lock().await;
            for child_id in changed {
                let chain = cache
                    .ancestor_chain(&child_id)
                    .unwrap_or_else(|| vec![id.to_string()]);
                children.push((child_id, chain));
            }
        }
        self.dispatch(children, options).await
    }

    async fn full_update(
        &self,
        id: &str,
        metadata: NodeMetadata,
        remote_ts: Option<i64>,
        ancestors: &[String],
        is_root: bool,
        options: &SyncOptions,
    ) -> Result<(), SyncError> {
        let blocks = match fetch::fetch_blocks_deep(&self.client, id).await {
            Ok(blocks) => blocks,
            Err(err) => {
                error!(node = %id, ancestors = ?ancestors, error = %err, "content fetch failed");
                return Err(err.into());
            }
        };
        let snapshot = PageSnapshot::from_parts(metadata, blocks);

        // Ownership must be settled over the whole hierarchy before any
        // writes or concurrent dispatch, so first-seen-wins is deterministic.
        if is_root && options.include_resources {
            self.tracker
                .build_resource_map(id, &snapshot.blocks)
                .await?;
        }

        // Nothing below may run unless the snapshot landed on disk.
        let path = self.writer.save(id, &snapshot, ancestors).await?;
        debug!(node = %id, path = %path.display(), "snapshot written");

        {
            // Concurrent branches each reload-then-rewrite; last writer wins,
            // which is acceptable within a single run.
            let mut cache = self.cache.lock().await;
            cache.load().await;
            cache.upsert_record(id, ancestors, remote_ts, Some(content_hash(&snapshot)));
            cache.save().await?;
        }

        if options.include_resources {
            self.download_owned_resources(id, &snapshot.blocks, ancestors)
                .await?;
        }

        if options.recursive {
            let mut chain = ancestors.to_vec();
            chain.push(id.to_string());
            let children: Vec<(String, Vec<String>)> = collect_child_page_ids(&snapshot.blocks)
                .into_iter()
                .map(|child_id| (child_id, chain.clone()))
                .collect();
            if !children.is_empty() {
                self.dispatch(children, options).await?;
            }
        }

        Ok(())
    }

    /// Download this node's owned attachments. Failures are collected per
    /// resource and logged; they never abort sibling downloads or the node.
    async fn download_owned_resources(
        &self,
        id: &str,
        blocks: &[Block],
        ancestors: &[String],
    ) -> Result<(), SyncError> {
        let owned = self.tracker.extract_owned_resources(blocks, id);
        if owned.is_empty() {
            return Ok(());
        }
        let node_dir = paths::node_dir(&self.output_root, ancestors, id)?;
        let mut failures = 0usize;
        for resource in owned {
            match self
                .downloader
                .save(&node_dir, &resource.resource_id, &resource.url)
                .await
            {
                Ok(saved) => {
                    debug!(resource = %resource.resource_id, path = %saved.display(), "attachment saved")
                }
                Err(err) => {
                    warn!(node = %id, resource = %resource.resource_id, error = %err, "attachment download failed");
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            warn!(node = %id, failures, "some attachments failed to download");
        }
        Ok(())
    }

    /// Bounded fan-out over sibling branches: consecutive groups of
    /// `concurrency_limit`, one whole group awaited before the next starts.
    /// Every branch in a group runs to completion; the group's first error
    /// then propagates, failing the batch as a unit.
    async fn dispatch(
        &self,
        children: Vec<(String, Vec<String>)>,
        options: &SyncOptions,
    ) -> Result<(), SyncError> {
        if options.concurrency_limit <= 0 {
            for (child_id, chain) in children {
                self.process_node(child_id, chain, false, options).await?;
            }
            return Ok(());
        }

        for group in children.chunks(options.concurrency_limit as usize) {
            let branches = group.iter().map(|(child_id, chain)| {
                self.process_node(child_id.clone(), chain.clone(), false, options)
            });
            let results = join_all(branches).await;
            let mut first_error = None;
            for ((child_id, _), result) in group.iter().zip(results) {
                if let Err(err) = result {
                    error!(node = %child_id, error = %err, "child branch failed");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Direct and nested child-page ids in document order, never descending
/// through a child-page boundary. Duplicates collapse to the first sighting.
fn collect_child_page_ids(blocks: &[Block]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    let mut stack: Vec<&Block> = blocks.iter().rev().collect();
    while let Some(block) = stack.pop() {
        if block.is_child_page() {
            let id = normalize_node_id(&block.id);
            if seen.insert(id.clone()) {
                ids.push(id);
            }
            continue;
        }
        for child in block.children.iter().rev() {
            stack.push(child);
        }
    }
    ids
}
