use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::warn;

use super::paths::cache_map_path;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persisted per-node sync state, mirroring the document hierarchy. A node id
/// appears in exactly one place in the whole cache tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub last_modified: Option<i64>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default, deserialize_with = "children_compat")]
    pub children: Vec<CacheRecord>,
}

impl CacheRecord {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            last_modified: None,
            content_hash: None,
            children: Vec::new(),
        }
    }
}

/// Older cache files stored children as a map of id -> record; current files
/// use an array. Accept both, migrating the map shape on load.
fn children_compat<'de, D>(deserializer: D) -> Result<Vec<CacheRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Compat {
        List(Vec<CacheRecord>),
        Legacy(BTreeMap<String, CacheRecord>),
    }

    Ok(match Compat::deserialize(deserializer)? {
        Compat::List(list) => list,
        Compat::Legacy(map) => map
            .into_iter()
            .map(|(id, mut record)| {
                if record.id.is_empty() {
                    record.id = id;
                }
                record
            })
            .collect(),
    })
}

/// The persisted cache tree: top-level node id -> record. Reloaded from disk
/// before every change check; a reload that fails is treated as an empty
/// cache, never as a fatal error.
pub struct CacheStore {
    path: PathBuf,
    records: BTreeMap<String, CacheRecord>,
}

impl CacheStore {
    pub fn new(output_root: &Path) -> Self {
        Self {
            path: cache_map_path(output_root),
            records: BTreeMap::new(),
        }
    }

    /// Reload the cache map from disk, replacing in-memory state. Missing,
    /// unreadable or corrupt files fail open to an empty map so the affected
    /// nodes simply look like they need an update.
    pub async fn load(&mut self) {
        self.records = match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(records) => records,
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "cache map is corrupt, starting empty");
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "cache map is unreadable, starting empty");
                BTreeMap::new()
            }
        };
        self.cleanup();
    }

    /// Full rewrite of the persisted tree. Not batched, not transactional; a
    /// crash mid-write leaves a corrupt file that the next load treats as a
    /// cache miss.
    pub async fn save(&self) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(&self.records)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }

    /// Restore the "appears once" invariant: drop any top-level entry that is
    /// also reachable as a descendant of another record, and deduplicate
    /// children lists (first occurrence wins).
    fn cleanup(&mut self) {
        for record in self.records.values_mut() {
            dedupe_children(record);
        }

        let mut nested = HashSet::new();
        for record in self.records.values() {
            let mut stack: Vec<&CacheRecord> = record.children.iter().collect();
            while let Some(current) = stack.pop() {
                nested.insert(current.id.clone());
                stack.extend(current.children.iter());
            }
        }
        self.records.retain(|id, _| !nested.contains(id));
    }

    /// Resolve a record by walking the ancestor chain down from a top-level
    /// entry. Any missing hop resolves to `None`.
    pub fn find_record(&self, id: &str, ancestors: &[String]) -> Option<&CacheRecord> {
        let Some((first, rest)) = ancestors.split_first() else {
            return self.records.get(id);
        };
        let mut current = self.records.get(first)?;
        for hop in rest {
            current = current.children.iter().find(|child| child.id == *hop)?;
        }
        current.children.iter().find(|child| child.id == id)
    }

    /// Create or update a record, creating empty records for any missing hop
    /// of the ancestor chain along the way.
    pub fn upsert_record(
        &mut self,
        id: &str,
        ancestors: &[String],
        last_modified: Option<i64>,
        content_hash: Option<String>,
    ) {
        let Some((first, rest)) = ancestors.split_first() else {
            let record = self
                .records
                .entry(id.to_string())
                .or_insert_with(|| CacheRecord::new(id));
            record.last_modified = last_modified;
            record.content_hash = content_hash;
            return;
        };

        let mut current = self
            .records
            .entry(first.clone())
            .or_insert_with(|| CacheRecord::new(first));
        for hop in rest {
            let index = match current.children.iter().position(|child| child.id == *hop) {
                Some(index) => index,
                None => {
                    current.children.push(CacheRecord::new(hop));
                    current.children.len() - 1
                }
            };
            current = &mut current.children[index];
        }

        let index = match current.children.iter().position(|child| child.id == id) {
            Some(index) => index,
            None => {
                current.children.push(CacheRecord::new(id));
                current.children.len() - 1
            }
        };
        let record = &mut current.children[index];
        record.last_modified = last_modified;
        record.content_hash = content_hash;
    }

    /// Ancestor chain (top-level id first, parent last) of a record anywhere
    /// in the cache forest. The target itself is not part of the chain.
    pub fn ancestor_chain(&self, target_id: &str) -> Option<Vec<String>> {
        for record in self.records.values() {
            let mut stack: Vec<(&CacheRecord, Vec<String>)> = vec![(record, Vec::new())];
            while let Some((current, chain)) = stack.pop() {
                if current.id == target_id {
                    return Some(chain);
                }
                let mut child_chain = chain.clone();
                child_chain.push(current.id.clone());
                for child in &current.children {
                    stack.push((child, child_chain.clone()));
                }
            }
        }
        None
    }
}

fn dedupe_children(record: &mut CacheRecord) {
    let mut seen = HashSet::new();
    record.children.retain(|child| seen.insert(child.id.clone()));
    for child in &mut record.children {
        dedupe_children(child);
    }
}
