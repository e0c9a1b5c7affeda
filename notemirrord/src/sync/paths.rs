use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("node id is empty")]
    EmptyId,
    #[error("node id contains unsupported characters: {0}")]
    UnsupportedId(String),
}

/// Directory a node's snapshot and assets live in:
/// `<output_root>/<ancestors...>/<id>/`.
pub fn node_dir(
    output_root: &Path,
    ancestors: &[String],
    id: &str,
) -> Result<PathBuf, PathError> {
    let mut out = output_root.to_path_buf();
    for hop in ancestors {
        out.push(checked_component(hop)?);
    }
    out.push(checked_component(id)?);
    Ok(out)
}

pub fn snapshot_path(
    output_root: &Path,
    ancestors: &[String],
    id: &str,
) -> Result<PathBuf, PathError> {
    let mut path = node_dir(output_root, ancestors, id)?;
    path.push(format!("{id}.json"));
    Ok(path)
}

pub fn assets_dir(node_dir: &Path) -> PathBuf {
    node_dir.join("assets")
}

pub fn cache_map_path(output_root: &Path) -> PathBuf {
    output_root.join(".cache").join("cache-map.json")
}

// Normalized ids are plain lowercase alphanumerics; anything that could
// escape the output root is rejected outright.
fn checked_component(id: &str) -> Result<&str, PathError> {
    if id.is_empty() {
        return Err(PathError::EmptyId);
    }
    if id.chars().any(|c| !c.is_ascii_alphanumeric()) {
        return Err(PathError::UnsupportedId(id.to_string()));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_ancestor_chain_under_output_root() {
        let root = PathBuf::from("/out");
        let dir = node_dir(&root, &["p1".into(), "p2".into()], "c1").unwrap();
        assert_eq!(dir, PathBuf::from("/out/p1/p2/c1"));
        let snapshot = snapshot_path(&root, &[], "p1").unwrap();
        assert_eq!(snapshot, PathBuf::from("/out/p1/p1.json"));
    }

    #[test]
    fn rejects_traversal_attempts() {
        let root = PathBuf::from("/out");
        assert!(matches!(
            node_dir(&root, &[], ".."),
            Err(PathError::UnsupportedId(_))
        ));
        assert!(matches!(node_dir(&root, &[], ""), Err(PathError::EmptyId)));
        assert!(matches!(
            node_dir(&root, &["a/b".into()], "c"),
            Err(PathError::UnsupportedId(_))
        ));
    }

    #[test]
    fn cache_map_lives_under_hidden_dir() {
        assert_eq!(
            cache_map_path(Path::new("/out")),
            PathBuf::from("/out/.cache/cache-map.json")
        );
    }
}
