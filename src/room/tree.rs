use crate::buffer::BufferId;
use std::collections::BTreeMap;

/// Error from path validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("invalid path {0:?}")]
    Malformed(String),
    #[error("path {0:?} already exists")]
    Exists(String),
    #[error("path {0:?} goes through an existing file")]
    ThroughFile(String),
}

#[derive(Debug, Clone)]
enum Node {
    Dir(BTreeMap<String, Node>),
    File(BufferId),
}

/// Directory tree of a workspace's buffers, keyed by path chunk.
#[derive(Debug, Clone, Default)]
pub struct PathTree {
    root: BTreeMap<String, Node>,
}

/// Split a path into chunks, rejecting anything that isn't a plain
/// relative path.
pub fn split_path(path: &str) -> Result<Vec<&str>, PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(PathError::Malformed(path.to_string()));
    }
    let chunks: Vec<&str> = path.split('/').collect();
    if chunks.iter().any(|c| c.is_empty() || *c == "." || *c == "..") {
        return Err(PathError::Malformed(path.to_string()));
    }
    Ok(chunks)
}

impl PathTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that a file could be created at `path`.
    pub fn check_free(&self, path: &str) -> Result<(), PathError> {
        let chunks = split_path(path)?;
        let mut dir = &self.root;
        for (i, chunk) in chunks.iter().enumerate() {
            let last = i + 1 == chunks.len();
            match dir.get(*chunk) {
                None => return Ok(()),
                Some(_) if last => return Err(PathError::Exists(path.to_string())),
                Some(Node::File(_)) => return Err(PathError::ThroughFile(path.to_string())),
                Some(Node::Dir(child)) => dir = child,
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, path: &str, id: BufferId) -> Result<(), PathError> {
        self.check_free(path)?;
        let chunks = split_path(path)?;
        let (name, parents) = chunks.split_last().ok_or(PathError::Empty)?;
        let mut dir = &mut self.root;
        for chunk in parents {
            let node = dir
                .entry(chunk.to_string())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
            dir = match node {
                Node::Dir(child) => child,
                Node::File(_) => return Err(PathError::ThroughFile(path.to_string())),
            };
        }
        dir.insert(name.to_string(), Node::File(id));
        Ok(())
    }

    /// Remove the file at `path`, pruning directories left empty.
    pub fn remove(&mut self, path: &str) -> Option<BufferId> {
        let chunks = split_path(path).ok()?;
        remove_in(&mut self.root, &chunks)
    }

    pub fn get(&self, path: &str) -> Option<BufferId> {
        let chunks = split_path(path).ok()?;
        let mut dir = &self.root;
        let (name, parents) = chunks.split_last()?;
        for chunk in parents {
            match dir.get(*chunk)? {
                Node::Dir(child) => dir = child,
                Node::File(_) => return None,
            }
        }
        match dir.get(*name)? {
            Node::File(id) => Some(*id),
            Node::Dir(_) => None,
        }
    }

    /// Every file, sorted by path.
    pub fn files(&self) -> Vec<(String, BufferId)> {
        let mut out = Vec::new();
        collect(&self.root, "", &mut out);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

fn remove_in(dir: &mut BTreeMap<String, Node>, chunks: &[&str]) -> Option<BufferId> {
    let (first, rest) = chunks.split_first()?;
    if rest.is_empty() {
        if !matches!(dir.get(*first), Some(Node::File(_))) {
            return None;
        }
        return match dir.remove(*first) {
            Some(Node::File(id)) => Some(id),
            _ => None,
        };
    }
    let Some(Node::Dir(child)) = dir.get_mut(*first) else {
        return None;
    };
    let removed = remove_in(child, rest)?;
    if child.is_empty() {
        dir.remove(*first);
    }
    Some(removed)
}

fn collect(dir: &BTreeMap<String, Node>, prefix: &str, out: &mut Vec<(String, BufferId)>) {
    for (name, node) in dir {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };
        match node {
            Node::File(id) => out.push((path, *id)),
            Node::Dir(child) => collect(child, &path, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path_rejects_bad_paths() {
        assert_eq!(split_path("src/main.rs").unwrap(), vec!["src", "main.rs"]);
        assert_eq!(split_path(""), Err(PathError::Empty));
        for bad in ["/abs", "dir/", "a//b", "a/./b", "../up", "a/.."] {
            assert!(matches!(split_path(bad), Err(PathError::Malformed(_))), "{}", bad);
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut tree = PathTree::new();
        tree.insert("src/main.rs", 1).unwrap();
        tree.insert("src/lib.rs", 2).unwrap();
        tree.insert("README", 3).unwrap();
        assert_eq!(tree.get("src/main.rs"), Some(1));
        assert_eq!(tree.get("src"), None);
        assert_eq!(
            tree.files(),
            vec![
                ("README".to_string(), 3),
                ("src/lib.rs".to_string(), 2),
                ("src/main.rs".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_conflicts() {
        let mut tree = PathTree::new();
        tree.insert("a/b", 1).unwrap();
        assert_eq!(tree.insert("a/b", 2), Err(PathError::Exists("a/b".into())));
        assert_eq!(tree.insert("a", 2), Err(PathError::Exists("a".into())));
        assert_eq!(tree.insert("a/b/c", 2), Err(PathError::ThroughFile("a/b/c".into())));
    }

    #[test]
    fn test_remove_prunes_empty_dirs() {
        let mut tree = PathTree::new();
        tree.insert("a/b/c/file", 1).unwrap();
        tree.insert("a/other", 2).unwrap();
        assert_eq!(tree.remove("a/b/c/file"), Some(1));
        assert_eq!(tree.files(), vec![("a/other".to_string(), 2)]);
        // The pruned chain is free again, as a file.
        tree.insert("a/b", 3).unwrap();
        assert_eq!(tree.remove("a/other"), Some(2));
        assert_eq!(tree.remove("a/b"), Some(3));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_remove_directory_is_noop() {
        let mut tree = PathTree::new();
        tree.insert("a/b", 1).unwrap();
        assert_eq!(tree.remove("a"), None);
        assert_eq!(tree.get("a/b"), Some(1));
    }
}
