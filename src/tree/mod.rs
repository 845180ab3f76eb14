use std::collections::HashSet;

use log::info;

use crate::error::Error;
use crate::models::FileNode;
use crate::networking::SnapshotSource;
use crate::resolver::{join_path, validate_tree_path};
use crate::session::Session;

mod builder;

pub use builder::TreeBuilder;

/// A downloadable file with both of its locations resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileLeaf {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub origin_url: String,
    pub mirror_url: String,
}

/// A directory and everything fetched beneath it.
///
/// `files` and `dirs` keep the host's listing order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectoryNode {
    pub name: String,
    pub path: String,
    pub files: Vec<FileLeaf>,
    pub dirs: Vec<DirectoryNode>,
}

/// Borrowed view of either kind of node.
#[derive(Clone, Copy, Debug)]
pub enum NodeRef<'a> {
    Directory(&'a DirectoryNode),
    File(&'a FileLeaf),
}

impl<'a> NodeRef<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            NodeRef::Directory(dir) => &dir.name,
            NodeRef::File(file) => &file.name,
        }
    }
}

impl DirectoryNode {
    /// Every node in pre-order, each paired with its depth below `self`.
    pub fn walk(&self) -> Vec<(usize, NodeRef<'_>)> {
        let mut out = Vec::new();
        self.walk_into(0, &mut out);
        out
    }

    fn walk_into<'a>(&'a self, depth: usize, out: &mut Vec<(usize, NodeRef<'a>)>) {
        out.push((depth, NodeRef::Directory(self)));
        for dir in &self.dirs {
            dir.walk_into(depth + 1, out);
        }
        for file in &self.files {
            out.push((depth + 1, NodeRef::File(file)));
        }
    }

    /// All file leaves: this directory's own files first, then each
    /// subdirectory in order.
    pub fn files_recursive(&self) -> Vec<&FileLeaf> {
        let mut out: Vec<&FileLeaf> = self.files.iter().collect();
        for dir in &self.dirs {
            out.extend(dir.files_recursive());
        }
        out
    }

    /// Files whose name contains `query`, ignoring case.
    pub fn search(&self, query: &str) -> Vec<&FileLeaf> {
        let needle = query.trim().to_lowercase();
        self.files_recursive()
            .into_iter()
            .filter(|file| needle.is_empty() || file.name.to_lowercase().contains(&needle))
            .collect()
    }

    pub fn file_count(&self) -> usize {
        self.files.len() + self.dirs.iter().map(DirectoryNode::file_count).sum::<usize>()
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum::<u64>()
            + self.dirs.iter().map(DirectoryNode::total_size).sum::<u64>()
    }

    pub fn find_dir(&self, path: &str) -> Option<&DirectoryNode> {
        if self.path == path {
            return Some(self);
        }
        self.dirs.iter().find_map(|dir| {
            let inside = path
                .strip_prefix(dir.path.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));
            if inside { dir.find_dir(path) } else { None }
        })
    }
}

impl From<&FileLeaf> for FileNode {
    fn from(leaf: &FileLeaf) -> Self {
        FileNode {
            name: leaf.name.clone(),
            path: leaf.path.clone(),
            size: leaf.size,
            files: None,
            dirs: None,
            cf_url: Some(leaf.mirror_url.clone()),
            github_raw_url: Some(leaf.origin_url.clone()),
        }
    }
}

impl From<&DirectoryNode> for FileNode {
    fn from(dir: &DirectoryNode) -> Self {
        FileNode {
            name: dir.name.clone(),
            path: dir.path.clone(),
            size: 0,
            files: Some(dir.files.iter().map(FileNode::from).collect()),
            dirs: Some(dir.dirs.iter().map(FileNode::from).collect()),
            cf_url: None,
            github_raw_url: None,
        }
    }
}

/// Fetch the published snapshot at `url` and validate it.
///
/// The fetch is bounded by the transfer timeout and stops on cancellation.
pub async fn load_snapshot<S: SnapshotSource>(
    source: &S,
    session: &Session,
    url: &str,
) -> Result<DirectoryNode, Error> {
    info!("tree: loading snapshot {url}");
    let root = {
        let _permit = session.acquire_transfer().await?;
        let timeout = session.limits().transfer_timeout();
        match session.guard(timeout, source.fetch_snapshot(url)).await {
            Ok(root) => root,
            Err(Error::Transport(source)) => {
                return Err(Error::HostUnavailable {
                    what: format!("snapshot {url}"),
                    source,
                });
            }
            Err(other) => return Err(other),
        }
    };
    from_snapshot(root)
}

/// Validate a published tree snapshot and convert it to typed nodes.
pub fn from_snapshot(root: FileNode) -> Result<DirectoryNode, Error> {
    let mut root = root;
    if root.path == "." || root.path == "/" {
        root.path.clear();
    }
    let mut seen = HashSet::new();
    convert_dir(root, None, &mut seen)
}

fn malformed(path: &str, reason: impl Into<String>) -> Error {
    Error::InvalidTree {
        path: path.to_owned(),
        reason: reason.into(),
    }
}

fn check_placement(node: &FileNode, parent: Option<&str>, seen: &mut HashSet<String>) -> Result<(), Error> {
    validate_tree_path(&node.path).map_err(|e| malformed(&node.path, e.to_string()))?;
    if let Some(parent) = parent {
        if node.path.is_empty() {
            return Err(malformed(&node.path, "only the root may have an empty path"));
        }
        let expected_prefix = join_path(parent, "");
        if !parent.is_empty() && !node.path.starts_with(&expected_prefix) {
            return Err(malformed(&node.path, format!("not inside parent {parent:?}")));
        }
    }
    if !seen.insert(node.path.clone()) {
        return Err(malformed(&node.path, "duplicate path"));
    }
    Ok(())
}

fn convert_dir(node: FileNode, parent: Option<&str>, seen: &mut HashSet<String>) -> Result<DirectoryNode, Error> {
    check_placement(&node, parent, seen)?;
    if node.cf_url.is_some() || node.github_raw_url.is_some() {
        return Err(malformed(&node.path, "directory carries download URLs"));
    }

    let mut files = Vec::new();
    for child in node.files.unwrap_or_default() {
        check_placement(&child, Some(&node.path), seen)?;
        if child.files.as_ref().is_some_and(|f| !f.is_empty())
            || child.dirs.as_ref().is_some_and(|d| !d.is_empty())
        {
            return Err(malformed(&child.path, "file carries children"));
        }
        let (Some(mirror_url), Some(origin_url)) = (child.cf_url, child.github_raw_url) else {
            return Err(malformed(&child.path, "file is missing a download URL"));
        };
        files.push(FileLeaf {
            name: child.name,
            path: child.path,
            size: child.size,
            origin_url,
            mirror_url,
        });
    }

    let mut dirs = Vec::new();
    for child in node.dirs.unwrap_or_default() {
        dirs.push(convert_dir(child, Some(&node.path), seen)?);
    }

    Ok(DirectoryNode {
        name: node.name,
        path: node.path,
        files,
        dirs,
    })
}
