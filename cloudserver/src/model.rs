//! Records returned to callers. These are the design-level response shapes;
//! the transport layer serializes them as it sees fit.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRef {
    pub host: String,
    pub key: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectRecord {
    pub name: String,
    pub extension: Option<String>,
    pub mime_type: String,
    pub file: FileRef,
    pub metadata: BTreeMap<String, String>,
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectoryRecord {
    pub name: String,
    /// Directory path relative to the owner prefix.
    pub prefix: String,
    pub is_encrypted: bool,
    /// Encrypted and no valid unlock session attached.
    pub is_locked: bool,
    pub is_hidden: bool,
    /// Hidden and no valid reveal session attached.
    pub is_concealed: bool,
    /// Up to four image objects sampled across sub-folders.
    pub thumbnails: Vec<ObjectRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Breadcrumb {
    pub name: String,
    /// Path of this crumb relative to the owner prefix.
    pub path: String,
}

/// Assemble the breadcrumb trail for a path: root first, the path itself
/// last. The root crumb has an empty path.
pub fn breadcrumbs_for(path: &str) -> Vec<Breadcrumb> {
    let normalized = utils::path::normalize_dir(path);
    let mut crumbs = vec![Breadcrumb {
        name: String::new(),
        path: String::new(),
    }];
    let mut current = String::new();
    for segment in normalized.split('/').filter(|s| !s.is_empty()) {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);
        crumbs.push(Breadcrumb {
            name: segment.to_string(),
            path: current.clone(),
        });
    }
    crumbs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breadcrumbs_walk_down() {
        let crumbs = breadcrumbs_for("a/b/c");
        let paths: Vec<_> = crumbs.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["", "a", "a/b", "a/b/c"]);
        assert_eq!(crumbs[3].name, "c");
    }

    #[test]
    fn root_breadcrumb_only() {
        let crumbs = breadcrumbs_for("");
        assert_eq!(crumbs.len(), 1);
        assert_eq!(crumbs[0].path, "");
    }
}
