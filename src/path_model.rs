//! Backend-agnostic remote paths and listing normalization
//!
//! SMB shares address files as `dir\file` relative to the share root, WebDAV
//! collections as `/dir/file` relative to the DAV root. `RemotePath` keeps the
//! segments and the flavor apart so the two separators never mix.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use crate::providers::{Entry, EntryKind, VaultError};

/// Addressing convention of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathFlavor {
    /// Share-relative, backslash separated
    Smb,
    /// Root-relative, slash separated
    Cloud,
}

impl PathFlavor {
    /// Separator used when rendering a path for this backend
    pub fn separator(self) -> char {
        match self {
            PathFlavor::Smb => '\\',
            PathFlavor::Cloud => '/',
        }
    }

    /// SMB servers reject both slashes inside a name; WebDAV only `/`.
    fn is_separator(self, c: char) -> bool {
        match self {
            PathFlavor::Smb => c == '\\' || c == '/',
            PathFlavor::Cloud => c == '/',
        }
    }
}

/// Validate a single name for the given backend.
///
/// Rejects empty names, the `.`/`..` pseudo-entries, NUL and any separator
/// character of the target backend.
pub fn normalize(raw_name: &str, flavor: PathFlavor) -> Result<String, VaultError> {
    if raw_name.is_empty() {
        return Err(VaultError::InvalidName("empty name".to_string()));
    }
    if raw_name == "." || raw_name == ".." {
        return Err(VaultError::InvalidName(format!("pseudo-entry '{}'", raw_name)));
    }
    if raw_name.chars().any(|c| c == '\0' || flavor.is_separator(c)) {
        return Err(VaultError::InvalidName(format!(
            "'{}' contains a path separator",
            raw_name
        )));
    }
    Ok(raw_name.to_string())
}

/// Join a validated name onto `parent`.
pub fn join_path(parent: &RemotePath, name: &str) -> Result<RemotePath, VaultError> {
    let name = normalize(name, parent.flavor)?;
    let mut segments = parent.segments.clone();
    segments.push(name);
    Ok(RemotePath {
        flavor: parent.flavor,
        segments,
    })
}

/// A location on one backend, stored as validated segments
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemotePath {
    flavor: PathFlavor,
    segments: Vec<String>,
}

impl RemotePath {
    pub fn root(flavor: PathFlavor) -> Self {
        Self {
            flavor,
            segments: Vec::new(),
        }
    }

    /// Parse user or wire input. Empty segments and `.` are dropped; `..` is
    /// refused rather than resolved.
    pub fn parse(flavor: PathFlavor, raw: &str) -> Result<Self, VaultError> {
        let mut segments = Vec::new();
        for part in raw.split(|c| flavor.is_separator(c)) {
            match part {
                "" | "." => continue,
                ".." => {
                    return Err(VaultError::InvalidName(format!(
                        "'{}' escapes its parent",
                        raw
                    )))
                }
                name => segments.push(normalize(name, flavor)?),
            }
        }
        Ok(Self { flavor, segments })
    }

    pub fn flavor(&self) -> PathFlavor {
        self.flavor
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment, `None` at the root
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<RemotePath> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            flavor: self.flavor,
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn join(&self, name: &str) -> Result<RemotePath, VaultError> {
        join_path(self, name)
    }

    /// Whether `other` sits directly inside this directory
    pub fn is_parent_of(&self, other: &RemotePath) -> bool {
        other.flavor == self.flavor
            && other.segments.len() == self.segments.len() + 1
            && other.segments.starts_with(&self.segments)
    }

    /// Render in the backend's native form: `dir\file` for SMB, `/dir/file`
    /// for cloud.
    pub fn to_wire(&self) -> String {
        let sep = self.flavor.separator().to_string();
        match self.flavor {
            PathFlavor::Smb => self.segments.join(&sep),
            PathFlavor::Cloud => format!("/{}", self.segments.join(&sep)),
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Ordering contract for listings: directories first, then case-insensitive
/// name. Exact name breaks ties so the order is total.
pub fn listing_order(a: &Entry, b: &Entry) -> Ordering {
    let rank = |e: &Entry| match e.kind() {
        EntryKind::Directory => 0,
        EntryKind::File => 1,
    };
    rank(a)
        .cmp(&rank(b))
        .then_with(|| a.name().to_lowercase().cmp(&b.name().to_lowercase()))
        .then_with(|| a.name().cmp(b.name()))
}

/// Deduplicate by name (first seen wins) and apply `listing_order`.
pub fn finalize_listing(entries: impl IntoIterator<Item = Entry>) -> Vec<Entry> {
    let mut seen = HashSet::new();
    let mut out: Vec<Entry> = entries
        .into_iter()
        .filter(|e| seen.insert(e.name().to_string()))
        .collect();
    out.sort_by(listing_order);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{BackendId, RemoteRef};

    fn entry(name: &str, kind: EntryKind) -> Entry {
        let parent = RemoteRef::new(BackendId::new("test://"), RemotePath::root(PathFlavor::Cloud));
        Entry::child(&parent, name, kind, None, None).unwrap()
    }

    #[test]
    fn test_normalize_rejects_pseudo_entries() {
        assert!(normalize(".", PathFlavor::Smb).is_err());
        assert!(normalize("..", PathFlavor::Cloud).is_err());
        assert!(normalize("", PathFlavor::Cloud).is_err());
        assert_eq!(normalize("...", PathFlavor::Cloud).unwrap(), "...");
    }

    #[test]
    fn test_normalize_separators_per_backend() {
        assert!(normalize(r"a\b", PathFlavor::Smb).is_err());
        assert!(normalize("a/b", PathFlavor::Smb).is_err());
        assert!(normalize("a/b", PathFlavor::Cloud).is_err());
        assert_eq!(normalize(r"a\b", PathFlavor::Cloud).unwrap(), r"a\b");
    }

    #[test]
    fn test_join_never_mixes_separators() {
        let smb = RemotePath::parse(PathFlavor::Smb, "photos/2024").unwrap();
        assert_eq!(smb.join("img.jpg").unwrap().to_wire(), r"photos\2024\img.jpg");

        let cloud = RemotePath::parse(PathFlavor::Cloud, "/photos/2024/").unwrap();
        assert_eq!(cloud.join("img.jpg").unwrap().to_wire(), "/photos/2024/img.jpg");
        assert_eq!(RemotePath::root(PathFlavor::Cloud).to_wire(), "/");
        assert_eq!(RemotePath::root(PathFlavor::Smb).to_wire(), "");
    }

    #[test]
    fn test_parse_refuses_parent_escape() {
        assert!(RemotePath::parse(PathFlavor::Cloud, "/a/../b").is_err());
        let p = RemotePath::parse(PathFlavor::Cloud, "/a/./b").unwrap();
        assert_eq!(p.segments(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_parent_and_name() {
        let p = RemotePath::parse(PathFlavor::Smb, r"media\clips\a.mp4").unwrap();
        assert_eq!(p.name(), Some("a.mp4"));
        let parent = p.parent().unwrap();
        assert_eq!(parent.to_wire(), r"media\clips");
        assert!(parent.is_parent_of(&p));
        assert!(RemotePath::root(PathFlavor::Smb).parent().is_none());
    }

    #[test]
    fn test_finalize_orders_dirs_first_case_insensitive() {
        let listing = finalize_listing(vec![
            entry("b.jpg", EntryKind::File),
            entry("A", EntryKind::Directory),
            entry("a.jpg", EntryKind::File),
            entry("zeta", EntryKind::Directory),
            entry("B.png", EntryKind::File),
        ]);
        let names: Vec<&str> = listing.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["A", "zeta", "a.jpg", "b.jpg", "B.png"]);
    }

    #[test]
    fn test_finalize_keeps_first_duplicate() {
        let listing = finalize_listing(vec![
            entry("clip.mp4", EntryKind::File),
            entry("clip.mp4", EntryKind::Directory),
        ]);
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].kind(), EntryKind::File);
    }
}
