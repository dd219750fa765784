//! Workspace folders and the path queries made against them.

use std::path::{Path, PathBuf};

use lsp_types::Url;

/// A root directory scoping which files a server considers.
///
/// Two folders are equal iff all of their fields are equal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkspaceFolder {
    /// Short display name, usually the directory name.
    pub name: String,
    /// Absolute filesystem path of the folder.
    pub path: PathBuf,
    /// `file://` URI of the folder.
    pub uri: Url,
}

impl WorkspaceFolder {
    /// Creates a folder from an absolute path, deriving the display name and URI.
    ///
    /// Returns `None` when the path cannot be represented as a `file://` URI (e.g. it is
    /// relative).
    pub fn from_path(path: PathBuf) -> Option<Self> {
        let uri = Url::from_file_path(&path).ok()?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());

        Some(WorkspaceFolder { name, path, uri })
    }

    /// Converts to the wire representation.
    pub fn to_lsp(&self) -> lsp_types::WorkspaceFolder {
        lsp_types::WorkspaceFolder {
            uri: self.uri.clone(),
            name: self.name.clone(),
        }
    }
}

/// Returns `true` when `path` lies inside `folder` (or is `folder` itself).
///
/// The comparison is component-wise, so `/foo/bar-baz` is not inside `/foo/bar`.
pub fn is_subpath_of(path: &Path, folder: &Path) -> bool {
    path.starts_with(folder)
}

/// Computes which folders were added and removed going from `old` to `new`.
///
/// Both result lists preserve the order of the list they were drawn from.
pub fn diff_folders(
    old: &[WorkspaceFolder],
    new: &[WorkspaceFolder],
) -> (Vec<WorkspaceFolder>, Vec<WorkspaceFolder>) {
    let removed = old.iter().filter(|f| !new.contains(f)).cloned().collect();
    let added = new.iter().filter(|f| !old.contains(f)).cloned().collect();
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(path: &str) -> WorkspaceFolder {
        WorkspaceFolder::from_path(PathBuf::from(path)).unwrap()
    }

    #[test]
    fn derives_name_and_uri() {
        let folder = folder("/home/user/project");
        assert_eq!(folder.name, "project");
        assert_eq!(folder.uri.as_str(), "file:///home/user/project");
        assert_eq!(folder.to_lsp().name, "project");
    }

    #[test]
    fn rejects_relative_paths() {
        assert!(WorkspaceFolder::from_path(PathBuf::from("relative/dir")).is_none());
    }

    #[test]
    fn subpath_is_component_wise() {
        assert!(is_subpath_of(Path::new("/foo/bar/baz.rs"), Path::new("/foo/bar")));
        assert!(is_subpath_of(Path::new("/foo/bar"), Path::new("/foo/bar")));
        assert!(!is_subpath_of(Path::new("/foo/bar-baz"), Path::new("/foo/bar")));
        assert!(!is_subpath_of(Path::new("/other"), Path::new("/foo")));
    }

    #[test]
    fn diffs_preserve_incoming_order() {
        let a = folder("/a");
        let b = folder("/b");
        let c = folder("/c");

        let (added, removed) = diff_folders(&[a.clone(), b.clone()], &[b.clone(), c.clone()]);
        assert_eq!(added, vec![c]);
        assert_eq!(removed, vec![a.clone()]);

        let (added, removed) = diff_folders(&[a.clone()], &[a.clone()]);
        assert!(added.is_empty());
        assert!(removed.is_empty());

        let everything = [a, b];
        let (added, removed) = diff_folders(&everything, &[]);
        assert!(added.is_empty());
        assert_eq!(removed, everything);
    }
}
