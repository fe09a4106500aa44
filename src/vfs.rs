//! Virtual filesystem root
//!
//! Clients see a tree rooted at `/`. Every path they send is normalized
//! lexically against their current directory before being joined onto the
//! real root, so `..` stops at `/` and nothing outside the root is
//! reachable by name.

use std::path::{Path, PathBuf};

/// A real directory exposed to clients as `/`.
#[derive(Debug, Clone)]
pub struct VirtualRoot {
    root: PathBuf,
}

impl VirtualRoot {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The real directory backing `/`.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalize `path` against the virtual directory `cwd`.
    ///
    /// The result is always absolute (starts with `/`) and contains no
    /// `.` or `..` segments.
    #[must_use]
    pub fn normalize(cwd: &str, path: &str) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if !path.starts_with('/') {
            parts.extend(cwd.split('/').filter(|s| !s.is_empty() && *s != "."));
        }
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                other => parts.push(other),
            }
        }
        format!("/{}", parts.join("/"))
    }

    /// Map an already normalized virtual path onto the real filesystem.
    #[must_use]
    pub fn to_real(&self, virtual_path: &str) -> PathBuf {
        virtual_path
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(self.root.clone(), |acc, segment| acc.join(segment))
    }

    /// Normalize `path` against `cwd` and return both the virtual and
    /// the real path.
    #[must_use]
    pub fn resolve(&self, cwd: &str, path: &str) -> (String, PathBuf) {
        let virtual_path = Self::normalize(cwd, path);
        let real = self.to_real(&virtual_path);
        (virtual_path, real)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_join_cwd() {
        assert_eq!(VirtualRoot::normalize("/a", "b/c"), "/a/b/c");
        assert_eq!(VirtualRoot::normalize("/", "file.txt"), "/file.txt");
    }

    #[test]
    fn absolute_paths_ignore_cwd() {
        assert_eq!(VirtualRoot::normalize("/a/b", "/x"), "/x");
    }

    #[test]
    fn dot_segments_collapse() {
        assert_eq!(VirtualRoot::normalize("/a/b", "../c/./d"), "/a/c/d");
        assert_eq!(VirtualRoot::normalize("/", "."), "/");
        assert_eq!(VirtualRoot::normalize("/a", ""), "/a");
    }

    #[test]
    fn parent_stops_at_root() {
        assert_eq!(VirtualRoot::normalize("/", "../../etc/passwd"), "/etc/passwd");
        assert_eq!(VirtualRoot::normalize("/a", "../../.."), "/");
    }

    #[test]
    fn real_path_stays_under_root() {
        let vroot = VirtualRoot::new("/srv/ftp");
        let (virt, real) = vroot.resolve("/", "../../etc/passwd");
        assert_eq!(virt, "/etc/passwd");
        assert_eq!(real, PathBuf::from("/srv/ftp/etc/passwd"));
        assert_eq!(vroot.to_real("/"), PathBuf::from("/srv/ftp"));
    }
}
