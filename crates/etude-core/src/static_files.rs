// src/static_files.rs
//! Document-root resolution and read-only file mappings.

use crate::error::{EtudeError, EtudeResult};
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

/// Outcome of resolving a request path against the document root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    File { path: PathBuf, len: usize },
    /// Exists and is readable but has no bytes to map.
    Empty,
    NotFound,
    Forbidden,
    Directory,
}

#[derive(Debug, Clone)]
pub struct DocRoot {
    root: PathBuf,
}

impl DocRoot {
    /// Canonicalizes `path`, which must name an existing directory.
    pub fn new(path: impl AsRef<Path>) -> EtudeResult<Self> {
        let path = path.as_ref();
        let root = path.canonicalize().map_err(|e| {
            EtudeError::InvalidConfig(format!("document root {}: {e}", path.display()))
        })?;
        if !root.is_dir() {
            return Err(EtudeError::InvalidConfig(format!(
                "document root {} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, url_path: &str) -> Resolved {
        if url_path.split('/').any(|segment| segment == "..") {
            return Resolved::Forbidden;
        }
        let candidate = self.root.join(url_path.trim_start_matches('/'));

        let Ok(meta) = std::fs::metadata(&candidate) else {
            return Resolved::NotFound;
        };
        // Symlinks may point anywhere; only the resolved location counts.
        let Ok(real) = candidate.canonicalize() else {
            return Resolved::NotFound;
        };
        if !real.starts_with(&self.root) {
            return Resolved::Forbidden;
        }
        if meta.permissions().mode() & 0o004 == 0 {
            return Resolved::Forbidden;
        }
        if meta.is_dir() {
            return Resolved::Directory;
        }

        match usize::try_from(meta.len()) {
            Ok(0) => Resolved::Empty,
            Ok(len) => Resolved::File { path: real, len },
            Err(_) => Resolved::Forbidden,
        }
    }
}

/// Private read-only mapping of a whole file. Unmapped on drop.
#[derive(Debug)]
pub struct MappedFile {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is read-only and owned by exactly one connection at a time.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    pub fn open(path: &Path, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }
        let file = File::open(path)?;
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        Ok(Self { ptr, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn root_with_files() -> (tempfile::TempDir, DocRoot) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<h1>hi</h1>").unwrap();
        fs::write(dir.path().join("empty.html"), "").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let root = DocRoot::new(dir.path()).unwrap();
        (dir, root)
    }

    #[test]
    fn resolves_regular_file() {
        let (_dir, root) = root_with_files();
        match root.resolve("/index.html") {
            Resolved::File { path, len } => {
                assert_eq!(len, 11);
                assert!(path.starts_with(root.path()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn classifies_missing_empty_and_directories() {
        let (_dir, root) = root_with_files();
        assert_eq!(root.resolve("/nope.html"), Resolved::NotFound);
        assert_eq!(root.resolve("/empty.html"), Resolved::Empty);
        assert_eq!(root.resolve("/sub"), Resolved::Directory);
        assert_eq!(root.resolve("/"), Resolved::Directory);
    }

    #[test]
    fn rejects_traversal() {
        let (_dir, root) = root_with_files();
        assert_eq!(root.resolve("/../etc/passwd"), Resolved::Forbidden);
        assert_eq!(root.resolve("/sub/../index.html"), Resolved::Forbidden);
    }

    #[test]
    fn rejects_symlink_escape() {
        let (dir, root) = root_with_files();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("link"))
            .unwrap();
        assert_eq!(root.resolve("/link"), Resolved::Forbidden);
    }

    #[test]
    fn rejects_files_not_world_readable() {
        let (dir, root) = root_with_files();
        let private = dir.path().join("private.html");
        fs::write(&private, "p").unwrap();
        fs::set_permissions(&private, fs::Permissions::from_mode(0o600)).unwrap();
        assert_eq!(root.resolve("/private.html"), Resolved::Forbidden);
    }

    #[test]
    fn root_must_be_a_directory() {
        let (dir, _root) = root_with_files();
        assert!(DocRoot::new(dir.path().join("index.html")).is_err());
        assert!(DocRoot::new(dir.path().join("missing")).is_err());
    }

    #[test]
    fn mapping_exposes_file_bytes() {
        let (dir, _root) = root_with_files();
        let map = MappedFile::open(&dir.path().join("index.html"), 11).unwrap();
        assert_eq!(map.as_slice(), b"<h1>hi</h1>");
        assert_eq!(map.len(), 11);
        assert!(MappedFile::open(&dir.path().join("empty.html"), 0).is_err());
    }
}
