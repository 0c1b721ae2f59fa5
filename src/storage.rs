//! Filesystem access for video payloads and cover images.
//!
//! Stored names are single path components relative to the upload root. The
//! API never accepts caller-supplied paths; names are generated at upload time
//! and read back from the video record.

use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Component, Path, PathBuf},
    time::SystemTime,
};

use walkdir::WalkDir;

/// Operations the services need from the blob storage.
pub trait BlobStore: Send + Sync {
    /// Opens a stored file for reading.
    fn open(&self, name: &str) -> io::Result<File>;

    /// Size of a stored file in bytes.
    fn size(&self, name: &str) -> io::Result<u64>;

    /// Creates a new file; fails if the name is already taken.
    fn create(&self, name: &str) -> io::Result<File>;

    fn remove(&self, name: &str) -> io::Result<()>;
}

/// [`BlobStore`] rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Creates the root directory if it is missing.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Joins `name` onto the root after checking it is a single plain
    /// component (no separators, no `..`, not absolute).
    pub fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) if part == name => Ok(self.root.join(part)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid stored file name {name:?}"),
            )),
        }
    }

    /// Last modification time of a stored file.
    pub fn modified(&self, name: &str) -> io::Result<SystemTime> {
        fs::metadata(self.resolve(name)?)?.modified()
    }

    /// Names of all regular files directly under the root.
    pub fn file_names(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

impl BlobStore for LocalBlobStore {
    fn open(&self, name: &str) -> io::Result<File> {
        File::open(self.resolve(name)?)
    }

    fn size(&self, name: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.resolve(name)?)?.len())
    }

    fn create(&self, name: &str) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.resolve(name)?)
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(name)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn rejects_names_that_escape_the_root() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path()).unwrap();

        for name in ["../etc/passwd", "/etc/passwd", "a/b.mp4", "..", "", "./x.mp4"] {
            let err = store.resolve(name).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{name}");
        }
        assert_eq!(
            store.resolve("clip.mp4").unwrap(),
            dir.path().join("clip.mp4")
        );
    }

    #[test]
    fn create_open_size_remove() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path().join("uploads")).unwrap();

        let mut file = store.create("clip.mp4").unwrap();
        file.write_all(b"0123456789").unwrap();
        drop(file);

        assert_eq!(store.size("clip.mp4").unwrap(), 10);
        assert!(store.create("clip.mp4").is_err());
        assert_eq!(store.file_names().unwrap(), vec!["clip.mp4".to_string()]);

        store.remove("clip.mp4").unwrap();
        assert_eq!(
            store.open("clip.mp4").unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }
}
