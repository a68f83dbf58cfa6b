//! FileSystem trait for abstracting storage operations.
//!
//! The storage layer works with two backends:
//! - `NativeFs` (std::fs, for real profiles)
//! - `InMemoryFs` (for testing)
//!
//! # Notes
//!
//! - The trait has no security logic; everything written through it is
//!   already encrypted by higher layers (except the legacy flat config)
//! - Modification times drive twin-file freshness, so `InMemoryFs` keeps a
//!   logical clock that advances on every write

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

/// Abstract filesystem operations
pub trait FileSystem: Send + Sync {
    /// Read the whole file
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Replace the file contents
    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Delete a file
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Check whether a file exists
    fn exists(&self, path: &Path) -> bool;

    /// Last modification time, if the file exists
    fn modified(&self, path: &Path) -> Option<SystemTime>;

    /// Create a directory and its parents
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Rename a file
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// List the files directly inside a directory
    fn list_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Filesystem backed by `std::fs`
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeFs;

impl NativeFs {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for NativeFs {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(data)?;
        file.sync_all()
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn modified(&self, path: &Path) -> Option<SystemTime> {
        std::fs::metadata(path).and_then(|m| m.modified()).ok()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn list_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut result = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                result.push(entry.path());
            }
        }
        Ok(result)
    }
}

#[derive(Clone)]
struct MemFile {
    data: Vec<u8>,
    modified: u64,
}

#[derive(Default)]
struct MemState {
    files: HashMap<PathBuf, MemFile>,
    /// Write counters per file (for testing write optimization)
    write_counts: HashMap<PathBuf, usize>,
    tick: u64,
    fail_writes: bool,
}

/// In-memory filesystem for testing
/// Uses Arc<Mutex<...>> so clones share the same underlying storage
/// and can be handed to the background worker
#[derive(Default, Clone)]
pub struct InMemoryFs {
    state: Arc<Mutex<MemState>>,
}

impl InMemoryFs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a copy of file contents (for testing)
    #[must_use]
    pub fn get_file(&self, path: &Path) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).map(|f| f.data.clone())
    }

    /// Overwrite file contents without counting a write (for tampering in tests)
    pub fn put_file(&self, path: &Path, data: Vec<u8>) {
        let mut state = self.state.lock();
        state.tick += 1;
        let modified = state.tick;
        state.files.insert(path.to_path_buf(), MemFile { data, modified });
    }

    /// Force the logical modification time of a file (for twin ordering tests)
    pub fn set_modified(&self, path: &Path, tick: u64) {
        if let Some(file) = self.state.lock().files.get_mut(path) {
            file.modified = tick;
        }
    }

    /// Get write count for a file (for testing write optimization)
    #[must_use]
    pub fn write_count(&self, path: &Path) -> usize {
        *self.state.lock().write_counts.get(path).unwrap_or(&0)
    }

    /// Total writes across all files
    #[must_use]
    pub fn total_writes(&self) -> usize {
        self.state.lock().write_counts.values().sum()
    }

    /// Reset all write counters (for testing)
    pub fn reset_write_counts(&self) {
        self.state.lock().write_counts.clear();
    }

    /// Make every subsequent write fail (simulates a full disk)
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// All file paths, sorted
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.state.lock().files.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Number of files
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display()))
}

impl FileSystem for InMemoryFs {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.get_file(path).ok_or_else(|| not_found(path))
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated write failure"));
        }
        state.tick += 1;
        let modified = state.tick;
        state.files.insert(
            path.to_path_buf(),
            MemFile { data: data.to_vec(), modified },
        );

        // Increment write counter
        *state.write_counts.entry(path.to_path_buf()).or_insert(0) += 1;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.state
            .lock()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    fn exists(&self, path: &Path) -> bool {
        self.state.lock().files.contains_key(path)
    }

    fn modified(&self, path: &Path) -> Option<SystemTime> {
        self.state
            .lock()
            .files
            .get(path)
            .map(|f| SystemTime::UNIX_EPOCH + Duration::from_millis(f.modified))
    }

    fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
        // Directories are implicit
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        let file = state.files.remove(from).ok_or_else(|| not_found(from))?;
        state.files.insert(to.to_path_buf(), file);
        Ok(())
    }

    fn list_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        Ok(self
            .state
            .lock()
            .files
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_fs_read_write() {
        let fs = InMemoryFs::new();
        let path = Path::new("tdata/file0");

        fs.write_file(path, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(fs.read_file(path).unwrap(), vec![1, 2, 3, 4, 5]);

        // Overwrite replaces the whole file
        fs.write_file(path, &[9]).unwrap();
        assert_eq!(fs.read_file(path).unwrap(), vec![9]);
        assert_eq!(fs.write_count(path), 2);
    }

    #[test]
    fn test_in_memory_fs_missing_file() {
        let fs = InMemoryFs::new();
        let path = Path::new("tdata/missing");

        assert!(!fs.exists(path));
        assert!(fs.modified(path).is_none());
        assert_eq!(fs.read_file(path).unwrap_err().kind(), io::ErrorKind::NotFound);
        assert!(fs.remove_file(path).is_err());
    }

    #[test]
    fn test_in_memory_fs_modified_advances() {
        let fs = InMemoryFs::new();
        let a = Path::new("d/a");
        let b = Path::new("d/b");

        fs.write_file(a, b"a").unwrap();
        fs.write_file(b, b"b").unwrap();
        assert!(fs.modified(b).unwrap() > fs.modified(a).unwrap());

        fs.set_modified(b, 0);
        assert!(fs.modified(a).unwrap() > fs.modified(b).unwrap());
    }

    #[test]
    fn test_in_memory_fs_fail_writes() {
        let fs = InMemoryFs::new();
        let path = Path::new("d/x");

        fs.set_fail_writes(true);
        assert!(fs.write_file(path, b"x").is_err());
        assert!(!fs.exists(path));

        fs.set_fail_writes(false);
        fs.write_file(path, b"x").unwrap();
        assert!(fs.exists(path));
    }

    #[test]
    fn test_in_memory_fs_list_and_rename() {
        let fs = InMemoryFs::new();
        fs.write_file(Path::new("d/one"), b"1").unwrap();
        fs.write_file(Path::new("d/two"), b"2").unwrap();
        fs.write_file(Path::new("d/sub/three"), b"3").unwrap();

        let mut listed = fs.list_files(Path::new("d")).unwrap();
        listed.sort();
        assert_eq!(listed, vec![PathBuf::from("d/one"), PathBuf::from("d/two")]);

        fs.rename(Path::new("d/one"), Path::new("d/uno")).unwrap();
        assert!(!fs.exists(Path::new("d/one")));
        assert_eq!(fs.read_file(Path::new("d/uno")).unwrap(), b"1");
    }

    #[test]
    fn test_native_fs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = NativeFs::new();
        let nested = dir.path().join("profile");
        fs.create_dir_all(&nested).unwrap();

        let path = nested.join("A0");
        fs.write_file(&path, b"payload").unwrap();
        assert!(fs.exists(&path));
        assert!(fs.modified(&path).is_some());
        assert_eq!(fs.read_file(&path).unwrap(), b"payload");
        assert_eq!(fs.list_files(&nested).unwrap(), vec![path.clone()]);

        fs.remove_file(&path).unwrap();
        assert!(!fs.exists(&path));
    }
}
