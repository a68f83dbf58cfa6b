//! Keyed container files with twin-file redundancy.
//!
//! File layout:
//!
//! ```text
//! "TDF$" | i32 LE version | segments (u32 BE length + bytes)* | md5 (16)
//! md5 = MD5(segments | i32 LE data size | i32 LE version | "TDF$")
//! ```
//!
//! Twin-safe containers live in two files, `<name>0` and `<name>1`. The
//! newer one (by modification time) is authoritative. Writes always go to
//! the other twin and only then delete the previous authoritative one, so a
//! crash mid-write leaves the last good copy untouched. A twin written by a
//! newer build is never replaced or deleted; writes go to our own twin.
//!
//! Every read failure (missing file, bad magic, version newer than the
//! running app, checksum mismatch, I/O error) degrades to "absent".

use std::io;
use std::path::{Path, PathBuf};

use rand::{rngs::OsRng, RngCore};
use tracing::{debug, warn};

use crate::crypto::{decrypt_local, md5, EncryptedDescriptor, LocalKey};
use crate::fs::FileSystem;
use crate::stream::{StreamReader, StreamWriter};

/// Random 64-bit name of a container file
pub type FileKey = u64;

/// Container magic
pub const TDF_MAGIC: [u8; 4] = *b"TDF$";

const HEADER_SIZE: usize = 8;
const CHECKSUM_SIZE: usize = 16;

/// Error types for container operations
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("Container too short: {0} bytes")]
    TooShort(usize),
    #[error("Bad container magic")]
    BadMagic,
    #[error("Container version {found} is newer than running version {running}")]
    VersionTooNew { found: i32, running: i32 },
    #[error("Container checksum mismatch")]
    ChecksumMismatch,
    #[error("Every copy of {0} belongs to a newer build")]
    OwnedByNewer(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// 16 uppercase hex characters, low nibble first
#[must_use]
pub fn to_file_part(key: FileKey) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut value = key;
    let mut result = String::with_capacity(16);
    for _ in 0..16 {
        result.push(HEX[(value & 0x0F) as usize] as char);
        value >>= 4;
    }
    result
}

/// Key of a profile directory: first 8 bytes of MD5 of the data name
#[must_use]
pub fn profile_key(data_name: &str) -> FileKey {
    let digest = md5(&[data_name.as_bytes()]);
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(first)
}

/// Which root a container lives under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// App-wide directory (settings, legacy files)
    Base,
    /// Per-profile directory
    User,
}

/// Location and redundancy of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOptions {
    pub path: PathKind,
    /// Twin-safe (`0`/`1`) or single file (`0` only)
    pub safe: bool,
}

impl FileOptions {
    /// Twin-safe file in the profile directory
    pub const USER: Self = Self { path: PathKind::User, safe: true };
    /// Single file in the profile directory (re-downloadable blobs)
    pub const USER_SINGLE: Self = Self { path: PathKind::User, safe: false };
    /// Twin-safe file in the base directory
    pub const BASE: Self = Self { path: PathKind::Base, safe: true };
}

/// Paths of one container's twins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub first: PathBuf,
    pub second: Option<PathBuf>,
}

impl ContainerHandle {
    #[must_use]
    pub fn new(dir: &Path, name: &str, safe: bool) -> Self {
        Self {
            first: dir.join(format!("{name}0")),
            second: safe.then(|| dir.join(format!("{name}1"))),
        }
    }

    /// All possible paths of this container
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.first).chain(self.second.as_ref())
    }

    /// Existing twins, freshest first; ties keep `0` before `1`
    pub fn read_order<F: FileSystem + ?Sized>(&self, fs: &F) -> Vec<PathBuf> {
        let mut existing: Vec<(PathBuf, Option<std::time::SystemTime>)> = self
            .paths()
            .filter(|p| fs.exists(p))
            .map(|p| (p.clone(), fs.modified(p)))
            .collect();
        existing.sort_by(|a, b| b.1.cmp(&a.1));
        existing.into_iter().map(|(p, _)| p).collect()
    }

    /// The twin a read should trust first
    pub fn choose_authoritative<F: FileSystem + ?Sized>(&self, fs: &F) -> Option<PathBuf> {
        self.read_order(fs).into_iter().next()
    }

    /// Target of the next write and the twin to delete once it succeeded
    pub fn write_target<F: FileSystem + ?Sized>(&self, fs: &F) -> (PathBuf, Option<PathBuf>) {
        let Some(second) = &self.second else {
            return (self.first.clone(), None);
        };
        match self.read_order(fs).as_slice() {
            [] => (self.first.clone(), None),
            [only] => {
                let target = if *only == self.first { second.clone() } else { self.first.clone() };
                (target, Some(only.clone()))
            }
            [authoritative, stale, ..] => (stale.clone(), Some(authoritative.clone())),
        }
    }
}

/// A validated container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerFile {
    /// App version that wrote the file
    pub version: i32,
    /// Segment bytes (without header and checksum)
    pub data: Vec<u8>,
}

impl ContainerFile {
    #[must_use]
    pub fn reader(&self) -> StreamReader<'_> {
        StreamReader::new(&self.data)
    }
}

/// A decrypted single-segment container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedFile {
    pub version: i32,
    pub data: Vec<u8>,
}

impl DecryptedFile {
    #[must_use]
    pub fn reader(&self) -> StreamReader<'_> {
        StreamReader::new(&self.data)
    }
}

/// Frame segments into container bytes
#[must_use]
pub fn encode_container(version: i32, segments: &[&[u8]]) -> Vec<u8> {
    let mut data = StreamWriter::new();
    for segment in segments {
        data.write_bytes(segment);
    }
    let data = data.into_bytes();
    let checksum = md5(&[
        &data,
        &(data.len() as i32).to_le_bytes(),
        &version.to_le_bytes(),
        &TDF_MAGIC,
    ]);

    let mut out = Vec::with_capacity(HEADER_SIZE + data.len() + CHECKSUM_SIZE);
    out.extend_from_slice(&TDF_MAGIC);
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&checksum);
    out
}

/// Validate container bytes
pub fn decode_container(bytes: &[u8], running_version: i32) -> Result<ContainerFile, ContainerError> {
    if bytes.len() < HEADER_SIZE + CHECKSUM_SIZE {
        return Err(ContainerError::TooShort(bytes.len()));
    }
    if bytes[..4] != TDF_MAGIC {
        return Err(ContainerError::BadMagic);
    }
    let mut version_bytes = [0u8; 4];
    version_bytes.copy_from_slice(&bytes[4..HEADER_SIZE]);
    let version = i32::from_le_bytes(version_bytes);
    if version > running_version {
        return Err(ContainerError::VersionTooNew { found: version, running: running_version });
    }

    let data = &bytes[HEADER_SIZE..bytes.len() - CHECKSUM_SIZE];
    let expected = md5(&[
        data,
        &(data.len() as i32).to_le_bytes(),
        &version_bytes,
        &TDF_MAGIC,
    ]);
    if expected[..] != bytes[bytes.len() - CHECKSUM_SIZE..] {
        return Err(ContainerError::ChecksumMismatch);
    }

    Ok(ContainerFile { version, data: data.to_vec() })
}

/// Reads and writes containers under the base and profile directories
#[derive(Clone)]
pub struct Containers<F: FileSystem> {
    fs: F,
    base_path: PathBuf,
    user_path: PathBuf,
    app_version: i32,
}

impl<F: FileSystem> Containers<F> {
    pub fn new(fs: F, base_path: PathBuf, user_path: PathBuf, app_version: i32) -> Self {
        Self { fs, base_path, user_path, app_version }
    }

    #[must_use]
    pub fn fs(&self) -> &F {
        &self.fs
    }

    #[must_use]
    pub fn app_version(&self) -> i32 {
        self.app_version
    }

    #[must_use]
    pub fn dir(&self, kind: PathKind) -> &Path {
        match kind {
            PathKind::Base => &self.base_path,
            PathKind::User => &self.user_path,
        }
    }

    #[must_use]
    pub fn handle(&self, name: &str, options: FileOptions) -> ContainerHandle {
        ContainerHandle::new(self.dir(options.path), name, options.safe)
    }

    /// Whether any twin of the container exists on disk
    #[must_use]
    pub fn exists(&self, name: &str, options: FileOptions) -> bool {
        self.handle(name, options).paths().any(|p| self.fs.exists(p))
    }

    /// Write segments as a container, respecting the twin discipline
    pub fn write(&self, name: &str, options: FileOptions, segments: &[&[u8]]) -> Result<(), ContainerError> {
        self.fs.create_dir_all(self.dir(options.path))?;
        let handle = self.handle(name, options);
        let (mut target, mut stale) = handle.write_target(&self.fs);

        // Files of a newer build are neither overwritten nor deleted
        if self.is_from_newer(&target) {
            match stale.take() {
                Some(other) if !self.is_from_newer(&other) => {
                    debug!(path = %target.display(), "keeping twin written by a newer build");
                    target = other;
                }
                _ => return Err(ContainerError::OwnedByNewer(name.to_owned())),
            }
        }
        let stale = stale.filter(|path| !self.is_from_newer(path));

        let bytes = encode_container(self.app_version, segments);
        self.fs.write_file(&target, &bytes)?;

        if let Some(stale) = stale {
            if let Err(e) = self.fs.remove_file(&stale) {
                debug!(path = %stale.display(), error = %e, "could not remove stale twin");
            }
        }
        Ok(())
    }

    fn is_from_newer(&self, path: &Path) -> bool {
        self.fs.read_file(path).is_ok_and(|bytes| {
            matches!(
                decode_container(&bytes, self.app_version),
                Err(ContainerError::VersionTooNew { .. })
            )
        })
    }

    /// Read the freshest valid twin
    pub fn read(&self, name: &str, options: FileOptions) -> Option<ContainerFile> {
        let handle = self.handle(name, options);
        let order = handle.read_order(&self.fs);

        for (i, path) in order.iter().enumerate() {
            let bytes = match self.fs.read_file(path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not read container");
                    continue;
                }
            };
            match decode_container(&bytes, self.app_version) {
                Ok(file) => {
                    for other in order.iter().skip(i + 1).chain(order.iter().take(i)) {
                        if self.is_from_newer(other) {
                            continue;
                        }
                        if let Err(e) = self.fs.remove_file(other) {
                            debug!(path = %other.display(), error = %e, "could not remove stale twin");
                        }
                    }
                    return Some(file);
                }
                Err(e @ ContainerError::VersionTooNew { .. }) => {
                    // Left on disk for a newer build
                    warn!(path = %path.display(), error = %e, "skipping container");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid container");
                }
            }
        }
        None
    }

    /// Delete every twin; idempotent
    pub fn clear(&self, name: &str, options: FileOptions) {
        for path in self.handle(name, options).paths() {
            if self.fs.exists(path) {
                if let Err(e) = self.fs.remove_file(path) {
                    warn!(path = %path.display(), error = %e, "could not remove container");
                }
            }
        }
    }

    /// Random non-zero key whose files do not exist yet
    #[must_use]
    pub fn generate_key(&self, options: FileOptions) -> FileKey {
        loop {
            let key = OsRng.next_u64();
            if key != 0 && !self.exists(&to_file_part(key), options) {
                return key;
            }
        }
    }

    /// Write an encrypted record stream as a single-segment container
    pub fn write_encrypted(
        &self,
        key: FileKey,
        options: FileOptions,
        data: &EncryptedDescriptor,
        local_key: &LocalKey,
    ) -> Result<(), ContainerError> {
        let encrypted = data.encrypt(local_key);
        self.write(&to_file_part(key), options, &[&encrypted])
    }

    /// Read and decrypt a single-segment container
    pub fn read_encrypted(&self, key: FileKey, options: FileOptions, local_key: &LocalKey) -> Option<DecryptedFile> {
        let name = to_file_part(key);
        let file = self.read(&name, options)?;
        let encrypted = match file.reader().read_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %name, error = %e, "malformed encrypted container");
                return None;
            }
        };
        match decrypt_local(&encrypted, local_key) {
            Ok(data) => Some(DecryptedFile { version: file.version, data }),
            Err(e) => {
                warn!(key = %name, error = %e, "could not decrypt container");
                None
            }
        }
    }

    /// Remove a keyed container
    pub fn clear_key(&self, key: FileKey, options: FileOptions) {
        self.clear(&to_file_part(key), options);
    }

    /// Whether some twin carries a version newer than the running one
    #[must_use]
    pub fn written_by_newer(&self, name: &str, options: FileOptions) -> bool {
        self.handle(name, options).paths().any(|path| self.is_from_newer(path))
    }

    /// Remove an unreadable keyed container, leaving files of newer builds alone
    ///
    /// Returns whether the files were removed.
    pub fn discard_key(&self, key: FileKey, options: FileOptions) -> bool {
        let name = to_file_part(key);
        if self.written_by_newer(&name, options) {
            debug!(key = %name, "keeping container written by a newer build");
            return false;
        }
        self.clear(&name, options);
        true
    }
}

// ============================================================
// TESTS
// ============================================================
