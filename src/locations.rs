//! Locations file: local file paths, content key aliases and the web-file
//! index (which itself lives with the other blob indices).
//!
//! Payload layout:
//!
//! ```text
//! entries    (u64 first | u64 second | u32 type | string name |
//!             [bytes bookmark, version > 9013] | datetime | u32 size)*
//! end mark   0 | 0 | 0 | "" | [""] | datetime | 0
//! aliases    u32 count | (u64 u64 → u64 u64)*
//! web files  u32 count | (string url | u64 file key | i32 size)*
//! ```

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::blob::{BlobIndex, ContentKey, FileDesc, FileFormat};
use crate::crypto::EncryptedDescriptor;
use crate::stream::{StreamError, StreamReader};

/// First version that stores a bookmark per location
pub const BOOKMARK_MIN_VERSION: i32 = 9014;

/// Where a downloaded file was saved locally
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileLocation {
    pub format: FileFormat,
    pub name: String,
    /// Sandbox bookmark, opaque
    pub bookmark: Vec<u8>,
    /// Modification time in unix milliseconds
    pub modified: i64,
    pub size: u32,
}

impl FileLocation {
    #[must_use]
    pub fn new(format: FileFormat, name: impl Into<String>, modified: i64, size: u32) -> Self {
        Self {
            format,
            name: name.into(),
            bookmark: Vec::new(),
            modified,
            size,
        }
    }
}

/// Contents of the locations file
#[derive(Debug, Clone, Default)]
pub struct Locations {
    files: HashMap<ContentKey, FileLocation>,
    by_name: HashMap<String, ContentKey>,
    aliases: HashMap<ContentKey, ContentKey>,
}

impl Locations {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// No file locations and no aliases
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.aliases.is_empty()
    }

    /// Follow at most one alias hop
    #[must_use]
    pub fn resolve(&self, key: ContentKey) -> ContentKey {
        self.aliases.get(&key).copied().unwrap_or(key)
    }

    /// Point `from` at `to`, replacing any previous alias
    ///
    /// Rejects self-aliases and targets that are aliases themselves, so no
    /// cycle can form.
    pub fn add_alias(&mut self, from: ContentKey, to: ContentKey) -> bool {
        if from == to || self.aliases.contains_key(&to) {
            return false;
        }
        self.aliases.insert(from, to);
        true
    }

    #[must_use]
    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }

    /// Record a local file; returns whether anything changed
    ///
    /// A file already known under another key turns `key` into an alias of
    /// that key instead of duplicating the entry.
    pub fn write_file_location(&mut self, key: ContentKey, location: FileLocation) -> bool {
        if location.name.is_empty() {
            return false;
        }
        let key = self.resolve(key);

        if let Some(&existing) = self.by_name.get(&location.name) {
            if self.files.get(&existing) == Some(&location) {
                if existing != key {
                    return self.add_alias(key, existing);
                }
                return false;
            }
            if existing != key {
                self.files.remove(&existing);
                self.by_name.remove(&location.name);
            }
        }

        if let Some(previous) = self.files.get(&key) {
            if previous.name != location.name {
                self.by_name.remove(&previous.name);
            }
        }
        self.by_name.insert(location.name.clone(), key);
        self.files.insert(key, location);
        true
    }

    #[must_use]
    pub fn file_location(&self, key: ContentKey) -> Option<&FileLocation> {
        self.files.get(&self.resolve(key))
    }

    pub fn remove_file_location(&mut self, key: ContentKey) -> Option<FileLocation> {
        let location = self.files.remove(&self.resolve(key))?;
        self.by_name.remove(&location.name);
        Some(location)
    }

    #[must_use]
    pub fn file_location_count(&self) -> usize {
        self.files.len()
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.by_name.clear();
        self.aliases.clear();
    }

    /// Serialize together with the web-file index
    #[must_use]
    pub fn encode(&self, web: &BlobIndex<String>, app_version: i32) -> EncryptedDescriptor {
        let mut out = EncryptedDescriptor::new();
        let with_bookmark = app_version >= BOOKMARK_MIN_VERSION;

        let mut files: Vec<_> = self.files.iter().collect();
        files.sort_by_key(|(key, _)| **key);
        for (key, location) in files {
            out.stream.write_u64(key.first);
            out.stream.write_u64(key.second);
            out.stream.write_u32(location.format.to_u32());
            out.stream.write_string(&location.name);
            if with_bookmark {
                out.stream.write_bytes(&location.bookmark);
            }
            out.stream.write_date_time(location.modified);
            out.stream.write_u32(location.size);
        }

        out.stream.write_u64(0);
        out.stream.write_u64(0);
        out.stream.write_u32(0);
        out.stream.write_string("");
        if with_bookmark {
            out.stream.write_bytes(&[]);
        }
        out.stream.write_date_time(now_unix_millis());
        out.stream.write_u32(0);

        out.stream.write_u32(self.aliases.len() as u32);
        for (from, to) in &self.aliases {
            out.stream.write_u64(from.first);
            out.stream.write_u64(from.second);
            out.stream.write_u64(to.first);
            out.stream.write_u64(to.second);
        }

        out.stream.write_u32(web.len() as u32);
        for (url, desc) in web.iter() {
            out.stream.write_string(url);
            out.stream.write_u64(desc.key);
            out.stream.write_i32(desc.size);
        }
        out
    }

    /// Best effort: a truncated tail keeps everything read before it
    #[must_use]
    pub fn decode(data: &[u8], version: i32) -> (Self, BlobIndex<String>) {
        let mut result = Self::new();
        let mut web = BlobIndex::new();
        let mut reader = StreamReader::new(data);
        if let Err(e) = result.read_into(&mut reader, &mut web, version) {
            warn!(error = %e, "locations file truncated");
        }
        (result, web)
    }

    fn read_into(
        &mut self,
        reader: &mut StreamReader<'_>,
        web: &mut BlobIndex<String>,
        version: i32,
    ) -> Result<(), StreamError> {
        let mut end_mark_found = false;
        while !reader.at_end() {
            let first = reader.read_u64()?;
            let second = reader.read_u64()?;
            let format = reader.read_u32()?;
            let name = reader.read_string()?;
            let bookmark = if version >= BOOKMARK_MIN_VERSION {
                reader.read_bytes()?
            } else {
                Vec::new()
            };
            let modified = reader.read_date_time()?;
            let size = reader.read_u32()?;

            if first == 0 && second == 0 && format == 0 && name.is_empty() && size == 0 {
                end_mark_found = true;
                break;
            }

            let key = ContentKey::new(first, second);
            self.by_name.insert(name.clone(), key);
            self.files.insert(
                key,
                FileLocation {
                    format: FileFormat::from_u32(format),
                    name,
                    bookmark,
                    modified,
                    size,
                },
            );
        }
        if !end_mark_found {
            return Ok(());
        }

        let aliases = reader.read_u32()?;
        for _ in 0..aliases {
            let from = ContentKey::new(reader.read_u64()?, reader.read_u64()?);
            let to = ContentKey::new(reader.read_u64()?, reader.read_u64()?);
            self.aliases.insert(from, to);
        }

        // Older files end before the web-file index
        if reader.at_end() {
            return Ok(());
        }
        let web_files = reader.read_u32()?;
        for _ in 0..web_files {
            let url = reader.read_string()?;
            let key = reader.read_u64()?;
            let size = reader.read_i32()?;
            web.insert(url, FileDesc::new(key, size));
        }
        Ok(())
    }
}

/// Current time in unix milliseconds
#[must_use]
pub fn now_unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
