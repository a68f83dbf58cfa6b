//! Media blob indices and record format.
//!
//! Each cached blob lives in its own single-file container under a random
//! FileKey. The profile keeps one index per category mapping a content key
//! to `(FileKey, storage size)`, plus a running total of the sizes.
//!
//! Record layout inside the encrypted payload:
//!
//! ```text
//! images          u64 first | u64 second | u32 format | bytes data
//! stickers/audio  u64 first | u64 second | bytes data
//! web files       string url | bytes data
//! ```

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use crate::container::FileKey;
use crate::crypto::EncryptedDescriptor;
use crate::stream::{string_size, StreamError, StreamReader, StreamWriter};

// ============================================================
// KEYS AND CATEGORIES
// ============================================================

/// Content location key of a cached blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ContentKey {
    pub first: u64,
    pub second: u64,
}

impl ContentKey {
    #[must_use]
    pub const fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }
}

/// Key type usable in a blob index
pub trait BlobKey: Clone + Eq + Hash + Debug + Send + 'static {
    fn write(&self, stream: &mut StreamWriter);
    fn read(reader: &mut StreamReader<'_>) -> Result<Self, StreamError>;
    fn serialized_size(&self) -> usize;
}

impl BlobKey for ContentKey {
    fn write(&self, stream: &mut StreamWriter) {
        stream.write_u64(self.first);
        stream.write_u64(self.second);
    }

    fn read(reader: &mut StreamReader<'_>) -> Result<Self, StreamError> {
        Ok(Self::new(reader.read_u64()?, reader.read_u64()?))
    }

    fn serialized_size(&self) -> usize {
        16
    }
}

/// Web files are keyed by URL
impl BlobKey for String {
    fn write(&self, stream: &mut StreamWriter) {
        stream.write_string(self);
    }

    fn read(reader: &mut StreamReader<'_>) -> Result<Self, StreamError> {
        reader.read_string()
    }

    fn serialized_size(&self) -> usize {
        string_size(self)
    }
}

/// Blob categories with separate indices and totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobCategory {
    Images,
    Stickers,
    Audios,
    WebFiles,
}

impl BlobCategory {
    pub const ALL: [BlobCategory; 4] = [Self::Images, Self::Stickers, Self::Audios, Self::WebFiles];

    /// Only image records carry a file format field
    #[must_use]
    pub fn has_format(self) -> bool {
        self == Self::Images
    }
}

/// Index entry: file holding the blob and its on-disk size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDesc {
    pub key: FileKey,
    pub size: i32,
}

impl FileDesc {
    #[must_use]
    pub const fn new(key: FileKey, size: i32) -> Self {
        Self { key, size }
    }
}

// ============================================================
// FILE FORMAT
// ============================================================

/// Stored file type of a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileFormat {
    #[default]
    Unknown,
    Jpeg,
    Gif,
    Png,
    Pdf,
    Mp3,
    Mov,
    Partial,
    Mp4,
    Webp,
}

impl FileFormat {
    const TABLE: [(FileFormat, u32); 10] = [
        (FileFormat::Unknown, 0xaa96_3b05),
        (FileFormat::Jpeg, 0x007e_fe0e),
        (FileFormat::Gif, 0xcae1_aadf),
        (FileFormat::Png, 0x0a4f_63c0),
        (FileFormat::Pdf, 0x00ae_1e00),
        (FileFormat::Mp3, 0x528a_0677),
        (FileFormat::Mov, 0x4b09_ebbc),
        (FileFormat::Partial, 0x40bc_6f52),
        (FileFormat::Mp4, 0xb3ce_a0e4),
        (FileFormat::Webp, 0x1081_464c),
    ];

    #[must_use]
    pub fn to_u32(self) -> u32 {
        Self::TABLE
            .iter()
            .find(|(format, _)| *format == self)
            .map_or(Self::TABLE[0].1, |(_, id)| *id)
    }

    /// Unrecognized values read as `Unknown`
    #[must_use]
    pub fn from_u32(id: u32) -> Self {
        Self::TABLE
            .iter()
            .find(|(_, value)| *value == id)
            .map_or(Self::Unknown, |(format, _)| *format)
    }

    /// Guess the format from magic bytes
    #[must_use]
    pub fn sniff(data: &[u8]) -> Self {
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Self::Jpeg
        } else if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Self::Png
        } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            Self::Gif
        } else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            Self::Webp
        } else if data.starts_with(b"%PDF") {
            Self::Pdf
        } else if data.len() >= 12 && &data[4..8] == b"ftyp" {
            if &data[8..10] == b"qt" {
                Self::Mov
            } else {
                Self::Mp4
            }
        } else if data.starts_with(b"ID3") || data.starts_with(&[0xFF, 0xFB]) {
            Self::Mp3
        } else {
            Self::Unknown
        }
    }

    /// Keep a known format, sniff an unknown one
    #[must_use]
    pub fn resolve(self, data: &[u8]) -> Self {
        match self {
            Self::Unknown => Self::sniff(data),
            known => known,
        }
    }
}

// ============================================================
// STORAGE SIZE
// ============================================================

/// Container framing around the encrypted payload:
/// magic + version + segment length + tag + md5
const CONTAINER_OVERHEAD: usize = 4 + 4 + 4 + 16 + 16;

#[must_use]
pub fn pad16(len: usize) -> usize {
    (len + 15) & !15
}

/// On-disk size of a blob record, as tracked by the index
#[must_use]
pub fn storage_size<K: BlobKey>(category: BlobCategory, key: &K, data_len: usize) -> i32 {
    let mut raw = 4 + key.serialized_size() + 4 + data_len;
    if category.has_format() {
        raw += 4;
    }
    i32::try_from(pad16(raw) + CONTAINER_OVERHEAD).unwrap_or(i32::MAX)
}

// ============================================================
// RECORDS
// ============================================================

/// Decrypted contents of a blob file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord<K> {
    pub key: K,
    pub format: FileFormat,
    pub data: Vec<u8>,
}

impl<K: BlobKey> BlobRecord<K> {
    pub fn new(key: K, format: FileFormat, data: Vec<u8>) -> Self {
        Self { key, format, data }
    }

    #[must_use]
    pub fn encode(&self, category: BlobCategory) -> EncryptedDescriptor {
        let mut out = EncryptedDescriptor::with_capacity(self.key.serialized_size() + 8 + self.data.len());
        self.key.write(&mut out.stream);
        if category.has_format() {
            out.stream.write_u32(self.format.to_u32());
        }
        out.stream.write_bytes(&self.data);
        out
    }

    pub fn decode(reader: &mut StreamReader<'_>, category: BlobCategory) -> Result<Self, StreamError> {
        let key = K::read(reader)?;
        let format = if category.has_format() {
            FileFormat::from_u32(reader.read_u32()?)
        } else {
            FileFormat::Unknown
        };
        let data = reader.read_bytes()?;
        Ok(Self { key, format, data })
    }
}

// ============================================================
// INDEX
// ============================================================

/// Key → file index of one blob category with size accounting
///
/// `total()` always equals the sum of all entry sizes.
#[derive(Debug, Clone)]
pub struct BlobIndex<K> {
    entries: HashMap<K, FileDesc>,
    total: i64,
}

impl<K> Default for BlobIndex<K> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            total: 0,
        }
    }
}

impl<K: Eq + Hash + Clone> BlobIndex<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<FileDesc> {
        self.entries.get(key).copied()
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace; returns the previous entry
    pub fn insert(&mut self, key: K, desc: FileDesc) -> Option<FileDesc> {
        let old = self.entries.insert(key, desc);
        self.total += i64::from(desc.size) - old.map_or(0, |d| i64::from(d.size));
        old
    }

    pub fn remove(&mut self, key: &K) -> Option<FileDesc> {
        let old = self.entries.remove(key)?;
        self.total -= i64::from(old.size);
        Some(old)
    }

    /// Remove only while the entry still points at `file`
    pub fn remove_if_file(&mut self, key: &K, file: FileKey) -> Option<FileDesc> {
        match self.entries.get(key) {
            Some(desc) if desc.key == file => self.remove(key),
            _ => None,
        }
    }

    #[must_use]
    pub fn total(&self) -> i64 {
        self.total
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &FileDesc)> {
        self.entries.iter()
    }

    /// Swap the whole index out, leaving this one empty
    #[must_use]
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    #[must_use]
    pub fn file_keys(&self) -> Vec<FileKey> {
        self.entries.values().map(|d| d.key).collect()
    }
}

/// All blob indices of a profile
#[derive(Debug, Clone, Default)]
pub struct BlobIndices {
    pub images: BlobIndex<ContentKey>,
    pub stickers: BlobIndex<ContentKey>,
    pub audios: BlobIndex<ContentKey>,
    pub web_files: BlobIndex<String>,
}

impl BlobIndices {
    /// Index of a content-keyed category; `None` for web files
    #[must_use]
    pub fn content(&self, category: BlobCategory) -> Option<&BlobIndex<ContentKey>> {
        match category {
            BlobCategory::Images => Some(&self.images),
            BlobCategory::Stickers => Some(&self.stickers),
            BlobCategory::Audios => Some(&self.audios),
            BlobCategory::WebFiles => None,
        }
    }

    pub fn content_mut(&mut self, category: BlobCategory) -> Option<&mut BlobIndex<ContentKey>> {
        match category {
            BlobCategory::Images => Some(&mut self.images),
            BlobCategory::Stickers => Some(&mut self.stickers),
            BlobCategory::Audios => Some(&mut self.audios),
            BlobCategory::WebFiles => None,
        }
    }

    /// Swap one category out, returning its file keys
    pub fn take_files(&mut self, category: BlobCategory) -> Vec<FileKey> {
        match self.content_mut(category) {
            Some(index) => index.take().file_keys(),
            None => self.web_files.take().file_keys(),
        }
    }

    #[must_use]
    pub fn count(&self, category: BlobCategory) -> usize {
        self.content(category).map_or(self.web_files.len(), BlobIndex::len)
    }

    #[must_use]
    pub fn total(&self, category: BlobCategory) -> i64 {
        self.content(category).map_or(self.web_files.total(), BlobIndex::total)
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_sizes() {
        let key = ContentKey::new(1, 2);
        // 4 + 16 + 4 + 4 = 28 → 32, + 44
        assert_eq!(storage_size(BlobCategory::Images, &key, 0), 76);
        // 38 → 48
        assert_eq!(storage_size(BlobCategory::Images, &key, 10), 92);
        // 4 + 16 + 4 + 12 = 36 → 48
        assert_eq!(storage_size(BlobCategory::Stickers, &key, 12), 92);
        assert_eq!(storage_size(BlobCategory::Audios, &key, 8), 76);

        // 4 + (4 + 2 * 5) + 4 + 2 = 24 → 32
        let url = "a.png".to_string();
        assert_eq!(storage_size(BlobCategory::WebFiles, &url, 2), 76);
    }

    #[test]
    fn test_index_accounting() {
        let mut index = BlobIndex::new();
        let a = ContentKey::new(1, 1);
        let b = ContentKey::new(2, 2);

        index.insert(a, FileDesc::new(10, 100));
        index.insert(b, FileDesc::new(11, 50));
        assert_eq!(index.total(), 150);

        // Replace adjusts by the difference
        let old = index.insert(a, FileDesc::new(10, 30));
        assert_eq!(old, Some(FileDesc::new(10, 100)));
        assert_eq!(index.total(), 80);

        index.insert(b, FileDesc::new(11, 70));
        assert_eq!(index.total(), 100);

        assert_eq!(index.remove(&a), Some(FileDesc::new(10, 30)));
        assert_eq!(index.total(), 70);
        assert_eq!(index.remove(&a), None);
        assert_eq!(index.total(), 70);

        let sum: i64 = index.iter().map(|(_, d)| i64::from(d.size)).sum();
        assert_eq!(sum, index.total());
    }

    #[test]
    fn test_remove_if_file_checks_key() {
        let mut index = BlobIndex::new();
        let key = ContentKey::new(5, 6);
        index.insert(key, FileDesc::new(42, 64));

        assert!(index.remove_if_file(&key, 41).is_none());
        assert!(index.contains(&key));

        assert!(index.remove_if_file(&key, 42).is_some());
        assert!(index.is_empty());
        assert_eq!(index.total(), 0);
    }

    #[test]
    fn test_take_swaps_out() {
        let mut index: BlobIndex<String> = BlobIndex::new();
        index.insert("u".to_string(), FileDesc::new(1, 64));

        let old = index.take();
        assert_eq!(old.len(), 1);
        assert_eq!(old.total(), 64);
        assert_eq!(old.file_keys(), vec![1]);
        assert!(index.is_empty());
        assert_eq!(index.total(), 0);
    }

    #[test]
    fn test_indices_take_files_per_category() {
        let mut indices = BlobIndices::default();
        indices.images.insert(ContentKey::new(1, 1), FileDesc::new(100, 76));
        indices.audios.insert(ContentKey::new(2, 2), FileDesc::new(200, 92));
        indices.web_files.insert("u".to_string(), FileDesc::new(300, 60));

        assert_eq!(indices.count(BlobCategory::Images), 1);
        assert_eq!(indices.total(BlobCategory::WebFiles), 60);

        assert_eq!(indices.take_files(BlobCategory::Audios), vec![200]);
        assert_eq!(indices.total(BlobCategory::Audios), 0);
        assert_eq!(indices.take_files(BlobCategory::WebFiles), vec![300]);
        assert_eq!(indices.count(BlobCategory::WebFiles), 0);
        assert_eq!(indices.count(BlobCategory::Images), 1);
    }

    #[test]
    fn test_image_record_layout() {
        let record = BlobRecord::new(ContentKey::new(1, 2), FileFormat::Png, b"xy".to_vec());
        let encoded = record.encode(BlobCategory::Images);
        assert_eq!(
            hex::encode(encoded.stream.as_bytes()),
            "000000000000000100000000000000020a4f63c0000000027879"
        );

        let bytes = encoded.stream.into_bytes();
        let decoded = BlobRecord::<ContentKey>::decode(&mut StreamReader::new(&bytes), BlobCategory::Images).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_sticker_and_web_records_have_no_format() {
        let sticker = BlobRecord::new(ContentKey::new(3, 4), FileFormat::Unknown, vec![9; 5]);
        let bytes = sticker.encode(BlobCategory::Stickers).stream.into_bytes();
        assert_eq!(bytes.len(), 16 + 4 + 5);

        let web = BlobRecord::new("https://t.me/i.png".to_string(), FileFormat::Unknown, vec![1, 2]);
        let bytes = web.encode(BlobCategory::WebFiles).stream.into_bytes();
        let decoded = BlobRecord::<String>::decode(&mut StreamReader::new(&bytes), BlobCategory::WebFiles).unwrap();
        assert_eq!(decoded, web);
    }

    #[test]
    fn test_truncated_record_errors() {
        let record = BlobRecord::new(ContentKey::new(1, 2), FileFormat::Jpeg, vec![0; 32]);
        let bytes = record.encode(BlobCategory::Images).stream.into_bytes();
        let result = BlobRecord::<ContentKey>::decode(&mut StreamReader::new(&bytes[..30]), BlobCategory::Images);
        assert!(result.is_err());
    }

    #[test]
    fn test_format_ids() {
        assert_eq!(FileFormat::Jpeg.to_u32(), 0x007e_fe0e);
        assert_eq!(FileFormat::from_u32(0x1081_464c), FileFormat::Webp);
        assert_eq!(FileFormat::from_u32(0xdead_beef), FileFormat::Unknown);
    }

    #[test]
    fn test_sniff() {
        assert_eq!(FileFormat::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), FileFormat::Jpeg);
        assert_eq!(FileFormat::sniff(b"\x89PNG\r\n\x1a\n...."), FileFormat::Png);
        assert_eq!(FileFormat::sniff(b"GIF89a..."), FileFormat::Gif);
        assert_eq!(FileFormat::sniff(b"RIFF\0\0\0\0WEBPVP8 "), FileFormat::Webp);
        assert_eq!(FileFormat::sniff(b"%PDF-1.4"), FileFormat::Pdf);
        assert_eq!(FileFormat::sniff(b"\0\0\0\x18ftypmp42"), FileFormat::Mp4);
        assert_eq!(FileFormat::sniff(b"\0\0\0\x14ftypqt  "), FileFormat::Mov);
        assert_eq!(FileFormat::sniff(b"ID3\x04"), FileFormat::Mp3);
        assert_eq!(FileFormat::sniff(b"hello"), FileFormat::Unknown);
        assert_eq!(FileFormat::sniff(b""), FileFormat::Unknown);

        assert_eq!(FileFormat::Gif.resolve(&[0xFF, 0xD8, 0xFF]), FileFormat::Gif);
        assert_eq!(FileFormat::Unknown.resolve(&[0xFF, 0xD8, 0xFF]), FileFormat::Jpeg);
    }
}
