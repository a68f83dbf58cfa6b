//! Catalog ("map") of a profile: which FileKey holds which logical value.
//!
//! The map file is a twin-safe container with three segments:
//!
//! ```text
//! [pass salt] [LocalKey wrapped with PassKey] [encrypted table]
//! ```
//!
//! The table is a sequence of `u32 tag` records (see [`tag`]). Tags are
//! stable forever; an unknown tag ends parsing but keeps what was read.
//!
//! Writes are deadline-scheduled: many changes inside one debounce window
//! produce one map write carrying the latest state.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::blob::{BlobIndex, BlobIndices, ContentKey, FileDesc};
use crate::config::TimingValues;
use crate::container::FileKey;
use crate::crypto::EncryptedDescriptor;
use crate::stream::{StreamError, StreamReader};

/// Peer identifier used by per-peer slots
pub type PeerId = u64;

/// Catalog table tags
pub mod tag {
    pub const USER_MAP: u32 = 0x00;
    pub const DRAFT: u32 = 0x01;
    pub const DRAFT_POSITION: u32 = 0x02;
    pub const IMAGES: u32 = 0x03;
    pub const LOCATIONS: u32 = 0x04;
    pub const STICKER_IMAGES: u32 = 0x05;
    pub const AUDIOS: u32 = 0x06;
    pub const RECENT_STICKERS_OLD: u32 = 0x07;
    pub const BACKGROUND: u32 = 0x08;
    pub const USER_SETTINGS: u32 = 0x09;
    pub const RECENT_HASHTAGS_AND_BOTS: u32 = 0x0a;
    pub const STICKERS_OLD: u32 = 0x0b;
    pub const SAVED_PEERS: u32 = 0x0c;
    pub const REPORT_SPAM_STATUSES: u32 = 0x0d;
    pub const SAVED_GIFS_OLD: u32 = 0x0e;
    pub const SAVED_GIFS: u32 = 0x0f;
    pub const STICKERS_KEYS: u32 = 0x10;
    pub const TRUSTED_BOTS: u32 = 0x11;
}

/// Sticker set lists stored under the combined stickers tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StickerSetKind {
    Installed,
    Featured,
    Recent,
    Archived,
}

impl StickerSetKind {
    pub const ALL: [StickerSetKind; 4] = [Self::Installed, Self::Featured, Self::Recent, Self::Archived];
}

/// Single-file slots of the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Locations,
    ReportSpamStatuses,
    TrustedBots,
    RecentStickersOld,
    Background,
    UserSettings,
    RecentHashtagsAndBots,
    SavedGifs,
    SavedPeers,
    Stickers(StickerSetKind),
}

impl Slot {
    /// Slots written as `tag | u64 key`, in file order
    const SIMPLE: [(Slot, u32); 9] = [
        (Slot::Locations, tag::LOCATIONS),
        (Slot::ReportSpamStatuses, tag::REPORT_SPAM_STATUSES),
        (Slot::TrustedBots, tag::TRUSTED_BOTS),
        (Slot::RecentStickersOld, tag::RECENT_STICKERS_OLD),
        (Slot::SavedGifs, tag::SAVED_GIFS),
        (Slot::SavedPeers, tag::SAVED_PEERS),
        (Slot::Background, tag::BACKGROUND),
        (Slot::UserSettings, tag::USER_SETTINGS),
        (Slot::RecentHashtagsAndBots, tag::RECENT_HASHTAGS_AND_BOTS),
    ];

    fn from_simple_tag(value: u32) -> Option<Slot> {
        Self::SIMPLE.iter().find(|(_, t)| *t == value).map(|(slot, _)| *slot)
    }
}

/// Slot table of a profile
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    drafts: BTreeMap<PeerId, FileKey>,
    draft_cursors: BTreeMap<PeerId, FileKey>,
    slots: HashMap<Slot, FileKey>,
    dirty: bool,
}

/// Result of parsing a catalog table
#[derive(Debug)]
pub struct DecodedCatalog {
    pub catalog: Catalog,
    pub blobs: BlobIndices,
    /// False when parsing stopped early
    pub complete: bool,
}

impl Catalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    // ----- per-peer slots -----

    #[must_use]
    pub fn draft_key(&self, peer: PeerId) -> Option<FileKey> {
        self.drafts.get(&peer).copied()
    }

    pub fn set_draft_key(&mut self, peer: PeerId, key: FileKey) {
        self.drafts.insert(peer, key);
    }

    pub fn remove_draft_key(&mut self, peer: PeerId) -> Option<FileKey> {
        self.drafts.remove(&peer)
    }

    #[must_use]
    pub fn draft_peers(&self) -> Vec<PeerId> {
        self.drafts.keys().copied().collect()
    }

    #[must_use]
    pub fn cursor_key(&self, peer: PeerId) -> Option<FileKey> {
        self.draft_cursors.get(&peer).copied()
    }

    pub fn set_cursor_key(&mut self, peer: PeerId, key: FileKey) {
        self.draft_cursors.insert(peer, key);
    }

    pub fn remove_cursor_key(&mut self, peer: PeerId) -> Option<FileKey> {
        self.draft_cursors.remove(&peer)
    }

    // ----- single slots -----

    #[must_use]
    pub fn slot_key(&self, slot: Slot) -> Option<FileKey> {
        self.slots.get(&slot).copied()
    }

    pub fn set_slot_key(&mut self, slot: Slot, key: FileKey) {
        self.slots.insert(slot, key);
    }

    pub fn remove_slot_key(&mut self, slot: Slot) -> Option<FileKey> {
        self.slots.remove(&slot)
    }

    // ----- codec -----

    /// Serialize the table with the content blob indices
    #[must_use]
    pub fn encode(&self, blobs: &BlobIndices) -> EncryptedDescriptor {
        let mut out = EncryptedDescriptor::new();
        let stream = &mut out.stream;

        for (table_tag, map) in [(tag::DRAFT, &self.drafts), (tag::DRAFT_POSITION, &self.draft_cursors)] {
            if map.is_empty() {
                continue;
            }
            stream.write_u32(table_tag);
            stream.write_u32(map.len() as u32);
            for (peer, key) in map {
                stream.write_u64(*key);
                stream.write_u64(*peer);
            }
        }

        for (table_tag, index) in [
            (tag::IMAGES, &blobs.images),
            (tag::STICKER_IMAGES, &blobs.stickers),
            (tag::AUDIOS, &blobs.audios),
        ] {
            if index.is_empty() {
                continue;
            }
            let mut entries: Vec<_> = index.iter().collect();
            entries.sort_by_key(|(key, _)| **key);
            stream.write_u32(table_tag);
            stream.write_u32(entries.len() as u32);
            for (key, desc) in entries {
                stream.write_u64(desc.key);
                stream.write_u64(key.first);
                stream.write_u64(key.second);
                stream.write_i32(desc.size);
            }
        }

        for (slot, table_tag) in Slot::SIMPLE.iter().take(4) {
            if let Some(key) = self.slot_key(*slot) {
                stream.write_u32(*table_tag);
                stream.write_u64(key);
            }
        }

        let stickers = StickerSetKind::ALL.map(|kind| self.slot_key(Slot::Stickers(kind)).unwrap_or(0));
        if stickers.iter().any(|key| *key != 0) {
            stream.write_u32(tag::STICKERS_KEYS);
            for key in stickers {
                stream.write_u64(key);
            }
        }

        for (slot, table_tag) in Slot::SIMPLE.iter().skip(4) {
            if let Some(key) = self.slot_key(*slot) {
                stream.write_u32(*table_tag);
                stream.write_u64(key);
            }
        }
        out
    }

    /// Parse a decrypted table; stops at the first unknown tag
    #[must_use]
    pub fn decode(data: &[u8]) -> DecodedCatalog {
        let mut catalog = Catalog::new();
        let mut blobs = BlobIndices::default();
        let mut reader = StreamReader::new(data);

        let complete = match catalog.read_into(&mut reader, &mut blobs) {
            Ok(true) => true,
            Ok(false) => false,
            Err(e) => {
                warn!(error = %e, "catalog table truncated");
                false
            }
        };
        if !complete {
            catalog.mark_dirty();
        }
        DecodedCatalog { catalog, blobs, complete }
    }

    fn read_into(&mut self, reader: &mut StreamReader<'_>, blobs: &mut BlobIndices) -> Result<bool, StreamError> {
        while !reader.at_end() {
            let table_tag = reader.read_u32()?;
            match table_tag {
                tag::DRAFT | tag::DRAFT_POSITION => {
                    let count = reader.read_u32()?;
                    for _ in 0..count {
                        let key = reader.read_u64()?;
                        let peer = reader.read_u64()?;
                        if table_tag == tag::DRAFT {
                            self.drafts.insert(peer, key);
                        } else {
                            self.draft_cursors.insert(peer, key);
                        }
                    }
                }
                tag::IMAGES => read_blob_index(reader, &mut blobs.images)?,
                tag::STICKER_IMAGES => read_blob_index(reader, &mut blobs.stickers)?,
                tag::AUDIOS => read_blob_index(reader, &mut blobs.audios)?,
                tag::STICKERS_OLD => {
                    let key = reader.read_u64()?;
                    self.set_nonzero(Slot::Stickers(StickerSetKind::Installed), key);
                }
                tag::STICKERS_KEYS => {
                    for kind in StickerSetKind::ALL {
                        let key = reader.read_u64()?;
                        self.set_nonzero(Slot::Stickers(kind), key);
                    }
                }
                tag::SAVED_GIFS_OLD | tag::USER_MAP => {
                    // Superseded or not ours, the file is abandoned
                    let _ = reader.read_u64()?;
                }
                other => match Slot::from_simple_tag(other) {
                    Some(slot) => {
                        let key = reader.read_u64()?;
                        self.set_nonzero(slot, key);
                    }
                    None => {
                        warn!(tag = other, "unknown catalog tag, keeping partial table");
                        return Ok(false);
                    }
                },
            }
        }
        Ok(true)
    }

    fn set_nonzero(&mut self, slot: Slot, key: FileKey) {
        if key != 0 {
            self.slots.insert(slot, key);
        }
    }
}

fn read_blob_index(reader: &mut StreamReader<'_>, index: &mut BlobIndex<ContentKey>) -> Result<(), StreamError> {
    let count = reader.read_u32()?;
    for _ in 0..count {
        let file = reader.read_u64()?;
        let first = reader.read_u64()?;
        let second = reader.read_u64()?;
        let size = reader.read_i32()?;
        index.insert(ContentKey::new(first, second), FileDesc::new(file, size));
    }
    Ok(())
}

// ============================================================
// FLUSH SCHEDULING
// ============================================================

/// How soon a pending change must reach disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Write now, dropping any pending deadline
    Immediate,
    /// Write on the next poll
    Fast,
    /// Write after the debounce window
    Debounced,
}

/// Deadline-based write coalescing
#[derive(Debug, Clone)]
pub struct FlushScheduler {
    deadline: Option<Instant>,
    fast: Duration,
    debounce: Duration,
}

impl FlushScheduler {
    #[must_use]
    pub fn new(timing: &TimingValues) -> Self {
        Self {
            deadline: None,
            fast: timing.map_write_fast,
            debounce: timing.map_write_debounce,
        }
    }

    /// Returns true when the caller must flush right away
    ///
    /// An already pending deadline that is not later than the requested one
    /// is kept.
    pub fn schedule(&mut self, mode: FlushMode, now: Instant) -> bool {
        let delay = match mode {
            FlushMode::Immediate => {
                self.deadline = None;
                return true;
            }
            FlushMode::Fast => self.fast,
            FlushMode::Debounced => self.debounce,
        };
        let requested = now + delay;
        match self.deadline {
            Some(pending) if pending <= requested => {}
            _ => self.deadline = Some(requested),
        }
        false
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Consume the deadline if it has passed
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamWriter;

    fn sample() -> (Catalog, BlobIndices) {
        let mut catalog = Catalog::new();
        catalog.set_draft_key(100, 0xA1);
        catalog.set_draft_key(200, 0xA2);
        catalog.set_cursor_key(100, 0xB1);
        catalog.set_slot_key(Slot::Locations, 0xC1);
        catalog.set_slot_key(Slot::UserSettings, 0xC2);
        catalog.set_slot_key(Slot::Stickers(StickerSetKind::Recent), 0xC3);
        catalog.set_slot_key(Slot::TrustedBots, 0xC4);

        let mut blobs = BlobIndices::default();
        blobs.images.insert(ContentKey::new(1, 2), FileDesc::new(0xD1, 76));
        blobs.images.insert(ContentKey::new(3, 4), FileDesc::new(0xD2, 92));
        blobs.audios.insert(ContentKey::new(5, 6), FileDesc::new(0xD3, 108));
        (catalog, blobs)
    }

    #[test]
    fn test_round_trip() {
        let (catalog, blobs) = sample();
        let bytes = catalog.encode(&blobs).stream.into_bytes();
        let decoded = Catalog::decode(&bytes);

        assert!(decoded.complete);
        assert!(!decoded.catalog.is_dirty());
        assert_eq!(decoded.catalog.draft_key(100), Some(0xA1));
        assert_eq!(decoded.catalog.draft_peers(), vec![100, 200]);
        assert_eq!(decoded.catalog.cursor_key(100), Some(0xB1));
        assert_eq!(decoded.catalog.slot_key(Slot::Locations), Some(0xC1));
        assert_eq!(decoded.catalog.slot_key(Slot::UserSettings), Some(0xC2));
        assert_eq!(decoded.catalog.slot_key(Slot::Stickers(StickerSetKind::Recent)), Some(0xC3));
        assert_eq!(decoded.catalog.slot_key(Slot::Stickers(StickerSetKind::Installed)), None);
        assert_eq!(decoded.catalog.slot_key(Slot::TrustedBots), Some(0xC4));
        assert_eq!(decoded.blobs.images.total(), 168);
        assert_eq!(decoded.blobs.images.get(&ContentKey::new(3, 4)), Some(FileDesc::new(0xD2, 92)));
        assert_eq!(decoded.blobs.audios.len(), 1);
        assert!(decoded.blobs.stickers.is_empty());
    }

    #[test]
    fn test_encoding_is_idempotent() {
        let (catalog, blobs) = sample();
        let first = catalog.encode(&blobs).stream.into_bytes();
        let decoded = Catalog::decode(&first);
        let second = decoded.catalog.encode(&decoded.blobs).stream.into_bytes();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_table() {
        let bytes = Catalog::new().encode(&BlobIndices::default()).stream.into_bytes();
        assert!(bytes.is_empty());
        let decoded = Catalog::decode(&bytes);
        assert!(decoded.complete);
        assert!(decoded.catalog.draft_peers().is_empty());
        assert!(decoded.catalog.encode(&decoded.blobs).stream.into_bytes().is_empty());
    }

    #[test]
    fn test_draft_entry_layout() {
        let mut catalog = Catalog::new();
        catalog.set_draft_key(7, 9);
        let bytes = catalog.encode(&BlobIndices::default()).stream.into_bytes();
        assert_eq!(
            hex::encode(bytes),
            "00000001000000010000000000000009\
             0000000000000007"
        );
    }

    #[test]
    fn test_unknown_tag_keeps_prefix_and_marks_dirty() {
        let mut w = StreamWriter::new();
        w.write_u32(tag::BACKGROUND);
        w.write_u64(0x55);
        w.write_u32(0x7F);
        w.write_u64(0x66);
        let bytes = w.into_bytes();

        let decoded = Catalog::decode(&bytes);
        assert!(!decoded.complete);
        assert!(decoded.catalog.is_dirty());
        assert_eq!(decoded.catalog.slot_key(Slot::Background), Some(0x55));
    }

    #[test]
    fn test_truncated_table_is_partial() {
        let (catalog, blobs) = sample();
        let bytes = catalog.encode(&blobs).stream.into_bytes();
        let decoded = Catalog::decode(&bytes[..bytes.len() - 3]);
        assert!(!decoded.complete);
        assert_eq!(decoded.catalog.draft_key(200), Some(0xA2));
    }

    #[test]
    fn test_legacy_tags() {
        let mut w = StreamWriter::new();
        w.write_u32(tag::STICKERS_OLD);
        w.write_u64(0x10);
        w.write_u32(tag::SAVED_GIFS_OLD);
        w.write_u64(0x20);
        w.write_u32(tag::USER_MAP);
        w.write_u64(0x30);
        w.write_u32(tag::TRUSTED_BOTS);
        w.write_u64(0x40);
        let bytes = w.into_bytes();

        let decoded = Catalog::decode(&bytes);
        assert!(decoded.complete);
        assert_eq!(decoded.catalog.slot_key(Slot::Stickers(StickerSetKind::Installed)), Some(0x10));
        assert_eq!(decoded.catalog.slot_key(Slot::SavedGifs), None);
        assert_eq!(decoded.catalog.slot_key(Slot::TrustedBots), Some(0x40));

        // The user map key is dropped, so it never comes back on rewrite
        let mut expected = Catalog::new();
        expected.set_slot_key(Slot::Stickers(StickerSetKind::Installed), 0x10);
        expected.set_slot_key(Slot::TrustedBots, 0x40);
        assert_eq!(
            decoded.catalog.encode(&decoded.blobs).stream.into_bytes(),
            expected.encode(&BlobIndices::default()).stream.into_bytes()
        );
    }

    #[test]
    fn test_removal() {
        let (mut catalog, _) = sample();
        assert_eq!(catalog.remove_draft_key(100), Some(0xA1));
        assert_eq!(catalog.remove_draft_key(100), None);
        assert_eq!(catalog.draft_peers(), vec![200]);
        assert_eq!(catalog.cursor_key(100), Some(0xB1));

        assert_eq!(catalog.remove_slot_key(Slot::Locations), Some(0xC1));
        assert_eq!(catalog.slot_key(Slot::Locations), None);
        assert_eq!(catalog.remove_cursor_key(100), Some(0xB1));
        assert_eq!(catalog.slot_key(Slot::UserSettings), Some(0xC2));
    }

    #[test]
    fn test_scheduler_debounce_coalesces() {
        let timing = TimingValues::TEST;
        let mut scheduler = FlushScheduler::new(&timing);
        let start = Instant::now();

        assert!(!scheduler.schedule(FlushMode::Debounced, start));
        let first = scheduler.deadline().unwrap();

        // Later requests inside the window keep the earlier deadline
        assert!(!scheduler.schedule(FlushMode::Debounced, start + Duration::from_millis(10)));
        assert_eq!(scheduler.deadline(), Some(first));

        assert!(!scheduler.take_due(start + Duration::from_millis(49)));
        assert!(scheduler.take_due(start + timing.map_write_debounce));
        assert!(!scheduler.is_pending());
    }

    #[test]
    fn test_scheduler_fast_shortens_deadline() {
        let timing = TimingValues::TEST;
        let mut scheduler = FlushScheduler::new(&timing);
        let start = Instant::now();

        scheduler.schedule(FlushMode::Debounced, start);
        scheduler.schedule(FlushMode::Fast, start);
        assert_eq!(scheduler.deadline(), Some(start + timing.map_write_fast));

        // A debounced request does not push a fast deadline back
        scheduler.schedule(FlushMode::Debounced, start);
        assert_eq!(scheduler.deadline(), Some(start + timing.map_write_fast));
    }

    #[test]
    fn test_scheduler_immediate_cancels_pending() {
        let mut scheduler = FlushScheduler::new(&TimingValues::TEST);
        let now = Instant::now();
        scheduler.schedule(FlushMode::Debounced, now);
        assert!(scheduler.schedule(FlushMode::Immediate, now));
        assert!(!scheduler.is_pending());
        assert!(!scheduler.take_due(now + Duration::from_secs(60)));
    }
}
