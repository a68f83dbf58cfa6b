//! Per-slot record codecs: drafts, cursors and the small profile lists.
//!
//! Every record is an encrypted stream in its own container. Decoders take
//! the version of the app that wrote the file and skip fields that version
//! did not have yet.
//!
//! | field                               | first version |
//! |-------------------------------------|---------------|
//! | draft reply-to                      | 7021          |
//! | draft preview-cancelled, edit draft | 8001          |
//! | draft text tags                     | 9048          |
//! | sticker set emoji map               | 9019          |

use std::collections::{BTreeMap, BTreeSet};

use crate::catalog::PeerId;
use crate::stream::{StreamError, StreamReader, StreamWriter};

pub const DRAFT_REPLY_MIN_VERSION: i32 = 7021;
pub const DRAFT_EDIT_MIN_VERSION: i32 = 8001;
pub const DRAFT_TAGS_MIN_VERSION: i32 = 9048;
pub const STICKER_EMOJI_MIN_VERSION: i32 = 9019;
/// A dev build that wrote unreadable saved peers
const BROKEN_SAVED_PEERS_VERSION: i32 = 9011;

/// Value stored in a catalog slot
pub trait SlotRecord: Sized {
    fn encode(&self, stream: &mut StreamWriter);

    /// `version` is the app version that wrote the file
    fn decode(reader: &mut StreamReader<'_>, version: i32) -> Result<Self, StreamError>;

    /// Empty records are not stored; writing one frees the slot
    fn is_empty(&self) -> bool;
}

// ============================================================
// DRAFTS
// ============================================================

/// One message draft
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageDraft {
    pub text: String,
    /// Serialized text tags, opaque
    pub tags: Vec<u8>,
    /// Reply-to id for the local draft, edited message id for the edit draft
    pub msg_id: i32,
    pub preview_cancelled: bool,
}

/// Local and edit drafts of one peer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Drafts {
    pub peer: PeerId,
    pub local: MessageDraft,
    pub edit: MessageDraft,
}

impl SlotRecord for Drafts {
    fn encode(&self, stream: &mut StreamWriter) {
        stream.write_u64(self.peer);
        for draft in [&self.local, &self.edit] {
            stream.write_string(&draft.text);
            stream.write_bytes(&draft.tags);
            stream.write_i32(draft.msg_id);
            stream.write_bool(draft.preview_cancelled);
        }
    }

    fn decode(reader: &mut StreamReader<'_>, version: i32) -> Result<Self, StreamError> {
        let mut result = Drafts { peer: reader.read_u64()?, ..Default::default() };
        result.local.text = reader.read_string()?;
        if version >= DRAFT_TAGS_MIN_VERSION {
            result.local.tags = reader.read_bytes()?;
        }
        if version >= DRAFT_REPLY_MIN_VERSION {
            result.local.msg_id = reader.read_i32()?;
            if version >= DRAFT_EDIT_MIN_VERSION {
                result.local.preview_cancelled = reader.read_bool()?;
                if !reader.at_end() {
                    result.edit.text = reader.read_string()?;
                    if version >= DRAFT_TAGS_MIN_VERSION {
                        result.edit.tags = reader.read_bytes()?;
                    }
                    result.edit.msg_id = reader.read_i32()?;
                    result.edit.preview_cancelled = reader.read_bool()?;
                }
            }
        }
        Ok(result)
    }

    fn is_empty(&self) -> bool {
        self.local.msg_id <= 0 && self.local.text.is_empty() && self.edit.msg_id <= 0
    }
}

/// Largest scroll value, meaning "scrolled to the end"
pub const SCROLL_MAX: i32 = i32::MAX / 256;

/// Text cursor inside a draft
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCursor {
    pub position: i32,
    pub anchor: i32,
    pub scroll: i32,
}

impl Default for MessageCursor {
    fn default() -> Self {
        Self { position: 0, anchor: 0, scroll: SCROLL_MAX }
    }
}

impl MessageCursor {
    fn write(&self, stream: &mut StreamWriter) {
        stream.write_i32(self.position);
        stream.write_i32(self.anchor);
        stream.write_i32(self.scroll);
    }

    fn read(reader: &mut StreamReader<'_>) -> Result<Self, StreamError> {
        Ok(Self {
            position: reader.read_i32()?,
            anchor: reader.read_i32()?,
            scroll: reader.read_i32()?,
        })
    }
}

/// Cursors of both drafts of one peer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DraftCursors {
    pub peer: PeerId,
    pub local: MessageCursor,
    pub edit: MessageCursor,
}

impl SlotRecord for DraftCursors {
    fn encode(&self, stream: &mut StreamWriter) {
        stream.write_u64(self.peer);
        self.local.write(stream);
        self.edit.write(stream);
    }

    fn decode(reader: &mut StreamReader<'_>, _version: i32) -> Result<Self, StreamError> {
        let peer = reader.read_u64()?;
        let local = MessageCursor::read(reader)?;
        let edit = if reader.at_end() {
            MessageCursor::default()
        } else {
            MessageCursor::read(reader)?
        };
        Ok(Self { peer, local, edit })
    }

    fn is_empty(&self) -> bool {
        self.local == MessageCursor::default() && self.edit == MessageCursor::default()
    }
}

// ============================================================
// PROFILE LISTS
// ============================================================

/// Per-peer report-spam status
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReportSpamStatuses(pub BTreeMap<PeerId, i32>);

impl SlotRecord for ReportSpamStatuses {
    fn encode(&self, stream: &mut StreamWriter) {
        stream.write_i32(self.0.len() as i32);
        for (peer, status) in &self.0 {
            stream.write_u64(*peer);
            stream.write_i32(*status);
        }
    }

    fn decode(reader: &mut StreamReader<'_>, _version: i32) -> Result<Self, StreamError> {
        let count = reader.read_i32()?;
        let mut statuses = BTreeMap::new();
        for _ in 0..count.max(0) {
            let peer = reader.read_u64()?;
            let status = reader.read_i32()?;
            statuses.insert(peer, status);
        }
        Ok(Self(statuses))
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Bots allowed to receive the user's location and contact
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrustedBots(pub BTreeSet<PeerId>);

impl SlotRecord for TrustedBots {
    fn encode(&self, stream: &mut StreamWriter) {
        stream.write_i32(self.0.len() as i32);
        for bot in &self.0 {
            stream.write_u64(*bot);
        }
    }

    fn decode(reader: &mut StreamReader<'_>, _version: i32) -> Result<Self, StreamError> {
        let count = reader.read_i32()?;
        let mut bots = BTreeSet::new();
        for _ in 0..count.max(0) {
            bots.insert(reader.read_u64()?);
        }
        Ok(Self(bots))
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Hashtag with its usage count
pub type RecentHashtag = (String, u16);

/// Recently used hashtags and inline bots
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecentHashtagsAndBots {
    pub write: Vec<RecentHashtag>,
    pub search: Vec<RecentHashtag>,
    pub bots: Vec<PeerId>,
}

impl SlotRecord for RecentHashtagsAndBots {
    fn encode(&self, stream: &mut StreamWriter) {
        let write: Vec<_> = self.write.iter().filter(|(tag, _)| !tag.is_empty()).collect();
        let search: Vec<_> = self.search.iter().filter(|(tag, _)| !tag.is_empty()).collect();
        stream.write_u32(write.len() as u32);
        stream.write_u32(search.len() as u32);
        for (tag, count) in write.into_iter().chain(search) {
            stream.write_string(tag);
            stream.write_u16(*count);
        }
        stream.write_u32(self.bots.len() as u32);
        for bot in &self.bots {
            stream.write_u64(*bot);
        }
    }

    fn decode(reader: &mut StreamReader<'_>, _version: i32) -> Result<Self, StreamError> {
        let write_count = reader.read_u32()?;
        let search_count = reader.read_u32()?;
        let mut read_pack = |count: u32| -> Result<Vec<RecentHashtag>, StreamError> {
            let mut pack = Vec::new();
            for _ in 0..count {
                let tag = reader.read_string()?;
                let uses = reader.read_u16()?;
                pack.push((tag.trim().to_string(), uses));
            }
            Ok(pack)
        };
        let write = read_pack(write_count)?;
        let search = read_pack(search_count)?;

        let mut bots = Vec::new();
        if !reader.at_end() {
            let count = reader.read_u32()?;
            for _ in 0..count {
                bots.push(reader.read_u64()?);
            }
        }
        Ok(Self { write, search, bots })
    }

    fn is_empty(&self) -> bool {
        self.write.is_empty() && self.search.is_empty() && self.bots.is_empty()
    }
}

/// Saved GIF document ids, most recent first
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SavedGifs(pub Vec<u64>);

impl SlotRecord for SavedGifs {
    fn encode(&self, stream: &mut StreamWriter) {
        stream.write_u32(self.0.len() as u32);
        for id in &self.0 {
            stream.write_u64(*id);
        }
    }

    /// Duplicates are dropped
    fn decode(reader: &mut StreamReader<'_>, _version: i32) -> Result<Self, StreamError> {
        let count = reader.read_u32()?;
        let mut seen = BTreeSet::new();
        let mut gifs = Vec::new();
        for _ in 0..count {
            let id = reader.read_u64()?;
            if seen.insert(id) {
                gifs.push(id);
            }
        }
        Ok(Self(gifs))
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Peers saved for sharing, with the time they were saved (unix millis)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SavedPeers(pub Vec<(PeerId, i64)>);

impl SlotRecord for SavedPeers {
    fn encode(&self, stream: &mut StreamWriter) {
        stream.write_u32(self.0.len() as u32);
        for (peer, saved_at) in &self.0 {
            stream.write_u64(*peer);
            stream.write_date_time(*saved_at);
        }
    }

    fn decode(reader: &mut StreamReader<'_>, version: i32) -> Result<Self, StreamError> {
        if version == BROKEN_SAVED_PEERS_VERSION {
            return Ok(Self::default());
        }
        let count = reader.read_u32()?;
        let mut peers = Vec::new();
        for _ in 0..count {
            let peer = reader.read_u64()?;
            let saved_at = reader.read_date_time()?;
            peers.push((peer, saved_at));
        }
        Ok(Self(peers))
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Chat background: id plus the encoded image for custom backgrounds
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Background {
    pub id: i32,
    pub image: Vec<u8>,
}

impl SlotRecord for Background {
    fn encode(&self, stream: &mut StreamWriter) {
        stream.write_i32(self.id);
        if !self.image.is_empty() {
            stream.write_bytes(&self.image);
        }
    }

    fn decode(reader: &mut StreamReader<'_>, _version: i32) -> Result<Self, StreamError> {
        let id = reader.read_i32()?;
        let image = if reader.at_end() { Vec::new() } else { reader.read_bytes()? };
        Ok(Self { id, image })
    }

    /// The default background is still a choice worth keeping
    fn is_empty(&self) -> bool {
        false
    }
}

// ============================================================
// STICKER SETS
// ============================================================

/// One sticker set; stickers are document ids
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StickerSet {
    pub id: u64,
    pub access: u64,
    pub title: String,
    pub short_name: String,
    /// Sticker count; only meaningful on its own for sets not loaded yet
    pub count: i32,
    pub hash: i32,
    pub flags: i32,
    /// Only the count and header are known
    pub not_loaded: bool,
    pub stickers: Vec<u64>,
    pub emoji: Vec<(String, Vec<u64>)>,
}

/// Sticker sets of one kind and their display order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StickerSets {
    pub sets: Vec<StickerSet>,
    pub order: Vec<u64>,
}

impl StickerSets {
    fn written_sets(&self) -> impl Iterator<Item = &StickerSet> {
        self.sets.iter().filter(|set| set.not_loaded || !set.stickers.is_empty())
    }
}

impl SlotRecord for StickerSets {
    fn encode(&self, stream: &mut StreamWriter) {
        stream.write_u32(self.written_sets().count() as u32);
        // Legacy hash, always empty
        stream.write_bytes(&[]);
        for set in self.written_sets() {
            stream.write_u64(set.id);
            stream.write_u64(set.access);
            stream.write_string(&set.title);
            stream.write_string(&set.short_name);
            if set.not_loaded {
                stream.write_i32(-set.count);
                stream.write_i32(set.hash);
                stream.write_i32(set.flags);
                continue;
            }
            stream.write_i32(set.stickers.len() as i32);
            stream.write_i32(set.hash);
            stream.write_i32(set.flags);
            for sticker in &set.stickers {
                stream.write_u64(*sticker);
            }
            stream.write_i32(set.emoji.len() as i32);
            for (emoji, stickers) in &set.emoji {
                stream.write_string(emoji);
                stream.write_i32(stickers.len() as i32);
                for sticker in stickers {
                    stream.write_u64(*sticker);
                }
            }
        }
        stream.write_u32(self.order.len() as u32);
        for id in &self.order {
            stream.write_u64(*id);
        }
    }

    fn decode(reader: &mut StreamReader<'_>, version: i32) -> Result<Self, StreamError> {
        let count = reader.read_u32()?;
        let _hash = reader.read_bytes()?;
        let mut sets = Vec::new();
        for _ in 0..count {
            let mut set = StickerSet {
                id: reader.read_u64()?,
                access: reader.read_u64()?,
                title: reader.read_string()?,
                short_name: reader.read_string()?,
                ..Default::default()
            };
            let stickers = reader.read_i32()?;
            set.hash = reader.read_i32()?;
            set.flags = reader.read_i32()?;
            if stickers < 0 {
                set.not_loaded = true;
                set.count = -stickers;
                sets.push(set);
                continue;
            }
            set.count = stickers;
            for _ in 0..stickers {
                set.stickers.push(reader.read_u64()?);
            }
            if version >= STICKER_EMOJI_MIN_VERSION {
                let emoji_count = reader.read_i32()?;
                for _ in 0..emoji_count.max(0) {
                    let emoji = reader.read_string()?;
                    let n = reader.read_i32()?;
                    let mut ids = Vec::new();
                    for _ in 0..n.max(0) {
                        ids.push(reader.read_u64()?);
                    }
                    set.emoji.push((emoji, ids));
                }
            }
            sets.push(set);
        }

        let mut order = Vec::new();
        if !reader.at_end() {
            let n = reader.read_u32()?;
            for _ in 0..n {
                order.push(reader.read_u64()?);
            }
        }
        Ok(Self { sets, order })
    }

    fn is_empty(&self) -> bool {
        self.written_sets().next().is_none() && self.order.is_empty()
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::APP_VERSION;

    fn round_trip<R: SlotRecord>(record: &R, version: i32) -> R {
        let mut w = StreamWriter::new();
        record.encode(&mut w);
        let bytes = w.into_bytes();
        let mut reader = StreamReader::new(&bytes);
        let decoded = R::decode(&mut reader, version).unwrap();
        assert!(reader.at_end(), "trailing bytes");
        decoded
    }

    fn drafts() -> Drafts {
        Drafts {
            peer: 42,
            local: MessageDraft {
                text: "hello".into(),
                tags: vec![1, 2],
                msg_id: 7,
                preview_cancelled: true,
            },
            edit: MessageDraft {
                text: "edited".into(),
                tags: vec![3],
                msg_id: 99,
                preview_cancelled: false,
            },
        }
    }

    #[test]
    fn test_drafts_current_version() {
        let record = drafts();
        assert_eq!(round_trip(&record, APP_VERSION), record);
    }

    #[test]
    fn test_drafts_version_gates() {
        let record = drafts();
        let mut w = StreamWriter::new();
        w.write_u64(42);
        w.write_string("hello");
        let bytes = w.into_bytes();

        // Before reply-to existed only peer and text were written
        let old = Drafts::decode(&mut StreamReader::new(&bytes), 7000).unwrap();
        assert_eq!(old.local.text, "hello");
        assert_eq!(old.local.msg_id, 0);
        assert!(old.edit.text.is_empty());

        // 8001..9048: no tags
        let mut w = StreamWriter::new();
        w.write_u64(42);
        w.write_string("hello");
        w.write_i32(7);
        w.write_bool(true);
        w.write_string("edited");
        w.write_i32(99);
        w.write_bool(false);
        let bytes = w.into_bytes();
        let mid = Drafts::decode(&mut StreamReader::new(&bytes), 9000).unwrap();
        assert_eq!(mid.local.msg_id, record.local.msg_id);
        assert!(mid.local.preview_cancelled);
        assert_eq!(mid.edit.msg_id, 99);
        assert!(mid.local.tags.is_empty());
    }

    #[test]
    fn test_drafts_without_edit_part() {
        let mut w = StreamWriter::new();
        w.write_u64(1);
        w.write_string("x");
        w.write_bytes(&[]);
        w.write_i32(0);
        w.write_bool(false);
        let bytes = w.into_bytes();
        let decoded = Drafts::decode(&mut StreamReader::new(&bytes), APP_VERSION).unwrap();
        assert_eq!(decoded.edit, MessageDraft::default());
    }

    #[test]
    fn test_draft_emptiness() {
        assert!(Drafts::default().is_empty());
        let mut record = Drafts::default();
        record.local.msg_id = 5;
        assert!(!record.is_empty());
        let mut record = Drafts::default();
        record.edit.msg_id = 1;
        assert!(!record.is_empty());
    }

    #[test]
    fn test_cursors() {
        let record = DraftCursors {
            peer: 9,
            local: MessageCursor { position: 3, anchor: 1, scroll: 20 },
            edit: MessageCursor::default(),
        };
        assert_eq!(round_trip(&record, APP_VERSION), record);
        assert!(!record.is_empty());
        assert!(DraftCursors { peer: 9, ..Default::default() }.is_empty());

        // Edit cursor missing
        let mut w = StreamWriter::new();
        w.write_u64(9);
        record.local.write(&mut w);
        let bytes = w.into_bytes();
        let decoded = DraftCursors::decode(&mut StreamReader::new(&bytes), APP_VERSION).unwrap();
        assert_eq!(decoded.edit, MessageCursor::default());
    }

    #[test]
    fn test_small_lists() {
        let statuses = ReportSpamStatuses([(1, 2), (3, -1)].into_iter().collect());
        assert_eq!(round_trip(&statuses, APP_VERSION), statuses);

        let bots = TrustedBots([5, 6].into_iter().collect());
        assert_eq!(round_trip(&bots, APP_VERSION), bots);

        let peers = SavedPeers(vec![(10, 1_700_000_000_000), (11, 0)]);
        assert_eq!(round_trip(&peers, APP_VERSION), peers);

        let background = Background { id: 1005, image: vec![0x42, 0x4D] };
        assert_eq!(round_trip(&background, APP_VERSION), background);
        let default_background = Background { id: 0, image: vec![] };
        assert_eq!(round_trip(&default_background, APP_VERSION), default_background);
    }

    #[test]
    fn test_saved_gifs_dedup() {
        let gifs = SavedGifs(vec![1, 2, 1, 3]);
        assert_eq!(round_trip(&gifs, APP_VERSION), SavedGifs(vec![1, 2, 3]));
    }

    #[test]
    fn test_saved_peers_broken_version() {
        let peers = SavedPeers(vec![(10, 0)]);
        let mut w = StreamWriter::new();
        peers.encode(&mut w);
        let bytes = w.into_bytes();
        let decoded = SavedPeers::decode(&mut StreamReader::new(&bytes), 9011).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_hashtags_skip_empty_and_trim() {
        let record = RecentHashtagsAndBots {
            write: vec![("rust".into(), 3), (String::new(), 1)],
            search: vec![(" spaced ".into(), 2)],
            bots: vec![777],
        };
        let decoded = round_trip(&record, APP_VERSION);
        assert_eq!(decoded.write, vec![("rust".to_string(), 3)]);
        assert_eq!(decoded.search, vec![("spaced".to_string(), 2)]);
        assert_eq!(decoded.bots, vec![777]);

        // Older files stop before the bots list
        let mut w = StreamWriter::new();
        w.write_u32(0);
        w.write_u32(0);
        let bytes = w.into_bytes();
        let decoded = RecentHashtagsAndBots::decode(&mut StreamReader::new(&bytes), 9000).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_sticker_sets() {
        let record = StickerSets {
            sets: vec![
                StickerSet {
                    id: 1,
                    access: 2,
                    title: "Cats".into(),
                    short_name: "cats".into(),
                    count: 2,
                    hash: 5,
                    flags: 1,
                    not_loaded: false,
                    stickers: vec![100, 101],
                    emoji: vec![("😺".into(), vec![100])],
                },
                StickerSet {
                    id: 3,
                    access: 4,
                    title: "Later".into(),
                    short_name: "later".into(),
                    count: 12,
                    not_loaded: true,
                    ..Default::default()
                },
            ],
            order: vec![1, 3],
        };
        assert_eq!(round_trip(&record, APP_VERSION), record);
    }

    #[test]
    fn test_sticker_sets_skip_empty_loaded_sets() {
        let record = StickerSets {
            sets: vec![StickerSet { id: 1, ..Default::default() }],
            order: vec![],
        };
        assert!(record.is_empty());
        let decoded = round_trip(&record, APP_VERSION);
        assert!(decoded.sets.is_empty());
    }

    #[test]
    fn test_truncated_record_errors() {
        let mut w = StreamWriter::new();
        TrustedBots([1, 2, 3].into_iter().collect()).encode(&mut w);
        let bytes = w.into_bytes();
        assert!(TrustedBots::decode(&mut StreamReader::new(&bytes[..10]), APP_VERSION).is_err());
    }
}
