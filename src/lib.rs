//! tdata storage - encrypted local storage engine
//!
//! Persists the state of a messaging client (settings, drafts, cached
//! media, sticker sets, peer lists) across restarts. It uses:
//! - Checksummed `TDF$` containers written as `0`/`1` twins
//! - AES-256-IGE payload encryption with a SHA1 integrity tag
//! - A random LocalKey wrapped by a passcode-derived PassKey
//! - A catalog ("map") naming the file of every stored value
//! - A background worker for large blob loads
//!
//! ## Architecture
//!
//! ```text
//! Caller (owner thread)
//!     ↓ put_* / get_* / get_*_async / poll
//! Storage
//!     ├── KeyManager (LocalKey, PassKey)
//!     ├── Catalog + FlushScheduler (map0/map1)
//!     ├── BlobIndices (images, stickers, audios, web files)
//!     ├── Locations (file locations, aliases)
//!     ├── Settings (settings0/settings1 in the base directory)
//!     └── TaskQueue (async blob loads)
//!     ↓ encrypted record streams
//! Containers (magic, version, segments, MD5)
//!     ↓
//! FileSystem (native or in-memory)
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod blob;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod container;
pub mod crypto;
pub mod fs;
pub mod keys;
pub mod loader;
pub mod locations;
pub mod records;
pub mod settings;
pub mod storage;
pub mod stream;

pub use blob::{storage_size, BlobCategory, ContentKey, FileDesc, FileFormat};
pub use catalog::{FlushMode, PeerId, Slot, StickerSetKind};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{KdfValues, StorageConfig, TimingValues, APP_VERSION};
pub use container::{
    decode_container, encode_container, profile_key, to_file_part, ContainerError, ContainerHandle, Containers,
    FileKey, FileOptions, PathKind, TDF_MAGIC,
};
pub use crypto::{
    bind_auxiliary_secret, decrypt_bound, decrypt_local, encrypt_bound, encrypt_local, unbind_auxiliary_secret,
    CryptoError, EncryptedDescriptor, LocalKey, LOCAL_KEY_SIZE, SALT_SIZE, TAG_SIZE,
};
pub use fs::{FileSystem, InMemoryFs, NativeFs};
pub use keys::{derive_in_background, derive_key, wait_unlock, KeyError, KeyManager, PasscodeChange};
pub use loader::{TaskId, TaskQueue};
pub use locations::FileLocation;
pub use records::{
    Background, DraftCursors, Drafts, MessageCursor, MessageDraft, RecentHashtagsAndBots, ReportSpamStatuses,
    SavedGifs, SavedPeers, SlotRecord, StickerSet, StickerSets, TrustedBots,
};
pub use settings::{AppSettings, UserSettings};
pub use storage::{
    CategoryStats, LoadResult, LoadStart, LoadedBlob, Reclaim, Storage, StorageError, StorageState,
    StorageStats,
};
pub use stream::{StreamError, StreamReader, StreamWriter};
