//! Storage context of one profile.
//!
//! `Storage` owns every piece of the engine: the container layer, the key
//! manager, the catalog with its flush scheduler, the blob indices, the
//! locations file, the settings and the background loader. Callers drive it
//! from one thread; the loader and the reclaim threads only read or delete
//! files.
//!
//! Lifecycle:
//!
//! ```text
//! init ──> NotLoaded ──load──> Ready
//!              │                 ▲
//!              └──> PasscodeNeeded ──load(passcode)──┘
//! ```
//!
//! Changes are written to their own files right away; the catalog ("map")
//! and the locations file are flushed on deadlines driven by `poll()`.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::blob::{
    storage_size, BlobCategory, BlobIndex, BlobIndices, BlobKey, BlobRecord, ContentKey, FileDesc, FileFormat,
};
use crate::catalog::{Catalog, FlushMode, FlushScheduler, PeerId, Slot};
use crate::clock::{Clock, SystemClock};
use crate::config::StorageConfig;
use crate::container::{profile_key, to_file_part, ContainerError, Containers, DecryptedFile, FileKey, FileOptions, PathKind};
use crate::crypto::{decrypt_local, EncryptedDescriptor, LocalKey};
use crate::fs::FileSystem;
use crate::keys::{KeyError, KeyManager, PasscodeChange};
use crate::loader::{Completion, TaskId, TaskQueue};
use crate::locations::{FileLocation, Locations};
use crate::records::{DraftCursors, Drafts, SlotRecord};
use crate::settings::{
    read_legacy_config, retire_legacy_config, settings_file_name, AppSettings, SettingsFile, SettingsRead,
    UserSettings,
};

/// Name of the catalog container in the profile directory
pub const MAP_FILE: &str = "map";

/// Suffix that keeps test-mode profiles apart from production ones
const TEST_MODE_SUFFIX: &str = ":/test/";

// ============================================================
// TYPES
// ============================================================

/// Error types for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage is not loaded")]
    NotLoaded,
    #[error("Slot {0:?} is managed by the storage itself")]
    ReservedSlot(Slot),
    #[error("Key type does not match category {0:?}")]
    WrongCategory(BlobCategory),
    #[error("Container error: {0}")]
    Container(ContainerError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

impl From<ContainerError> for StorageError {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::Io(io) => Self::Io(io),
            other => Self::Container(other),
        }
    }
}

/// Outcome of [`Storage::load`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadResult {
    Done,
    PasscodeNeeded,
    Failed,
}

/// Outcome of [`Storage::begin_load`]
#[derive(Debug)]
pub enum LoadStart {
    /// No key derivation needed; the load already has its result
    Finished(LoadResult),
    /// Derivation runs on a dedicated thread; hand its result to
    /// [`Storage::complete_load`]
    Unlocking(Receiver<Result<KeyManager, KeyError>>),
}

/// Map header and table read from disk, still locked
struct SealedMap {
    version: i32,
    salt: Vec<u8>,
    wrapped: Vec<u8>,
    encrypted: Vec<u8>,
}

/// Lifecycle state of the storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageState {
    NotLoaded,
    PasscodeNeeded,
    Ready,
}

/// Decrypted blob handed to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedBlob {
    pub format: FileFormat,
    pub data: Vec<u8>,
}

/// Receives the result of an async load on the owner's thread
pub type LoadCallback = Box<dyn FnOnce(Option<LoadedBlob>)>;

/// Entry count and storage size of one blob category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CategoryStats {
    pub count: usize,
    pub total_size: i64,
}

/// Snapshot of what a profile holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageStats {
    pub images: CategoryStats,
    pub stickers: CategoryStats,
    pub audios: CategoryStats,
    pub web_files: CategoryStats,
    pub drafts: usize,
    pub file_locations: usize,
    pub aliases: usize,
}

/// Background deletion of files that are no longer referenced
#[derive(Debug)]
#[must_use = "dropping a Reclaim detaches the deletion thread"]
pub struct Reclaim(Option<JoinHandle<()>>);

impl Reclaim {
    fn none() -> Self {
        Self(None)
    }

    /// Block until every file is deleted
    pub fn wait(self) {
        if let Some(handle) = self.0 {
            if handle.join().is_err() {
                warn!("reclaim thread panicked");
            }
        }
    }
}

/// Catalog entry addressed by an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Draft(PeerId),
    Cursor(PeerId),
    Slot(Slot),
}

impl Entry {
    fn key(self, catalog: &Catalog) -> Option<FileKey> {
        match self {
            Self::Draft(peer) => catalog.draft_key(peer),
            Self::Cursor(peer) => catalog.cursor_key(peer),
            Self::Slot(slot) => catalog.slot_key(slot),
        }
    }

    fn set(self, catalog: &mut Catalog, key: FileKey) {
        match self {
            Self::Draft(peer) => catalog.set_draft_key(peer, key),
            Self::Cursor(peer) => catalog.set_cursor_key(peer, key),
            Self::Slot(slot) => catalog.set_slot_key(slot, key),
        }
    }

    fn remove(self, catalog: &mut Catalog) -> Option<FileKey> {
        match self {
            Self::Draft(peer) => catalog.remove_draft_key(peer),
            Self::Cursor(peer) => catalog.remove_cursor_key(peer),
            Self::Slot(slot) => catalog.remove_slot_key(slot),
        }
    }
}

/// Index key of a blob waiting for its async load
#[derive(Debug, Clone)]
enum PendingKey {
    Content(ContentKey),
    Web(String),
}

struct PendingLoad {
    category: BlobCategory,
    file: FileKey,
    key: PendingKey,
    callback: LoadCallback,
}

/// Key types that select a blob index
trait IndexedKey: BlobKey {
    fn index(blobs: &mut BlobIndices, category: BlobCategory) -> Option<&mut BlobIndex<Self>>;
    fn pending(&self) -> PendingKey;
}

impl IndexedKey for ContentKey {
    fn index(blobs: &mut BlobIndices, category: BlobCategory) -> Option<&mut BlobIndex<Self>> {
        blobs.content_mut(category)
    }

    fn pending(&self) -> PendingKey {
        PendingKey::Content(*self)
    }
}

impl IndexedKey for String {
    fn index(blobs: &mut BlobIndices, category: BlobCategory) -> Option<&mut BlobIndex<Self>> {
        match category {
            BlobCategory::WebFiles => Some(&mut blobs.web_files),
            _ => None,
        }
    }

    fn pending(&self) -> PendingKey {
        PendingKey::Web(self.clone())
    }
}

/// Read and decode one blob file; runs on the caller or the loader thread
fn load_blob<F: FileSystem, K: BlobKey>(
    containers: &Containers<F>,
    local_key: &LocalKey,
    category: BlobCategory,
    file: FileKey,
    expected: &K,
) -> Option<LoadedBlob> {
    let decrypted = containers.read_encrypted(file, FileOptions::USER_SINGLE, local_key)?;
    let record = match BlobRecord::<K>::decode(&mut decrypted.reader(), category) {
        Ok(record) => record,
        Err(e) => {
            warn!(key = %to_file_part(file), error = %e, "could not decode blob record");
            return None;
        }
    };
    if record.key != *expected {
        warn!(key = %to_file_part(file), stored = ?record.key, expected = ?expected, "blob key mismatch");
    }
    let format = record.format.resolve(&record.data);
    Some(LoadedBlob { format, data: record.data })
}

// ============================================================
// STORAGE
// ============================================================

/// Encrypted local storage of one profile
pub struct Storage<F: FileSystem + Clone + 'static> {
    config: StorageConfig,
    clock: Arc<dyn Clock>,
    containers: Containers<F>,
    state: StorageState,
    keys: Option<KeyManager>,
    sealed_map: Option<SealedMap>,

    catalog: Catalog,
    map_flush: FlushScheduler,

    locations: Locations,
    locations_loaded: bool,
    locations_dirty: bool,
    locations_flush: FlushScheduler,

    blobs: Mutex<BlobIndices>,
    loader: TaskQueue<LoadedBlob>,
    pending: HashMap<TaskId, PendingLoad>,

    settings_file: SettingsFile,
    app_settings: AppSettings,
    user_settings: Option<UserSettings>,
    legacy_user: Option<UserSettings>,
}

impl<F: FileSystem + Clone + 'static> Storage<F> {
    /// Open the base directory and the profile named `data_name`
    ///
    /// Reads (or creates) the app-wide settings file; the profile itself is
    /// read by [`Storage::load`].
    pub fn init(
        fs: F,
        base_path: impl Into<PathBuf>,
        data_name: &str,
        config: StorageConfig,
    ) -> Result<Self, StorageError> {
        Self::init_with_clock(fs, base_path, data_name, config, Arc::new(SystemClock))
    }

    /// [`Storage::init`] with an explicit time source
    pub fn init_with_clock(
        fs: F,
        base_path: impl Into<PathBuf>,
        data_name: &str,
        config: StorageConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let base_path = base_path.into();
        let name = if config.test_mode() {
            format!("{data_name}{TEST_MODE_SUFFIX}")
        } else {
            data_name.to_owned()
        };
        let profile = base_path.join(to_file_part(profile_key(&name)));
        fs.create_dir_all(&profile)?;
        info!(profile = %profile.display(), "opening storage");

        let containers = Containers::new(fs, base_path, profile, config.app_version());
        let (settings_file, app_settings, legacy_user) = read_settings(&containers, &config);

        Ok(Self {
            map_flush: FlushScheduler::new(config.timing()),
            locations_flush: FlushScheduler::new(config.timing()),
            config,
            clock,
            containers,
            state: StorageState::NotLoaded,
            keys: None,
            sealed_map: None,
            catalog: Catalog::new(),
            locations: Locations::new(),
            locations_loaded: false,
            locations_dirty: false,
            blobs: Mutex::new(BlobIndices::default()),
            loader: TaskQueue::new(),
            pending: HashMap::new(),
            settings_file,
            app_settings,
            user_settings: None,
            legacy_user,
        })
    }

    #[must_use]
    pub fn state(&self) -> StorageState {
        self.state
    }

    /// Directory holding the profile's files
    #[must_use]
    pub fn profile_path(&self) -> &Path {
        self.containers.dir(PathKind::User)
    }

    fn ensure_ready(&self) -> Result<(), StorageError> {
        match self.state {
            StorageState::Ready => Ok(()),
            _ => Err(StorageError::NotLoaded),
        }
    }

    fn keys(&self) -> Result<&KeyManager, StorageError> {
        self.keys.as_ref().ok_or(StorageError::NotLoaded)
    }

    // ----- map -----

    /// Read the catalog, unlocking it with `passcode`
    ///
    /// A missing map starts a fresh profile. A wrong passcode deletes
    /// nothing and leaves the storage waiting for another attempt.
    pub fn load(&mut self, passcode: &[u8]) -> LoadResult {
        let sealed = match self.read_sealed_map() {
            Ok(sealed) => sealed,
            Err(result) => return result,
        };
        let unlocked = KeyManager::unlock(passcode, &sealed.salt, &sealed.wrapped, *self.config.kdf());
        self.unseal_map(sealed, unlocked)
    }

    /// [`Storage::load`] with the passcode derivation off the owner thread
    pub fn begin_load(&mut self, passcode: &[u8]) -> LoadStart {
        let sealed = match self.read_sealed_map() {
            Ok(sealed) => sealed,
            Err(result) => return LoadStart::Finished(result),
        };
        let rx = KeyManager::unlock_in_background(
            passcode.to_vec(),
            sealed.salt.clone(),
            sealed.wrapped.clone(),
            *self.config.kdf(),
        );
        self.sealed_map = Some(sealed);
        LoadStart::Unlocking(rx)
    }

    /// Finish a [`Storage::begin_load`] with the unlock result
    pub fn complete_load(&mut self, unlocked: Result<KeyManager, KeyError>) -> LoadResult {
        if self.state == StorageState::Ready {
            return LoadResult::Done;
        }
        let Some(sealed) = self.sealed_map.take() else {
            warn!("no map waiting to be unlocked");
            return LoadResult::Failed;
        };
        self.unseal_map(sealed, unlocked)
    }

    /// Read the locked map; `Err` carries a result that needs no key
    fn read_sealed_map(&mut self) -> Result<SealedMap, LoadResult> {
        if self.state == StorageState::Ready {
            return Err(LoadResult::Done);
        }

        let Some(file) = self.containers.read(MAP_FILE, FileOptions::USER) else {
            if self.containers.written_by_newer(MAP_FILE, FileOptions::USER) {
                warn!("map written by a newer build");
                return Err(LoadResult::Failed);
            }
            info!("no map found, starting a fresh profile");
            self.keys = Some(KeyManager::bootstrap(*self.config.kdf()));
            self.state = StorageState::Ready;
            self.locations_loaded = true;
            self.catalog.mark_dirty();
            if let Err(e) = self.write_map() {
                warn!(error = %e, "could not write initial map");
            }
            return Err(LoadResult::Done);
        };

        let mut reader = file.reader();
        match (reader.read_bytes(), reader.read_bytes(), reader.read_bytes()) {
            (Ok(salt), Ok(wrapped), Ok(encrypted)) => Ok(SealedMap { version: file.version, salt, wrapped, encrypted }),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                warn!(error = %e, "malformed map");
                Err(LoadResult::Failed)
            }
        }
    }

    fn unseal_map(&mut self, sealed: SealedMap, unlocked: Result<KeyManager, KeyError>) -> LoadResult {
        let keys = match unlocked {
            Ok(keys) => keys,
            Err(KeyError::BadPasscode) => {
                debug!("map needs a passcode");
                self.state = StorageState::PasscodeNeeded;
                return LoadResult::PasscodeNeeded;
            }
            Err(e) => {
                warn!(error = %e, "could not unlock map");
                return LoadResult::Failed;
            }
        };

        let table = match decrypt_local(&sealed.encrypted, keys.local_key()) {
            Ok(table) => table,
            Err(e) => {
                warn!(error = %e, "could not decrypt map table");
                return LoadResult::Failed;
            }
        };

        let decoded = Catalog::decode(&table);
        self.catalog = decoded.catalog;
        *self.blobs.lock() = decoded.blobs;
        self.keys = Some(keys);
        self.state = StorageState::Ready;
        self.locations = Locations::new();
        self.locations_loaded = false;
        self.user_settings = None;

        if !decoded.complete || sealed.version < self.config.app_version() {
            debug!(version = sealed.version, complete = decoded.complete, "map will be rewritten");
            self.catalog.mark_dirty();
            let now = self.clock.now();
            self.map_flush.schedule(FlushMode::Fast, now);
        }
        info!(
            drafts = self.catalog.draft_peers().len(),
            images = self.blobs.lock().images.len(),
            "map loaded"
        );
        LoadResult::Done
    }

    fn mark_map_changed(&mut self, mode: FlushMode) -> Result<(), StorageError> {
        self.catalog.mark_dirty();
        if self.map_flush.schedule(mode, self.clock.now()) {
            self.write_map()?;
        }
        Ok(())
    }

    fn write_map(&mut self) -> Result<(), StorageError> {
        if !self.catalog.is_dirty() {
            return Ok(());
        }
        let keys = self.keys.as_ref().ok_or(StorageError::NotLoaded)?;
        let table = {
            let blobs = self.blobs.lock();
            self.catalog.encode(&blobs)
        };
        let encrypted = table.encrypt(keys.local_key());
        let segments = [keys.pass_salt().as_slice(), keys.wrapped_local_key(), encrypted.as_slice()];

        match self.containers.write(MAP_FILE, FileOptions::USER, &segments) {
            Ok(()) => {
                self.catalog.clear_dirty();
                self.map_flush.cancel();
                debug!("map written");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "could not write map");
                let now = self.clock.now();
                self.map_flush.schedule(FlushMode::Debounced, now);
                Err(e.into())
            }
        }
    }

    // ----- catalog entries -----

    /// Store `data` under the entry, allocating a file on first use;
    /// `None` frees the entry and its file
    fn write_entry(&mut self, entry: Entry, data: Option<EncryptedDescriptor>) -> Result<(), StorageError> {
        self.ensure_ready()?;
        let Some(data) = data else {
            if let Some(key) = entry.remove(&mut self.catalog) {
                self.containers.clear_key(key, FileOptions::USER);
                self.mark_map_changed(FlushMode::Immediate)?;
            }
            return Ok(());
        };

        let key = match entry.key(&self.catalog) {
            Some(key) => key,
            None => {
                let key = self.containers.generate_key(FileOptions::USER);
                entry.set(&mut self.catalog, key);
                self.mark_map_changed(FlushMode::Fast)?;
                key
            }
        };
        let keys = self.keys()?;
        self.containers
            .write_encrypted(key, FileOptions::USER, &data, keys.local_key())?;
        Ok(())
    }

    /// Read the entry's file; an unreadable one is dropped from the catalog
    fn read_entry(&mut self, entry: Entry) -> Result<Option<DecryptedFile>, StorageError> {
        self.ensure_ready()?;
        let Some(key) = entry.key(&self.catalog) else {
            return Ok(None);
        };
        let keys = self.keys()?;
        match self.containers.read_encrypted(key, FileOptions::USER, keys.local_key()) {
            Some(file) => Ok(Some(file)),
            None => {
                self.drop_entry(entry)?;
                Ok(None)
            }
        }
    }

    fn drop_entry(&mut self, entry: Entry) -> Result<(), StorageError> {
        if let Some(key) = entry.remove(&mut self.catalog) {
            debug!(?entry, key = %to_file_part(key), "dropping catalog entry");
            self.containers.discard_key(key, FileOptions::USER);
            self.mark_map_changed(FlushMode::Debounced)?;
        }
        Ok(())
    }

    fn write_record<R: SlotRecord>(&mut self, entry: Entry, record: &R) -> Result<(), StorageError> {
        if record.is_empty() {
            return self.write_entry(entry, None);
        }
        let mut data = EncryptedDescriptor::new();
        record.encode(&mut data.stream);
        self.write_entry(entry, Some(data))
    }

    fn read_record<R: SlotRecord>(&mut self, entry: Entry) -> Result<Option<R>, StorageError> {
        let Some(file) = self.read_entry(entry)? else {
            return Ok(None);
        };
        match R::decode(&mut file.reader(), file.version) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(?entry, error = %e, "could not decode record");
                self.drop_entry(entry)?;
                Ok(None)
            }
        }
    }

    fn check_slot(slot: Slot) -> Result<(), StorageError> {
        match slot {
            Slot::Locations | Slot::UserSettings => Err(StorageError::ReservedSlot(slot)),
            _ => Ok(()),
        }
    }

    // ----- drafts -----

    /// Store the drafts of `drafts.peer`; empty drafts free the entry
    pub fn put_drafts(&mut self, drafts: &Drafts) -> Result<(), StorageError> {
        self.write_record(Entry::Draft(drafts.peer), drafts)
    }

    pub fn get_drafts(&mut self, peer: PeerId) -> Result<Option<Drafts>, StorageError> {
        let entry = Entry::Draft(peer);
        let drafts: Option<Drafts> = self.read_record(entry)?;
        match drafts {
            Some(drafts) if drafts.peer != peer => {
                warn!(peer, stored = drafts.peer, "draft stored for another peer");
                self.drop_entry(entry)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    pub fn put_draft_cursors(&mut self, cursors: &DraftCursors) -> Result<(), StorageError> {
        self.write_record(Entry::Cursor(cursors.peer), cursors)
    }

    pub fn get_draft_cursors(&mut self, peer: PeerId) -> Result<Option<DraftCursors>, StorageError> {
        let entry = Entry::Cursor(peer);
        let cursors: Option<DraftCursors> = self.read_record(entry)?;
        match cursors {
            Some(cursors) if cursors.peer != peer => {
                warn!(peer, stored = cursors.peer, "draft cursors stored for another peer");
                self.drop_entry(entry)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Peers that have a stored draft
    #[must_use]
    pub fn draft_peers(&self) -> Vec<PeerId> {
        self.catalog.draft_peers()
    }

    // ----- single slots -----

    /// Store a profile list or the background; empty records free the slot
    pub fn put_slot<R: SlotRecord>(&mut self, slot: Slot, record: &R) -> Result<(), StorageError> {
        Self::check_slot(slot)?;
        self.write_record(Entry::Slot(slot), record)
    }

    pub fn get_slot<R: SlotRecord>(&mut self, slot: Slot) -> Result<Option<R>, StorageError> {
        Self::check_slot(slot)?;
        self.read_record(Entry::Slot(slot))
    }

    /// Free a slot and delete its file
    pub fn remove_slot(&mut self, slot: Slot) -> Result<(), StorageError> {
        Self::check_slot(slot)?;
        self.write_entry(Entry::Slot(slot), None)
    }

    #[must_use]
    pub fn has_slot(&self, slot: Slot) -> bool {
        self.catalog.slot_key(slot).is_some()
    }

    // ----- settings -----

    #[must_use]
    pub fn app_settings(&self) -> &AppSettings {
        &self.app_settings
    }

    /// Replace and persist the app-wide settings
    pub fn set_app_settings(&mut self, settings: AppSettings) -> Result<(), StorageError> {
        self.app_settings = settings;
        let name = settings_file_name(self.config.test_mode());
        if self.containers.written_by_newer(name, FileOptions::BASE) {
            warn!("settings written by a newer build, not overwriting");
            return Ok(());
        }
        self.settings_file.write(&self.containers, name, &self.app_settings)?;
        Ok(())
    }

    /// User settings of the profile, read on first access
    ///
    /// A profile without stored settings takes the ones migrated from the
    /// legacy config, or the defaults, and writes them.
    pub fn user_settings(&mut self) -> Result<UserSettings, StorageError> {
        self.ensure_ready()?;
        if let Some(settings) = &self.user_settings {
            return Ok(settings.clone());
        }

        let has_background = self.catalog.slot_key(Slot::Background).is_some();
        let app_version = self.config.app_version();
        let loaded = self.read_entry(Entry::Slot(Slot::UserSettings))?.map(|file| {
            let (settings, complete) = UserSettings::decode(&file.data, file.version, has_background);
            (settings, complete && file.version >= app_version)
        });

        let settings = match loaded {
            Some((settings, true)) => settings,
            Some((settings, false)) => {
                debug!("rewriting user settings");
                self.write_entry(Entry::Slot(Slot::UserSettings), Some(settings.encode()))?;
                settings
            }
            None => {
                let settings = self.legacy_user.take().unwrap_or_default();
                self.write_entry(Entry::Slot(Slot::UserSettings), Some(settings.encode()))?;
                settings
            }
        };
        self.user_settings = Some(settings.clone());
        Ok(settings)
    }

    pub fn put_user_settings(&mut self, settings: &UserSettings) -> Result<(), StorageError> {
        self.write_entry(Entry::Slot(Slot::UserSettings), Some(settings.encode()))?;
        self.user_settings = Some(settings.clone());
        Ok(())
    }

    // ----- locations -----

    fn ensure_locations(&mut self) -> Result<(), StorageError> {
        self.ensure_ready()?;
        if self.locations_loaded {
            return Ok(());
        }
        self.locations_loaded = true;
        let Some(file) = self.read_entry(Entry::Slot(Slot::Locations))? else {
            return Ok(());
        };
        let (locations, web_files) = Locations::decode(&file.data, file.version);
        debug!(
            files = locations.file_location_count(),
            aliases = locations.alias_count(),
            web_files = web_files.len(),
            "locations loaded"
        );
        self.locations = locations;
        self.blobs.lock().web_files = web_files;
        Ok(())
    }

    fn mark_locations_changed(&mut self, mode: FlushMode) -> Result<(), StorageError> {
        self.locations_dirty = true;
        if self.locations_flush.schedule(mode, self.clock.now()) {
            self.write_locations()?;
        }
        Ok(())
    }

    fn write_locations(&mut self) -> Result<(), StorageError> {
        if !self.locations_dirty {
            return Ok(());
        }
        self.locations_flush.cancel();
        let data = {
            let blobs = self.blobs.lock();
            if self.locations.is_empty() && blobs.web_files.is_empty() {
                None
            } else {
                Some(self.locations.encode(&blobs.web_files, self.config.app_version()))
            }
        };
        match self.write_entry(Entry::Slot(Slot::Locations), data) {
            Ok(()) => {
                self.locations_dirty = false;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "could not write locations");
                let now = self.clock.now();
                self.locations_flush.schedule(FlushMode::Debounced, now);
                Err(e)
            }
        }
    }

    /// Remember where a downloaded file was saved
    pub fn write_file_location(&mut self, key: ContentKey, location: FileLocation) -> Result<(), StorageError> {
        self.ensure_locations()?;
        if self.locations.write_file_location(key, location) {
            self.mark_locations_changed(FlushMode::Fast)?;
        }
        Ok(())
    }

    /// Saved location of `key`; with `check_exists` a vanished file drops the entry
    pub fn read_file_location(
        &mut self,
        key: ContentKey,
        check_exists: bool,
    ) -> Result<Option<FileLocation>, StorageError> {
        self.ensure_locations()?;
        let Some(location) = self.locations.file_location(key).cloned() else {
            return Ok(None);
        };
        if check_exists && !self.containers.fs().exists(Path::new(&location.name)) {
            debug!(name = %location.name, "saved file is gone");
            self.locations.remove_file_location(key);
            self.mark_locations_changed(FlushMode::Debounced)?;
            return Ok(None);
        }
        Ok(Some(location))
    }

    /// Make `from` resolve to `to`; returns false for a self-alias or a cycle
    pub fn add_alias(&mut self, from: ContentKey, to: ContentKey) -> Result<bool, StorageError> {
        self.ensure_locations()?;
        if !self.locations.add_alias(from, to) {
            return Ok(false);
        }
        self.mark_locations_changed(FlushMode::Debounced)?;
        Ok(true)
    }

    // ----- blobs -----

    fn put_indexed<K: IndexedKey>(
        &mut self,
        category: BlobCategory,
        key: K,
        data: &[u8],
        format: FileFormat,
        overwrite: bool,
    ) -> Result<bool, StorageError> {
        let existing = {
            let mut blobs = self.blobs.lock();
            let index = K::index(&mut blobs, category).ok_or(StorageError::WrongCategory(category))?;
            index.get(&key)
        };
        if existing.is_some() && !overwrite {
            return Ok(false);
        }

        let file = match existing {
            Some(desc) => desc.key,
            None => self.containers.generate_key(FileOptions::USER_SINGLE),
        };
        let size = storage_size(category, &key, data.len());
        let record = BlobRecord::new(key.clone(), format, data.to_vec());
        let keys = self.keys()?;
        self.containers
            .write_encrypted(file, FileOptions::USER_SINGLE, &record.encode(category), keys.local_key())?;

        let desc = FileDesc::new(file, size);
        let previous = {
            let mut blobs = self.blobs.lock();
            let index = K::index(&mut blobs, category).ok_or(StorageError::WrongCategory(category))?;
            index.insert(key, desc)
        };
        if previous != Some(desc) {
            self.mark_index_changed(category)?;
        }
        Ok(true)
    }

    fn mark_index_changed(&mut self, category: BlobCategory) -> Result<(), StorageError> {
        match category {
            BlobCategory::WebFiles => self.mark_locations_changed(FlushMode::Debounced),
            _ => self.mark_map_changed(FlushMode::Debounced),
        }
    }

    /// Store a media blob; an existing one is kept unless `overwrite`
    ///
    /// Returns whether the blob was written.
    pub fn put_blob(
        &mut self,
        category: BlobCategory,
        key: ContentKey,
        data: &[u8],
        format: FileFormat,
        overwrite: bool,
    ) -> Result<bool, StorageError> {
        self.ensure_ready()?;
        self.put_indexed(category, key, data, format, overwrite)
    }

    pub fn put_web_file(&mut self, url: &str, data: &[u8], overwrite: bool) -> Result<bool, StorageError> {
        self.ensure_locations()?;
        self.put_indexed(BlobCategory::WebFiles, url.to_owned(), data, FileFormat::Unknown, overwrite)
    }

    fn lookup<K: IndexedKey>(&mut self, category: BlobCategory, key: &K) -> Result<Option<FileDesc>, StorageError> {
        let mut blobs = self.blobs.lock();
        let index = K::index(&mut blobs, category).ok_or(StorageError::WrongCategory(category))?;
        Ok(index.get(key))
    }

    fn purge_blob(&mut self, category: BlobCategory, key: &PendingKey, file: FileKey) -> Result<(), StorageError> {
        let removed = {
            let mut blobs = self.blobs.lock();
            match key {
                PendingKey::Content(key) => blobs
                    .content_mut(category)
                    .and_then(|index| index.remove_if_file(key, file)),
                PendingKey::Web(url) => blobs.web_files.remove_if_file(url, file),
            }
        };
        if removed.is_some() {
            debug!(?category, key = %to_file_part(file), "purging unreadable blob");
            self.containers.discard_key(file, FileOptions::USER_SINGLE);
            self.mark_index_changed(category)?;
        }
        Ok(())
    }

    fn get_indexed<K: IndexedKey>(
        &mut self,
        category: BlobCategory,
        key: K,
    ) -> Result<Option<LoadedBlob>, StorageError> {
        let Some(desc) = self.lookup(category, &key)? else {
            return Ok(None);
        };
        let keys = self.keys()?;
        match load_blob(&self.containers, keys.local_key(), category, desc.key, &key) {
            Some(blob) => Ok(Some(blob)),
            None => {
                self.purge_blob(category, &key.pending(), desc.key)?;
                Ok(None)
            }
        }
    }

    /// Read a media blob, following one alias hop
    pub fn get_blob(&mut self, category: BlobCategory, key: ContentKey) -> Result<Option<LoadedBlob>, StorageError> {
        self.ensure_locations()?;
        let key = self.locations.resolve(key);
        self.get_indexed(category, key)
    }

    pub fn get_web_file(&mut self, url: &str) -> Result<Option<LoadedBlob>, StorageError> {
        self.ensure_locations()?;
        self.get_indexed(BlobCategory::WebFiles, url.to_owned())
    }

    fn submit_load<K: IndexedKey>(
        &mut self,
        category: BlobCategory,
        key: K,
        callback: LoadCallback,
    ) -> Result<Option<TaskId>, StorageError> {
        let Some(desc) = self.lookup(category, &key)? else {
            return Ok(None);
        };
        let containers = self.containers.clone();
        let local_key = self.keys()?.local_key().clone();
        let pending_key = key.pending();
        let file = desc.key;

        let id = self
            .loader
            .submit(move || load_blob(&containers, &local_key, category, file, &key));
        if !self.loader.is_pending(id) {
            return Ok(None);
        }
        self.pending.insert(id, PendingLoad { category, file, key: pending_key, callback });
        Ok(Some(id))
    }

    /// Load a blob on the background worker
    ///
    /// The callback runs on this thread from [`Storage::process_loaded`] or
    /// [`Storage::poll`]. Returns `None` when nothing is stored under `key`.
    pub fn get_blob_async(
        &mut self,
        category: BlobCategory,
        key: ContentKey,
        callback: impl FnOnce(Option<LoadedBlob>) + 'static,
    ) -> Result<Option<TaskId>, StorageError> {
        self.ensure_locations()?;
        let key = self.locations.resolve(key);
        self.submit_load(category, key, Box::new(callback))
    }

    pub fn get_web_file_async(
        &mut self,
        url: &str,
        callback: impl FnOnce(Option<LoadedBlob>) + 'static,
    ) -> Result<Option<TaskId>, StorageError> {
        self.ensure_locations()?;
        self.submit_load(BlobCategory::WebFiles, url.to_owned(), Box::new(callback))
    }

    /// Drop a queued load; its callback never runs
    pub fn cancel_load(&mut self, id: TaskId) -> bool {
        self.pending.remove(&id);
        self.loader.cancel(id)
    }

    /// Loads submitted and not yet delivered
    #[must_use]
    pub fn pending_loads(&self) -> usize {
        self.pending.len()
    }

    fn deliver(&mut self, completions: Vec<Completion<LoadedBlob>>) -> Result<usize, StorageError> {
        let mut delivered = 0;
        for completion in completions {
            let Some(pending) = self.pending.remove(&completion.id) else {
                continue;
            };
            if completion.result.is_none() {
                self.purge_blob(pending.category, &pending.key, pending.file)?;
            }
            (pending.callback)(completion.result);
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Run callbacks of finished loads; returns how many ran
    pub fn process_loaded(&mut self) -> Result<usize, StorageError> {
        let completions = self.loader.drain_completed();
        self.deliver(completions)
    }

    /// Block up to `timeout` for finished loads, then run their callbacks
    pub fn wait_loaded(&mut self, timeout: Duration) -> Result<usize, StorageError> {
        let completions = self.loader.wait_completed(timeout);
        self.deliver(completions)
    }

    // ----- flushing -----

    /// Deliver finished loads and run the flushes that are due
    pub fn poll(&mut self) -> Result<(), StorageError> {
        self.process_loaded()?;
        let now = self.clock.now();
        if self.locations_flush.take_due(now) {
            self.write_locations()?;
        }
        if self.map_flush.take_due(now) {
            self.write_map()?;
        }
        Ok(())
    }

    /// When `poll` next has work to do
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.map_flush.deadline(), self.locations_flush.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Write pending locations and map changes now
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.state != StorageState::Ready {
            return Ok(());
        }
        self.write_locations()?;
        self.write_map()
    }

    /// Flush, then stop the loader; pending callbacks are dropped
    pub fn finish(&mut self) -> Result<(), StorageError> {
        let flushed = self.flush();
        self.pending.clear();
        let timeout = self.config.timing().loader_shutdown;
        if !self.loader.shutdown(timeout) {
            warn!("loader still busy at shutdown");
        }
        info!("storage finished");
        flushed
    }

    // ----- passcode -----

    /// Re-wrap the local key under a new passcode and rewrite the map now
    pub fn change_passcode(&mut self, passcode: &[u8]) -> Result<(), StorageError> {
        self.ensure_ready()?;
        self.keys
            .as_mut()
            .ok_or(StorageError::NotLoaded)?
            .change_passcode(passcode);
        self.mark_map_changed(FlushMode::Immediate)
    }

    /// Start a passcode change whose derivation runs off the owner thread
    pub fn begin_change_passcode(&self, passcode: &[u8]) -> Result<PasscodeChange, StorageError> {
        self.ensure_ready()?;
        Ok(self.keys()?.begin_passcode_change(passcode))
    }

    /// Apply a finished [`Storage::begin_change_passcode`] and rewrite the map now
    pub fn complete_change_passcode(&mut self, change: PasscodeChange) -> Result<(), StorageError> {
        self.ensure_ready()?;
        self.keys
            .as_mut()
            .ok_or(StorageError::NotLoaded)?
            .complete_passcode_change(change)?;
        self.mark_map_changed(FlushMode::Immediate)
    }

    #[must_use]
    pub fn check_passcode(&self, passcode: &[u8]) -> bool {
        self.keys.as_ref().is_some_and(|keys| keys.check_passcode(passcode))
    }

    #[must_use]
    pub fn has_passcode(&self) -> bool {
        self.keys.as_ref().is_some_and(KeyManager::has_passcode)
    }

    // ----- maintenance -----

    fn spawn_reclaim(&self, paths: Vec<PathBuf>) -> Reclaim {
        if paths.is_empty() {
            return Reclaim::none();
        }
        let fs = self.containers.fs().clone();
        let spawned = std::thread::Builder::new()
            .name("tdata-reclaim".into())
            .spawn(move || {
                let count = paths.len();
                for path in paths {
                    if fs.exists(&path) {
                        if let Err(e) = fs.remove_file(&path) {
                            warn!(path = %path.display(), error = %e, "could not delete file");
                        }
                    }
                }
                debug!(count, "reclaimed files");
            });
        match spawned {
            Ok(handle) => Reclaim(Some(handle)),
            Err(e) => {
                warn!(error = %e, "could not spawn reclaim thread");
                Reclaim::none()
            }
        }
    }

    /// Forget every blob of a category and delete the files in the background
    pub fn clear_category(&mut self, category: BlobCategory) -> Result<Reclaim, StorageError> {
        self.ensure_locations()?;
        let files = self.blobs.lock().take_files(category);
        if files.is_empty() {
            return Ok(Reclaim::none());
        }
        info!(?category, count = files.len(), "clearing category");

        match category {
            BlobCategory::WebFiles => {
                self.locations_dirty = true;
                self.write_locations()?;
            }
            _ => self.mark_map_changed(FlushMode::Immediate)?,
        }

        let paths = files
            .into_iter()
            .flat_map(|file| {
                let handle = self.containers.handle(&to_file_part(file), FileOptions::USER_SINGLE);
                let paths: Vec<PathBuf> = handle.paths().cloned().collect();
                paths
            })
            .collect();
        Ok(self.spawn_reclaim(paths))
    }

    /// Drop everything the profile holds and start over with fresh keys
    ///
    /// The map is rewritten right away; the old files are deleted in the
    /// background.
    pub fn reset(&mut self) -> Result<Reclaim, StorageError> {
        self.ensure_ready()?;
        for id in self.pending.keys().copied().collect::<Vec<_>>() {
            self.loader.cancel(id);
        }
        self.pending.clear();

        let map_paths: Vec<PathBuf> = self
            .containers
            .handle(MAP_FILE, FileOptions::USER)
            .paths()
            .cloned()
            .collect();
        let doomed: Vec<PathBuf> = self
            .containers
            .fs()
            .list_files(self.profile_path())?
            .into_iter()
            .filter(|path| !map_paths.contains(path))
            .collect();
        info!(files = doomed.len(), "resetting profile");

        self.catalog = Catalog::new();
        *self.blobs.lock() = BlobIndices::default();
        self.locations.clear();
        self.locations_loaded = true;
        self.locations_dirty = false;
        self.locations_flush.cancel();
        self.user_settings = None;
        self.keys = Some(KeyManager::bootstrap(*self.config.kdf()));
        self.mark_map_changed(FlushMode::Immediate)?;

        Ok(self.spawn_reclaim(doomed))
    }

    // ----- stats -----

    #[must_use]
    pub fn count(&self, category: BlobCategory) -> usize {
        self.blobs.lock().count(category)
    }

    #[must_use]
    pub fn total_size(&self, category: BlobCategory) -> i64 {
        self.blobs.lock().total(category)
    }

    pub fn stats(&mut self) -> Result<StorageStats, StorageError> {
        self.ensure_locations()?;
        let blobs = self.blobs.lock();
        let category = |category| CategoryStats {
            count: blobs.count(category),
            total_size: blobs.total(category),
        };
        Ok(StorageStats {
            images: category(BlobCategory::Images),
            stickers: category(BlobCategory::Stickers),
            audios: category(BlobCategory::Audios),
            web_files: category(BlobCategory::WebFiles),
            drafts: self.catalog.draft_peers().len(),
            file_locations: self.locations.file_location_count(),
            aliases: self.locations.alias_count(),
        })
    }
}

/// Read the settings file, migrating the legacy config when there is none
fn read_settings<F: FileSystem>(
    containers: &Containers<F>,
    config: &StorageConfig,
) -> (SettingsFile, AppSettings, Option<UserSettings>) {
    let name = settings_file_name(config.test_mode());
    let kdf = config.kdf();
    let write = |file: &SettingsFile, settings: &AppSettings| match file.write(containers, name, settings) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "could not write settings");
            false
        }
    };

    match SettingsFile::read(containers, name, kdf) {
        SettingsRead::Loaded { file, state, complete } => {
            if !complete || state.version < config.app_version() {
                debug!(version = state.version, complete, "rewriting settings");
                write(&file, &state.app);
            }
            (file, state.app, None)
        }
        SettingsRead::Invalid => {
            warn!("settings unreadable, writing defaults");
            let file = SettingsFile::generate(kdf);
            let settings = AppSettings::default();
            write(&file, &settings);
            (file, settings, None)
        }
        SettingsRead::Absent => {
            let file = SettingsFile::generate(kdf);
            if containers.written_by_newer(name, FileOptions::BASE) {
                warn!("settings written by a newer build, using defaults");
                return (file, AppSettings::default(), None);
            }
            let base = containers.dir(PathKind::Base);
            match read_legacy_config(containers.fs(), base, config.app_version()) {
                Some(state) => {
                    if write(&file, &state.app) {
                        retire_legacy_config(containers.fs(), base, config.keep_legacy_backup());
                        info!("legacy config migrated");
                    }
                    (file, state.app, Some(state.user))
                }
                None => {
                    let settings = AppSettings::default();
                    write(&file, &settings);
                    (file, settings, None)
                }
            }
        }
    }
}

// ============================================================
// TESTS
// ============================================================
