//! App-wide settings and the profile's user settings.
//!
//! Both are streams of `u32 tag | fields` records numbered by [`dbi`]. The
//! numbering is append-only: a tag is never reused, so any build can read
//! what an older one wrote. One decoder registry, built once, serves the
//! settings file, the user settings slot and the legacy flat `config` file.
//! Parsing stops at the first unknown tag and keeps what was read.
//!
//! The settings file lives in the base directory and is not tied to any
//! profile passcode:
//!
//! ```text
//! [settings salt] [records encrypted with PBKDF2("", salt)]
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::OnceLock;

use tracing::{debug, info, warn};

use crate::catalog::PeerId;
use crate::config::KdfValues;
use crate::container::{ContainerError, Containers, FileOptions};
use crate::crypto::{decrypt_local, generate_salt, EncryptedDescriptor, LocalKey, SALT_SIZE};
use crate::fs::FileSystem;
use crate::keys::derive_key;
use crate::stream::{StreamError, StreamReader, StreamWriter};

pub const SETTINGS_FILE: &str = "settings";
pub const SETTINGS_FILE_TEST: &str = "settings_test";
pub const LEGACY_CONFIG_FILE: &str = "config";
pub const LEGACY_CONFIG_BACKUP: &str = "config.bak";

/// Tile flag is trusted only from this version on, unless a background exists
pub const TILE_BACKGROUND_MIN_VERSION: i32 = 8005;

/// Settings record tags
pub mod dbi {
    pub const KEY: u32 = 0x00;
    pub const USER: u32 = 0x01;
    pub const DC_OPTION_OLD: u32 = 0x02;
    pub const CHAT_SIZE_MAX: u32 = 0x03;
    pub const MUTE_PEER: u32 = 0x04;
    pub const SEND_KEY: u32 = 0x05;
    pub const AUTO_START: u32 = 0x06;
    pub const START_MINIMIZED: u32 = 0x07;
    pub const SOUND_NOTIFY: u32 = 0x08;
    pub const WORK_MODE: u32 = 0x09;
    pub const SEEN_TRAY_TOOLTIP: u32 = 0x0a;
    pub const DESKTOP_NOTIFY: u32 = 0x0b;
    pub const AUTO_UPDATE: u32 = 0x0c;
    pub const LAST_UPDATE_CHECK: u32 = 0x0d;
    pub const WINDOW_POSITION: u32 = 0x0e;
    pub const CONNECTION_TYPE: u32 = 0x0f;
    // 0x10 reserved
    pub const DEFAULT_ATTACH: u32 = 0x11;
    pub const CATS_AND_DOGS: u32 = 0x12;
    pub const REPLACE_EMOJIS: u32 = 0x13;
    pub const ASK_DOWNLOAD_PATH: u32 = 0x14;
    pub const DOWNLOAD_PATH_OLD: u32 = 0x15;
    pub const SCALE: u32 = 0x16;
    pub const EMOJI_TAB_OLD: u32 = 0x17;
    pub const RECENT_EMOJIS_OLD: u32 = 0x18;
    pub const LOGGED_PHONE_NUMBER: u32 = 0x19;
    pub const MUTED_PEERS: u32 = 0x1a;
    // 0x1b reserved
    pub const NOTIFY_VIEW: u32 = 0x1c;
    pub const SEND_TO_MENU: u32 = 0x1d;
    pub const COMPRESS_PASTED_IMAGE: u32 = 0x1e;
    pub const LANG: u32 = 0x1f;
    pub const LANG_FILE: u32 = 0x20;
    pub const TILE_BACKGROUND: u32 = 0x21;
    pub const AUTO_LOCK: u32 = 0x22;
    pub const DIALOG_LAST_PATH: u32 = 0x23;
    pub const RECENT_EMOJIS: u32 = 0x24;
    pub const EMOJI_VARIANTS: u32 = 0x25;
    pub const RECENT_STICKERS: u32 = 0x26;
    pub const DC_OPTION: u32 = 0x27;
    pub const TRY_IPV6: u32 = 0x28;
    pub const SONG_VOLUME: u32 = 0x29;
    pub const WINDOWS_NOTIFICATIONS_OLD: u32 = 0x30;
    pub const INCLUDE_MUTED: u32 = 0x31;
    pub const MEGAGROUP_SIZE_MAX: u32 = 0x32;
    pub const DOWNLOAD_PATH: u32 = 0x33;
    pub const AUTO_DOWNLOAD: u32 = 0x34;
    pub const SAVED_GIFS_LIMIT: u32 = 0x35;
    pub const SHOWING_SAVED_GIFS: u32 = 0x36;
    pub const AUTO_PLAY: u32 = 0x37;
    pub const ADAPTIVE_FOR_WIDE: u32 = 0x38;
    pub const HIDDEN_PINNED_MESSAGES: u32 = 0x39;
    pub const DIALOGS_MODE: u32 = 0x40;
    pub const MODERATE_MODE: u32 = 0x41;
    pub const VIDEO_VOLUME: u32 = 0x42;
    pub const STICKERS_RECENT_LIMIT: u32 = 0x43;
    pub const NATIVE_NOTIFICATIONS: u32 = 0x44;
    pub const NOTIFICATIONS_COUNT: u32 = 0x45;
    pub const NOTIFICATIONS_CORNER: u32 = 0x46;

    pub const ENCRYPTED_WITH_SALT: u32 = 333;
    pub const ENCRYPTED: u32 = 444;

    // 500-600 reserved

    pub const VERSION: u32 = 666;
}

// ============================================================
// VALUE TYPES
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkMode {
    #[default]
    WindowAndTray,
    TrayOnly,
    WindowOnly,
}

impl WorkMode {
    fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::TrayOnly,
            2 => Self::WindowOnly,
            _ => Self::WindowAndTray,
        }
    }

    fn to_i32(self) -> i32 {
        match self {
            Self::WindowAndTray => 0,
            Self::TrayOnly => 1,
            Self::WindowOnly => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyView {
    #[default]
    ShowPreview,
    ShowName,
    ShowNothing,
}

impl NotifyView {
    fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::ShowName,
            2 => Self::ShowNothing,
            _ => Self::ShowPreview,
        }
    }

    fn to_i32(self) -> i32 {
        match self {
            Self::ShowPreview => 0,
            Self::ShowName => 1,
            Self::ShowNothing => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultAttach {
    #[default]
    Document,
    Photo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DialogsMode {
    #[default]
    All,
    Important,
}

/// Manual proxy parameters
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProxyData {
    pub host: String,
    pub port: u32,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionType {
    #[default]
    Auto,
    HttpProxy(ProxyData),
    TcpProxy(ProxyData),
}

impl ConnectionType {
    fn to_i32(&self) -> i32 {
        match self {
            Self::Auto => 0,
            Self::HttpProxy(_) => 2,
            Self::TcpProxy(_) => 3,
        }
    }

    #[must_use]
    pub fn proxy(&self) -> Option<&ProxyData> {
        match self {
            Self::Auto => None,
            Self::HttpProxy(proxy) | Self::TcpProxy(proxy) => Some(proxy),
        }
    }
}

/// Settings shared by every profile on the machine
#[derive(Debug, Clone, PartialEq)]
pub struct AppSettings {
    pub chat_size_max: i32,
    pub megagroup_size_max: i32,
    pub saved_gifs_limit: i32,
    pub stickers_recent_limit: i32,
    pub auto_start: bool,
    pub start_minimized: bool,
    pub send_to_menu: bool,
    pub work_mode: WorkMode,
    pub seen_tray_tooltip: bool,
    pub auto_update: bool,
    pub last_update_check: i32,
    /// 0 is automatic, 1..=4 are fixed steps
    pub scale: i32,
    pub lang: i32,
    pub lang_file: String,
    pub connection: ConnectionType,
    pub try_ipv6: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            chat_size_max: 200,
            megagroup_size_max: 1000,
            saved_gifs_limit: 200,
            stickers_recent_limit: 30,
            auto_start: false,
            start_minimized: false,
            send_to_menu: false,
            work_mode: WorkMode::default(),
            seen_tray_tooltip: false,
            auto_update: true,
            last_update_check: 0,
            scale: 0,
            lang: 0,
            lang_file: String::new(),
            connection: ConnectionType::default(),
            try_ipv6: true,
        }
    }
}

/// Per-profile preferences stored in the user settings slot
#[derive(Debug, Clone, PartialEq)]
pub struct UserSettings {
    pub ctrl_enter: bool,
    pub tile_background: bool,
    pub adaptive_for_wide: bool,
    /// Seconds of inactivity before locking
    pub auto_lock: i32,
    pub replace_emojis: bool,
    pub default_attach: DefaultAttach,
    pub sound_notify: bool,
    pub include_muted: bool,
    pub showing_saved_gifs: bool,
    pub desktop_notify: bool,
    pub notify_view: NotifyView,
    pub native_notifications: bool,
    pub notifications_count: i32,
    pub notifications_corner: i32,
    pub ask_download_path: bool,
    pub download_path: String,
    pub download_path_bookmark: Vec<u8>,
    pub compress_pasted_image: bool,
    pub dialog_last_path: String,
    /// 0.0..=1.0
    pub song_volume: f64,
    pub video_volume: f64,
    pub auto_download_photo: i32,
    pub auto_download_audio: i32,
    pub auto_download_gif: i32,
    pub dialogs_mode_enabled: bool,
    pub dialogs_mode: DialogsMode,
    pub moderate_mode: bool,
    pub auto_play_gif: bool,
    pub recent_emojis: Vec<(u64, u16)>,
    pub emoji_variants: BTreeMap<u32, u64>,
    pub recent_stickers: Vec<(u64, u16)>,
    pub hidden_pinned_messages: BTreeMap<PeerId, i32>,
}

const DEFAULT_VOLUME: f64 = 0.9;
const DEFAULT_NOTIFICATIONS_COUNT: i32 = 3;
/// Bottom right
const DEFAULT_NOTIFICATIONS_CORNER: i32 = 2;

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            ctrl_enter: false,
            tile_background: false,
            adaptive_for_wide: true,
            auto_lock: 3600,
            replace_emojis: true,
            default_attach: DefaultAttach::default(),
            sound_notify: true,
            include_muted: true,
            showing_saved_gifs: false,
            desktop_notify: true,
            notify_view: NotifyView::default(),
            native_notifications: false,
            notifications_count: DEFAULT_NOTIFICATIONS_COUNT,
            notifications_corner: DEFAULT_NOTIFICATIONS_CORNER,
            ask_download_path: false,
            download_path: String::new(),
            download_path_bookmark: Vec::new(),
            compress_pasted_image: true,
            dialog_last_path: String::new(),
            song_volume: DEFAULT_VOLUME,
            video_volume: DEFAULT_VOLUME,
            auto_download_photo: 0,
            auto_download_audio: 0,
            auto_download_gif: 0,
            dialogs_mode_enabled: false,
            dialogs_mode: DialogsMode::default(),
            moderate_mode: false,
            auto_play_gif: true,
            recent_emojis: Vec::new(),
            emoji_variants: BTreeMap::new(),
            recent_stickers: Vec::new(),
            hidden_pinned_messages: BTreeMap::new(),
        }
    }
}

/// Directory paths get a trailing slash; the "tmp" marker is kept as is
fn normalize_download_path(mut path: String) -> String {
    if !path.is_empty() && path != "tmp" && !path.ends_with('/') {
        path.push('/');
    }
    path
}

fn volume_from_stored(value: i32) -> f64 {
    (f64::from(value) / 1e6).clamp(0.0, 1.0)
}

fn volume_to_stored(value: f64) -> i32 {
    (value.clamp(0.0, 1.0) * 1e6).round() as i32
}

/// Single-codepoint flags of old builds mapped to the full flag pair
const OLD_FLAG_EMOJIS: [(u64, u64); 10] = [
    (0xD83C_DDEF, 0xD83C_DDEF_D83C_DDF5),
    (0xD83C_DDF0, 0xD83C_DDF0_D83C_DDF7),
    (0xD83C_DDE9, 0xD83C_DDE9_D83C_DDEA),
    (0xD83C_DDE8, 0xD83C_DDE8_D83C_DDF3),
    (0xD83C_DDFA, 0xD83C_DDFA_D83C_DDF8),
    (0xD83C_DDEB, 0xD83C_DDEB_D83C_DDF7),
    (0xD83C_DDEA, 0xD83C_DDEA_D83C_DDF8),
    (0xD83C_DDEE, 0xD83C_DDEE_D83C_DDF9),
    (0xD83C_DDF7, 0xD83C_DDF7_D83C_DDFA),
    (0xD83C_DDEC, 0xD83C_DDEC_D83C_DDE7),
];

fn upgrade_old_emoji(code: u64) -> u64 {
    OLD_FLAG_EMOJIS
        .iter()
        .find(|(old, _)| *old == code)
        .map_or(code, |(_, new)| *new)
}

// ============================================================
// DECODER REGISTRY
// ============================================================

/// Everything a settings stream can carry
#[derive(Debug, Clone, Default)]
pub struct SettingsState {
    pub app: AppSettings,
    pub user: UserSettings,
    /// App version that wrote the stream
    pub version: i32,
    /// Whether the profile has a stored background
    pub has_background: bool,
}

type Decoder = fn(&mut StreamReader<'_>, &mut SettingsState) -> Result<(), StreamError>;

macro_rules! decoder {
    (|$s:ident, $st:ident| $body:block) => {{
        fn decode($s: &mut StreamReader<'_>, $st: &mut SettingsState) -> Result<(), StreamError> {
            $body
            Ok(())
        }
        decode as Decoder
    }};
}

fn read_pairs_u64_u16(s: &mut StreamReader<'_>) -> Result<Vec<(u64, u16)>, StreamError> {
    let count = s.read_u32()?;
    let mut out = Vec::new();
    for _ in 0..count {
        out.push((s.read_u64()?, s.read_u16()?));
    }
    Ok(out)
}

fn build_registry() -> HashMap<u32, Decoder> {
    let mut r: HashMap<u32, Decoder> = HashMap::new();

    // Network layer records: consumed, not kept
    r.insert(dbi::KEY, decoder!(|s, _st| {
        s.read_i32()?;
        s.skip(256)?;
        debug!("dropping legacy auth key record");
    }));
    r.insert(dbi::USER, decoder!(|s, _st| {
        s.read_i32()?;
        s.read_u32()?;
    }));

    r.insert(dbi::DC_OPTION_OLD, decoder!(|s, _st| {
        s.read_u32()?;
        s.read_string()?;
        s.read_string()?;
        s.read_u32()?;
    }));
    r.insert(dbi::DC_OPTION, decoder!(|s, _st| {
        s.read_u32()?;
        s.read_i32()?;
        s.read_string()?;
        s.read_u32()?;
    }));

    r.insert(dbi::CHAT_SIZE_MAX, decoder!(|s, st| { st.app.chat_size_max = s.read_i32()?; }));
    r.insert(dbi::MEGAGROUP_SIZE_MAX, decoder!(|s, st| { st.app.megagroup_size_max = s.read_i32()?; }));
    r.insert(dbi::SAVED_GIFS_LIMIT, decoder!(|s, st| { st.app.saved_gifs_limit = s.read_i32()?; }));
    r.insert(dbi::STICKERS_RECENT_LIMIT, decoder!(|s, st| { st.app.stickers_recent_limit = s.read_i32()?; }));
    r.insert(dbi::AUTO_START, decoder!(|s, st| { st.app.auto_start = s.read_bool()?; }));
    r.insert(dbi::START_MINIMIZED, decoder!(|s, st| { st.app.start_minimized = s.read_bool()?; }));
    r.insert(dbi::SEND_TO_MENU, decoder!(|s, st| { st.app.send_to_menu = s.read_bool()?; }));
    r.insert(dbi::WORK_MODE, decoder!(|s, st| { st.app.work_mode = WorkMode::from_i32(s.read_i32()?); }));
    r.insert(dbi::SEEN_TRAY_TOOLTIP, decoder!(|s, st| { st.app.seen_tray_tooltip = s.read_bool()?; }));
    r.insert(dbi::AUTO_UPDATE, decoder!(|s, st| { st.app.auto_update = s.read_bool()?; }));
    r.insert(dbi::LAST_UPDATE_CHECK, decoder!(|s, st| { st.app.last_update_check = s.read_i32()?; }));
    r.insert(dbi::TRY_IPV6, decoder!(|s, st| { st.app.try_ipv6 = s.read_bool()?; }));
    r.insert(dbi::SCALE, decoder!(|s, st| {
        let v = s.read_i32()?;
        if (0..=4).contains(&v) {
            st.app.scale = v;
        }
    }));
    r.insert(dbi::LANG, decoder!(|s, st| {
        // -1 is the test language
        let v = s.read_i32()?;
        if v >= -1 {
            st.app.lang = v;
        }
    }));
    r.insert(dbi::LANG_FILE, decoder!(|s, st| { st.app.lang_file = s.read_string()?; }));
    r.insert(dbi::CONNECTION_TYPE, decoder!(|s, st| {
        let v = s.read_i32()?;
        st.app.connection = match v {
            2 | 3 => {
                let host = s.read_string()?;
                let port = s.read_i32()? as u32;
                let user = s.read_string()?;
                let password = s.read_string()?;
                let proxy = ProxyData { host, port, user, password };
                if v == 2 {
                    ConnectionType::HttpProxy(proxy)
                } else {
                    ConnectionType::TcpProxy(proxy)
                }
            }
            _ => ConnectionType::Auto,
        };
    }));
    // Window geometry and the phone number belong to the UI layer
    r.insert(dbi::WINDOW_POSITION, decoder!(|s, _st| { s.skip(6 * 4)?; }));
    r.insert(dbi::LOGGED_PHONE_NUMBER, decoder!(|s, _st| { s.read_string()?; }));

    // Deprecated records
    r.insert(dbi::MUTE_PEER, decoder!(|s, _st| { s.read_u64()?; }));
    r.insert(dbi::MUTED_PEERS, decoder!(|s, _st| {
        let count = s.read_u32()?;
        for _ in 0..count {
            s.read_u64()?;
        }
    }));
    r.insert(dbi::CATS_AND_DOGS, decoder!(|s, _st| { s.read_i32()?; }));
    r.insert(dbi::EMOJI_TAB_OLD, decoder!(|s, _st| { s.read_i32()?; }));
    r.insert(dbi::WINDOWS_NOTIFICATIONS_OLD, decoder!(|s, _st| { s.read_i32()?; }));

    r.insert(dbi::SEND_KEY, decoder!(|s, st| { st.user.ctrl_enter = s.read_i32()? == 1; }));
    r.insert(dbi::TILE_BACKGROUND, decoder!(|s, st| {
        let v = s.read_i32()?;
        st.user.tile_background = if st.version < TILE_BACKGROUND_MIN_VERSION && !st.has_background {
            false
        } else {
            v == 1
        };
    }));
    r.insert(dbi::ADAPTIVE_FOR_WIDE, decoder!(|s, st| { st.user.adaptive_for_wide = s.read_bool()?; }));
    r.insert(dbi::AUTO_LOCK, decoder!(|s, st| { st.user.auto_lock = s.read_i32()?; }));
    r.insert(dbi::REPLACE_EMOJIS, decoder!(|s, st| { st.user.replace_emojis = s.read_bool()?; }));
    r.insert(dbi::DEFAULT_ATTACH, decoder!(|s, st| {
        st.user.default_attach = if s.read_i32()? == 1 { DefaultAttach::Photo } else { DefaultAttach::Document };
    }));
    r.insert(dbi::SOUND_NOTIFY, decoder!(|s, st| { st.user.sound_notify = s.read_bool()?; }));
    r.insert(dbi::INCLUDE_MUTED, decoder!(|s, st| { st.user.include_muted = s.read_bool()?; }));
    r.insert(dbi::SHOWING_SAVED_GIFS, decoder!(|s, st| { st.user.showing_saved_gifs = s.read_bool()?; }));
    r.insert(dbi::DESKTOP_NOTIFY, decoder!(|s, st| { st.user.desktop_notify = s.read_bool()?; }));
    r.insert(dbi::NOTIFY_VIEW, decoder!(|s, st| { st.user.notify_view = NotifyView::from_i32(s.read_i32()?); }));
    r.insert(dbi::NATIVE_NOTIFICATIONS, decoder!(|s, st| { st.user.native_notifications = s.read_bool()?; }));
    r.insert(dbi::NOTIFICATIONS_COUNT, decoder!(|s, st| {
        let v = s.read_i32()?;
        st.user.notifications_count = if v > 0 { v } else { DEFAULT_NOTIFICATIONS_COUNT };
    }));
    r.insert(dbi::NOTIFICATIONS_CORNER, decoder!(|s, st| {
        let v = s.read_i32()?;
        st.user.notifications_corner = if (0..4).contains(&v) { v } else { DEFAULT_NOTIFICATIONS_CORNER };
    }));
    r.insert(dbi::ASK_DOWNLOAD_PATH, decoder!(|s, st| { st.user.ask_download_path = s.read_bool()?; }));
    r.insert(dbi::DOWNLOAD_PATH_OLD, decoder!(|s, st| {
        st.user.download_path = normalize_download_path(s.read_string()?);
        st.user.download_path_bookmark = Vec::new();
    }));
    r.insert(dbi::DOWNLOAD_PATH, decoder!(|s, st| {
        st.user.download_path = normalize_download_path(s.read_string()?);
        st.user.download_path_bookmark = s.read_bytes()?;
    }));
    r.insert(dbi::COMPRESS_PASTED_IMAGE, decoder!(|s, st| { st.user.compress_pasted_image = s.read_bool()?; }));
    r.insert(dbi::DIALOG_LAST_PATH, decoder!(|s, st| { st.user.dialog_last_path = s.read_string()?; }));
    r.insert(dbi::SONG_VOLUME, decoder!(|s, st| { st.user.song_volume = volume_from_stored(s.read_i32()?); }));
    r.insert(dbi::VIDEO_VOLUME, decoder!(|s, st| { st.user.video_volume = volume_from_stored(s.read_i32()?); }));
    r.insert(dbi::AUTO_DOWNLOAD, decoder!(|s, st| {
        st.user.auto_download_photo = s.read_i32()?;
        st.user.auto_download_audio = s.read_i32()?;
        st.user.auto_download_gif = s.read_i32()?;
    }));
    r.insert(dbi::DIALOGS_MODE, decoder!(|s, st| {
        let enabled = s.read_i32()?;
        let mode = s.read_i32()?;
        st.user.dialogs_mode_enabled = enabled == 1;
        st.user.dialogs_mode = if enabled != 0 && mode == 1 { DialogsMode::Important } else { DialogsMode::All };
    }));
    r.insert(dbi::MODERATE_MODE, decoder!(|s, st| { st.user.moderate_mode = s.read_bool()?; }));
    r.insert(dbi::AUTO_PLAY, decoder!(|s, st| { st.user.auto_play_gif = s.read_bool()?; }));
    r.insert(dbi::RECENT_EMOJIS_OLD, decoder!(|s, st| {
        let count = s.read_u32()?;
        let mut emojis = Vec::new();
        for _ in 0..count {
            let code = u64::from(s.read_u32()?);
            let rating = s.read_u16()?;
            emojis.push((upgrade_old_emoji(code), rating));
        }
        if !emojis.is_empty() {
            st.user.recent_emojis = emojis;
        }
    }));
    r.insert(dbi::RECENT_EMOJIS, decoder!(|s, st| { st.user.recent_emojis = read_pairs_u64_u16(s)?; }));
    r.insert(dbi::RECENT_STICKERS, decoder!(|s, st| { st.user.recent_stickers = read_pairs_u64_u16(s)?; }));
    r.insert(dbi::EMOJI_VARIANTS, decoder!(|s, st| {
        let count = s.read_u32()?;
        let mut variants = BTreeMap::new();
        for _ in 0..count {
            let code = s.read_u32()?;
            let variant = s.read_u64()?;
            variants.insert(code, variant);
        }
        st.user.emoji_variants = variants;
    }));
    r.insert(dbi::HIDDEN_PINNED_MESSAGES, decoder!(|s, st| {
        let count = s.read_u32()?;
        let mut hidden = BTreeMap::new();
        for _ in 0..count {
            let peer = s.read_u64()?;
            let msg_id = s.read_i32()?;
            hidden.insert(peer, msg_id);
        }
        st.user.hidden_pinned_messages = hidden;
    }));

    r
}

fn registry() -> &'static HashMap<u32, Decoder> {
    static REGISTRY: OnceLock<HashMap<u32, Decoder>> = OnceLock::new();
    REGISTRY.get_or_init(build_registry)
}

/// Decode one record body; `Ok(false)` for a tag nobody knows
pub fn read_setting(tag: u32, reader: &mut StreamReader<'_>, state: &mut SettingsState) -> Result<bool, StreamError> {
    match registry().get(&tag) {
        Some(decode) => decode(reader, state).map(|()| true),
        None => Ok(false),
    }
}

/// Decode records until the end of the stream; false if parsing stopped early
pub fn read_records(reader: &mut StreamReader<'_>, state: &mut SettingsState) -> bool {
    while !reader.at_end() {
        let tag = match reader.read_u32() {
            Ok(tag) => tag,
            Err(e) => {
                warn!(error = %e, "truncated settings tag");
                return false;
            }
        };
        match read_setting(tag, reader, state) {
            Ok(true) => {}
            Ok(false) => {
                warn!(tag, "unknown settings tag, keeping what was read");
                return false;
            }
            Err(e) => {
                warn!(tag, error = %e, "truncated settings record");
                return false;
            }
        }
    }
    true
}

// ============================================================
// WRITERS
// ============================================================

fn write_i32(w: &mut StreamWriter, tag: u32, value: i32) {
    w.write_u32(tag);
    w.write_i32(value);
}

fn write_flag(w: &mut StreamWriter, tag: u32, value: bool) {
    write_i32(w, tag, i32::from(value));
}

impl AppSettings {
    pub fn write_records(&self, w: &mut StreamWriter) {
        write_i32(w, dbi::CHAT_SIZE_MAX, self.chat_size_max);
        write_i32(w, dbi::MEGAGROUP_SIZE_MAX, self.megagroup_size_max);
        write_i32(w, dbi::SAVED_GIFS_LIMIT, self.saved_gifs_limit);
        write_i32(w, dbi::STICKERS_RECENT_LIMIT, self.stickers_recent_limit);
        write_flag(w, dbi::AUTO_START, self.auto_start);
        write_flag(w, dbi::START_MINIMIZED, self.start_minimized);
        write_flag(w, dbi::SEND_TO_MENU, self.send_to_menu);
        write_i32(w, dbi::WORK_MODE, self.work_mode.to_i32());
        write_flag(w, dbi::SEEN_TRAY_TOOLTIP, self.seen_tray_tooltip);
        write_flag(w, dbi::AUTO_UPDATE, self.auto_update);
        write_i32(w, dbi::LAST_UPDATE_CHECK, self.last_update_check);
        write_i32(w, dbi::SCALE, self.scale);
        write_i32(w, dbi::LANG, self.lang);
        w.write_u32(dbi::LANG_FILE);
        w.write_string(&self.lang_file);

        write_i32(w, dbi::CONNECTION_TYPE, self.connection.to_i32());
        if let Some(proxy) = self.connection.proxy() {
            w.write_string(&proxy.host);
            w.write_i32(proxy.port as i32);
            w.write_string(&proxy.user);
            w.write_string(&proxy.password);
        }
        write_flag(w, dbi::TRY_IPV6, self.try_ipv6);
    }
}

impl UserSettings {
    pub fn write_records(&self, w: &mut StreamWriter) {
        write_i32(w, dbi::SEND_KEY, i32::from(self.ctrl_enter));
        write_flag(w, dbi::TILE_BACKGROUND, self.tile_background);
        write_flag(w, dbi::ADAPTIVE_FOR_WIDE, self.adaptive_for_wide);
        write_i32(w, dbi::AUTO_LOCK, self.auto_lock);
        write_flag(w, dbi::REPLACE_EMOJIS, self.replace_emojis);
        write_i32(w, dbi::DEFAULT_ATTACH, i32::from(self.default_attach == DefaultAttach::Photo));
        write_flag(w, dbi::SOUND_NOTIFY, self.sound_notify);
        write_flag(w, dbi::INCLUDE_MUTED, self.include_muted);
        write_flag(w, dbi::SHOWING_SAVED_GIFS, self.showing_saved_gifs);
        write_flag(w, dbi::DESKTOP_NOTIFY, self.desktop_notify);
        write_i32(w, dbi::NOTIFY_VIEW, self.notify_view.to_i32());
        write_flag(w, dbi::NATIVE_NOTIFICATIONS, self.native_notifications);
        write_i32(w, dbi::NOTIFICATIONS_COUNT, self.notifications_count);
        write_i32(w, dbi::NOTIFICATIONS_CORNER, self.notifications_corner);
        write_flag(w, dbi::ASK_DOWNLOAD_PATH, self.ask_download_path);

        w.write_u32(dbi::DOWNLOAD_PATH);
        if self.ask_download_path {
            w.write_string("");
            w.write_bytes(&[]);
        } else {
            w.write_string(&self.download_path);
            w.write_bytes(&self.download_path_bookmark);
        }

        write_flag(w, dbi::COMPRESS_PASTED_IMAGE, self.compress_pasted_image);
        w.write_u32(dbi::DIALOG_LAST_PATH);
        w.write_string(&self.dialog_last_path);
        write_i32(w, dbi::SONG_VOLUME, volume_to_stored(self.song_volume));
        write_i32(w, dbi::VIDEO_VOLUME, volume_to_stored(self.video_volume));

        w.write_u32(dbi::AUTO_DOWNLOAD);
        w.write_i32(self.auto_download_photo);
        w.write_i32(self.auto_download_audio);
        w.write_i32(self.auto_download_gif);

        w.write_u32(dbi::DIALOGS_MODE);
        w.write_i32(i32::from(self.dialogs_mode_enabled));
        w.write_i32(i32::from(self.dialogs_mode == DialogsMode::Important));
        write_flag(w, dbi::MODERATE_MODE, self.moderate_mode);
        write_flag(w, dbi::AUTO_PLAY, self.auto_play_gif);

        w.write_u32(dbi::RECENT_EMOJIS);
        w.write_u32(self.recent_emojis.len() as u32);
        for (code, rating) in &self.recent_emojis {
            w.write_u64(*code);
            w.write_u16(*rating);
        }
        w.write_u32(dbi::EMOJI_VARIANTS);
        w.write_u32(self.emoji_variants.len() as u32);
        for (code, variant) in &self.emoji_variants {
            w.write_u32(*code);
            w.write_u64(*variant);
        }
        w.write_u32(dbi::RECENT_STICKERS);
        w.write_u32(self.recent_stickers.len() as u32);
        for (id, rating) in &self.recent_stickers {
            w.write_u64(*id);
            w.write_u16(*rating);
        }

        if !self.hidden_pinned_messages.is_empty() {
            w.write_u32(dbi::HIDDEN_PINNED_MESSAGES);
            w.write_u32(self.hidden_pinned_messages.len() as u32);
            for (peer, msg_id) in &self.hidden_pinned_messages {
                w.write_u64(*peer);
                w.write_i32(*msg_id);
            }
        }
    }

    #[must_use]
    pub fn encode(&self) -> EncryptedDescriptor {
        let mut out = EncryptedDescriptor::new();
        self.write_records(&mut out.stream);
        out
    }

    /// Decode a user settings payload; the flag is false when parsing stopped early
    ///
    /// Records belonging to the app-wide settings are accepted and dropped.
    #[must_use]
    pub fn decode(data: &[u8], version: i32, has_background: bool) -> (Self, bool) {
        let mut state = SettingsState {
            version,
            has_background,
            ..SettingsState::default()
        };
        let complete = read_records(&mut StreamReader::new(data), &mut state);
        (state.user, complete)
    }
}

// ============================================================
// SETTINGS FILE
// ============================================================

#[must_use]
pub fn settings_file_name(test_mode: bool) -> &'static str {
    if test_mode {
        SETTINGS_FILE_TEST
    } else {
        SETTINGS_FILE
    }
}

/// Salt and SettingsKey of the app-wide settings file
pub struct SettingsFile {
    salt: [u8; SALT_SIZE],
    key: LocalKey,
}

/// Outcome of reading the settings file
pub enum SettingsRead {
    Absent,
    /// Present but unreadable: bad salt or undecryptable
    Invalid,
    Loaded {
        file: SettingsFile,
        state: SettingsState,
        /// False when parsing stopped at an unknown or truncated record
        complete: bool,
    },
}

impl SettingsFile {
    /// Fresh salt and its key
    #[must_use]
    pub fn generate(kdf: &KdfValues) -> Self {
        let salt = generate_salt();
        let key = derive_key(b"", &salt, kdf);
        Self { salt, key }
    }

    #[must_use]
    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }

    pub fn write<F: FileSystem>(
        &self,
        containers: &Containers<F>,
        name: &str,
        settings: &AppSettings,
    ) -> Result<(), ContainerError> {
        let mut data = EncryptedDescriptor::new();
        settings.write_records(&mut data.stream);
        let encrypted = data.encrypt(&self.key);
        containers.write(name, FileOptions::BASE, &[self.salt.as_slice(), encrypted.as_slice()])
    }

    pub fn read<F: FileSystem>(containers: &Containers<F>, name: &str, kdf: &KdfValues) -> SettingsRead {
        let Some(file) = containers.read(name, FileOptions::BASE) else {
            return SettingsRead::Absent;
        };
        let mut reader = file.reader();
        let (salt, encrypted) = match (reader.read_bytes(), reader.read_bytes()) {
            (Ok(salt), Ok(encrypted)) => (salt, encrypted),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "malformed settings file");
                return SettingsRead::Invalid;
            }
        };
        if salt.len() != SALT_SIZE {
            warn!(size = salt.len(), "bad salt in settings file");
            return SettingsRead::Invalid;
        }

        let key = derive_key(b"", &salt, kdf);
        let data = match decrypt_local(&encrypted, &key) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "could not decrypt settings file");
                return SettingsRead::Invalid;
            }
        };

        let mut state = SettingsState {
            version: file.version,
            ..SettingsState::default()
        };
        let complete = read_records(&mut StreamReader::new(&data), &mut state);

        let mut fixed = [0u8; SALT_SIZE];
        fixed.copy_from_slice(&salt);
        SettingsRead::Loaded {
            file: SettingsFile { salt: fixed, key },
            state,
            complete,
        }
    }
}

impl std::fmt::Debug for SettingsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsFile").finish_non_exhaustive()
    }
}

// ============================================================
// LEGACY CONFIG
// ============================================================

/// Parse the flat unencrypted `config` file of old builds
///
/// The first unknown or truncated record ends parsing. Returns `None` when
/// there is no file or a newer build wrote it.
pub fn read_legacy_config<F: FileSystem + ?Sized>(fs: &F, base_path: &Path, app_version: i32) -> Option<SettingsState> {
    let path = base_path.join(LEGACY_CONFIG_FILE);
    if !fs.exists(&path) {
        return None;
    }
    let bytes = match fs.read_file(&path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "could not read legacy config");
            return None;
        }
    };
    info!("reading legacy config");

    let mut state = SettingsState::default();
    let mut reader = StreamReader::new(&bytes);
    while !reader.at_end() {
        let Ok(tag) = reader.read_u32() else {
            break;
        };
        if tag == dbi::VERSION {
            match reader.read_i32() {
                Ok(version) => {
                    state.version = version;
                    if version > app_version {
                        warn!(version, "legacy config written by a newer build");
                        return None;
                    }
                }
                Err(_) => break,
            }
            continue;
        }
        match read_setting(tag, &mut reader, &mut state) {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                warn!(tag, "stopping legacy config parse");
                break;
            }
        }
    }
    Some(state)
}

/// Move the legacy config out of the way once it has been migrated
pub fn retire_legacy_config<F: FileSystem + ?Sized>(fs: &F, base_path: &Path, keep_backup: bool) {
    let path = base_path.join(LEGACY_CONFIG_FILE);
    let result = if keep_backup {
        fs.rename(&path, &base_path.join(LEGACY_CONFIG_BACKUP))
    } else {
        fs.remove_file(&path)
    };
    if let Err(e) = result {
        warn!(error = %e, keep_backup, "could not retire legacy config");
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::APP_VERSION;
    use crate::fs::InMemoryFs;
    use std::path::PathBuf;

    fn containers(fs: &InMemoryFs) -> Containers<InMemoryFs> {
        Containers::new(
            fs.clone(),
            PathBuf::from("tdata"),
            PathBuf::from("tdata/D877F783D5D3EF8C"),
            APP_VERSION,
        )
    }

    fn custom_user_settings() -> UserSettings {
        let mut user = UserSettings {
            ctrl_enter: true,
            tile_background: true,
            auto_lock: 600,
            default_attach: DefaultAttach::Photo,
            notify_view: NotifyView::ShowName,
            notifications_count: 5,
            notifications_corner: 1,
            download_path: "/home/user/Downloads/".into(),
            download_path_bookmark: vec![1, 2, 3],
            dialog_last_path: "/tmp/last".into(),
            song_volume: 0.25,
            video_volume: 0.5,
            auto_download_photo: 1,
            auto_download_gif: 2,
            dialogs_mode_enabled: true,
            dialogs_mode: DialogsMode::Important,
            recent_emojis: vec![(0xD83D_DE00, 10), (0xD83D_DE02, 3)],
            recent_stickers: vec![(42, 1)],
            ..UserSettings::default()
        };
        user.emoji_variants.insert(0xD83D_DC4D, 0xD83D_DC4D_D83C_DFFB);
        user.hidden_pinned_messages.insert(777, 12);
        user
    }

    #[test]
    fn test_user_settings_round_trip() {
        let user = custom_user_settings();
        let encoded = user.encode();
        let (decoded, complete) = UserSettings::decode(encoded.stream.as_bytes(), APP_VERSION, false);
        assert!(complete);
        assert_eq!(decoded, user);
    }

    #[test]
    fn test_app_settings_round_trip_with_proxy() {
        let app = AppSettings {
            chat_size_max: 300,
            auto_start: true,
            work_mode: WorkMode::TrayOnly,
            scale: 3,
            lang: 2,
            lang_file: "custom.strings".into(),
            connection: ConnectionType::TcpProxy(ProxyData {
                host: "proxy.local".into(),
                port: 1080,
                user: "u".into(),
                password: "p".into(),
            }),
            try_ipv6: false,
            ..AppSettings::default()
        };
        let mut w = StreamWriter::new();
        app.write_records(&mut w);

        let mut state = SettingsState::default();
        assert!(read_records(&mut StreamReader::new(w.as_bytes()), &mut state));
        assert_eq!(state.app, app);
    }

    #[test]
    fn test_tile_background_version_gate() {
        let user = UserSettings { tile_background: true, ..UserSettings::default() };
        let bytes = user.encode().stream.into_bytes();

        let (old_no_bg, _) = UserSettings::decode(&bytes, 8004, false);
        assert!(!old_no_bg.tile_background);
        let (old_with_bg, _) = UserSettings::decode(&bytes, 8004, true);
        assert!(old_with_bg.tile_background);
        let (current, _) = UserSettings::decode(&bytes, TILE_BACKGROUND_MIN_VERSION, false);
        assert!(current.tile_background);
    }

    #[test]
    fn test_unknown_tag_stops_parsing() {
        let mut w = StreamWriter::new();
        write_i32(&mut w, dbi::AUTO_LOCK, 60);
        write_i32(&mut w, 0x10, 1);
        write_i32(&mut w, dbi::NOTIFICATIONS_COUNT, 7);

        let (user, complete) = UserSettings::decode(w.as_bytes(), APP_VERSION, false);
        assert!(!complete);
        assert_eq!(user.auto_lock, 60);
        assert_eq!(user.notifications_count, DEFAULT_NOTIFICATIONS_COUNT);
    }

    #[test]
    fn test_ui_and_network_records_are_skipped() {
        let mut w = StreamWriter::new();
        w.write_u32(dbi::DC_OPTION_OLD);
        w.write_u32(2);
        w.write_string("host");
        w.write_string("149.154.167.51");
        w.write_u32(443);
        w.write_u32(dbi::DC_OPTION);
        w.write_u32(2);
        w.write_i32(1);
        w.write_string("149.154.167.51");
        w.write_u32(443);
        w.write_u32(dbi::WINDOW_POSITION);
        for value in [10, 20, 800, 600, 7, 1] {
            w.write_i32(value);
        }
        w.write_u32(dbi::LOGGED_PHONE_NUMBER);
        w.write_string("+15550100");
        write_flag(&mut w, dbi::AUTO_START, true);

        let mut state = SettingsState::default();
        assert!(read_records(&mut StreamReader::new(w.as_bytes()), &mut state));
        assert_eq!(state.app, AppSettings { auto_start: true, ..AppSettings::default() });
    }

    #[test]
    fn test_truncated_record_stops_parsing() {
        let mut w = StreamWriter::new();
        write_i32(&mut w, dbi::AUTO_LOCK, 60);
        w.write_u32(dbi::AUTO_DOWNLOAD);
        w.write_i32(1);

        let (user, complete) = UserSettings::decode(w.as_bytes(), APP_VERSION, false);
        assert!(!complete);
        assert_eq!(user.auto_lock, 60);
    }

    #[test]
    fn test_value_normalization() {
        let mut w = StreamWriter::new();
        write_i32(&mut w, dbi::NOTIFICATIONS_COUNT, 0);
        write_i32(&mut w, dbi::NOTIFICATIONS_CORNER, 7);
        write_i32(&mut w, dbi::SONG_VOLUME, 2_000_000);
        write_i32(&mut w, dbi::VIDEO_VOLUME, -5);
        write_i32(&mut w, dbi::NOTIFY_VIEW, 9);
        w.write_u32(dbi::DOWNLOAD_PATH_OLD);
        w.write_string("/data/dl");
        w.write_u32(dbi::DIALOGS_MODE);
        w.write_i32(0);
        w.write_i32(1);

        let (user, complete) = UserSettings::decode(w.as_bytes(), APP_VERSION, false);
        assert!(complete);
        assert_eq!(user.notifications_count, 3);
        assert_eq!(user.notifications_corner, 2);
        assert_eq!(user.song_volume, 1.0);
        assert_eq!(user.video_volume, 0.0);
        assert_eq!(user.notify_view, NotifyView::ShowPreview);
        assert_eq!(user.download_path, "/data/dl/");
        assert_eq!(user.dialogs_mode, DialogsMode::All);
    }

    #[test]
    fn test_download_path_normalization() {
        assert_eq!(normalize_download_path(String::new()), "");
        assert_eq!(normalize_download_path("tmp".into()), "tmp");
        assert_eq!(normalize_download_path("a/".into()), "a/");
        assert_eq!(normalize_download_path("a".into()), "a/");
    }

    #[test]
    fn test_app_values_out_of_range_ignored() {
        let mut w = StreamWriter::new();
        write_i32(&mut w, dbi::SCALE, 9);
        write_i32(&mut w, dbi::WORK_MODE, 9);
        write_i32(&mut w, dbi::CONNECTION_TYPE, 1);
        write_i32(&mut w, dbi::LANG, -4);

        let mut state = SettingsState::default();
        assert!(read_records(&mut StreamReader::new(w.as_bytes()), &mut state));
        assert_eq!(state.app.scale, 0);
        assert_eq!(state.app.work_mode, WorkMode::WindowAndTray);
        assert_eq!(state.app.connection, ConnectionType::Auto);
        assert_eq!(state.app.lang, 0);
    }

    #[test]
    fn test_old_recent_emojis_upgraded() {
        let mut w = StreamWriter::new();
        w.write_u32(dbi::RECENT_EMOJIS_OLD);
        w.write_u32(2);
        w.write_u32(0xD83C_DDEF);
        w.write_u16(4);
        w.write_u32(0x263A);
        w.write_u16(1);

        let (user, complete) = UserSettings::decode(w.as_bytes(), APP_VERSION, false);
        assert!(complete);
        assert_eq!(user.recent_emojis, vec![(0xD83C_DDEF_D83C_DDF5, 4), (0x263A, 1)]);
    }

    #[test]
    fn test_settings_file_round_trip() {
        let fs = InMemoryFs::new();
        let containers = containers(&fs);
        let kdf = KdfValues::TEST;
        let file = SettingsFile::generate(&kdf);
        let app = AppSettings { auto_update: false, last_update_check: 1234, ..AppSettings::default() };
        file.write(&containers, SETTINGS_FILE, &app).unwrap();
        assert!(fs.exists(Path::new("tdata/settings0")));

        match SettingsFile::read(&containers, SETTINGS_FILE, &kdf) {
            SettingsRead::Loaded { file: loaded, state, complete } => {
                assert!(complete);
                assert_eq!(loaded.salt(), file.salt());
                assert_eq!(state.app, app);
                assert_eq!(state.version, APP_VERSION);
            }
            _ => panic!("settings file not loaded"),
        }
    }

    #[test]
    fn test_settings_file_absent_and_invalid() {
        let fs = InMemoryFs::new();
        let containers = containers(&fs);
        let kdf = KdfValues::TEST;
        assert!(matches!(SettingsFile::read(&containers, SETTINGS_FILE, &kdf), SettingsRead::Absent));

        containers.write(SETTINGS_FILE, FileOptions::BASE, &[b"short".as_slice(), b"x".as_slice()]).unwrap();
        assert!(matches!(SettingsFile::read(&containers, SETTINGS_FILE, &kdf), SettingsRead::Invalid));

        let salt = [7u8; SALT_SIZE];
        containers.write(SETTINGS_FILE, FileOptions::BASE, &[salt.as_slice(), [0u8; 48].as_slice()]).unwrap();
        assert!(matches!(SettingsFile::read(&containers, SETTINGS_FILE, &kdf), SettingsRead::Invalid));
    }

    #[test]
    fn test_settings_file_name_by_mode() {
        assert_eq!(settings_file_name(false), "settings");
        assert_eq!(settings_file_name(true), "settings_test");
    }

    fn legacy_config(version: i32) -> Vec<u8> {
        let mut w = StreamWriter::new();
        write_i32(&mut w, dbi::VERSION, version);
        write_i32(&mut w, dbi::CHAT_SIZE_MAX, 150);
        write_flag(&mut w, dbi::AUTO_START, true);
        w.write_u32(dbi::KEY);
        w.write_i32(2);
        w.write_raw(&[0u8; 256]);
        write_flag(&mut w, dbi::SOUND_NOTIFY, false);
        w.into_bytes()
    }

    #[test]
    fn test_legacy_config_migration() {
        let fs = InMemoryFs::new();
        let base = Path::new("tdata");
        fs.put_file(&base.join(LEGACY_CONFIG_FILE), legacy_config(8000));

        let state = read_legacy_config(&fs, base, APP_VERSION).unwrap();
        assert_eq!(state.version, 8000);
        assert_eq!(state.app.chat_size_max, 150);
        assert!(state.app.auto_start);
        assert!(!state.user.sound_notify);

        retire_legacy_config(&fs, base, true);
        assert!(!fs.exists(&base.join(LEGACY_CONFIG_FILE)));
        assert!(fs.exists(&base.join(LEGACY_CONFIG_BACKUP)));
        assert!(read_legacy_config(&fs, base, APP_VERSION).is_none());
    }

    #[test]
    fn test_legacy_config_removed_without_backup() {
        let fs = InMemoryFs::new();
        let base = Path::new("tdata");
        fs.put_file(&base.join(LEGACY_CONFIG_FILE), legacy_config(8000));
        retire_legacy_config(&fs, base, false);
        assert_eq!(fs.file_count(), 0);
    }

    #[test]
    fn test_legacy_config_from_newer_build_ignored() {
        let fs = InMemoryFs::new();
        let base = Path::new("tdata");
        fs.put_file(&base.join(LEGACY_CONFIG_FILE), legacy_config(APP_VERSION + 1));

        assert!(read_legacy_config(&fs, base, APP_VERSION).is_none());
        assert!(read_legacy_config(&fs, base, APP_VERSION + 1).is_some());
    }
}
