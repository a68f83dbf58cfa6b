//! Key tiers and passcode handling.
//!
//! - **LocalKey**: 256 random bytes encrypting every profile file
//! - **PassKey**: PBKDF2(passcode, salt), only wraps the LocalKey
//! - **SettingsKey**: PBKDF2(empty passcode, settings salt), protects the
//!   app-wide settings file
//!
//! # Security Properties
//!
//! - Changing the passcode re-derives the PassKey and re-wraps the LocalKey;
//!   bulk files are never re-encrypted
//! - The LocalKey is stable for the lifetime of a profile (until reset)
//! - All key material is zeroized on drop

use crossbeam::channel::{self, Receiver};
use tracing::debug;

use crate::config::KdfValues;
use crate::crypto::{
    constant_time_eq, decrypt_local, encrypt_local, generate_salt, LocalKey, LOCAL_KEY_SIZE, SALT_SIZE,
};

/// Key wrapping the LocalKey
pub type PassKey = LocalKey;

/// Error types for key operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Wrong passcode")]
    BadPasscode,
    #[error("Corrupt key data: {0}")]
    Corrupt(&'static str),
    #[error("Background key derivation did not finish")]
    Interrupted,
}

/// PBKDF2-HMAC-SHA1 with the iteration count matching the passcode
#[must_use]
pub fn derive_key(passcode: &[u8], salt: &[u8], kdf: &KdfValues) -> LocalKey {
    LocalKey::derive(passcode, salt, kdf.iterations_for(passcode))
}

/// Derive on a dedicated thread; the receiver yields exactly one key
pub fn derive_in_background(passcode: Vec<u8>, salt: Vec<u8>, kdf: KdfValues) -> Receiver<LocalKey> {
    let (tx, rx) = channel::bounded(1);
    std::thread::spawn(move || {
        let key = derive_key(&passcode, &salt, &kdf);
        // Receiver may have been dropped
        let _ = tx.send(key);
    });
    rx
}

/// Unlocked key state of a profile
pub struct KeyManager {
    pass_salt: [u8; SALT_SIZE],
    pass_key: PassKey,
    local_key: LocalKey,
    wrapped_local_key: Vec<u8>,
    has_passcode: bool,
    kdf: KdfValues,
}

impl KeyManager {
    /// Fresh salt, fresh LocalKey, empty passcode
    #[must_use]
    pub fn bootstrap(kdf: KdfValues) -> Self {
        let pass_salt = generate_salt();
        let pass_key = derive_key(b"", &pass_salt, &kdf);
        let local_key = LocalKey::generate();
        let wrapped_local_key = encrypt_local(local_key.as_bytes(), &pass_key);
        debug!("bootstrapped new local key");
        Self {
            pass_salt,
            pass_key,
            local_key,
            wrapped_local_key,
            has_passcode: false,
            kdf,
        }
    }

    /// Unwrap the LocalKey stored in the catalog header
    pub fn unlock(passcode: &[u8], salt: &[u8], wrapped: &[u8], kdf: KdfValues) -> Result<Self, KeyError> {
        if salt.len() != SALT_SIZE {
            return Err(KeyError::Corrupt("bad salt length"));
        }
        let pass_key = derive_key(passcode, salt, &kdf);
        Self::unlock_with_key(pass_key, !passcode.is_empty(), salt, wrapped, kdf)
    }

    /// Unwrap with an already derived PassKey
    pub fn unlock_with_key(
        pass_key: PassKey,
        has_passcode: bool,
        salt: &[u8],
        wrapped: &[u8],
        kdf: KdfValues,
    ) -> Result<Self, KeyError> {
        let mut pass_salt = [0u8; SALT_SIZE];
        if salt.len() != SALT_SIZE {
            return Err(KeyError::Corrupt("bad salt length"));
        }
        pass_salt.copy_from_slice(salt);

        let raw = decrypt_local(wrapped, &pass_key).map_err(|_| KeyError::BadPasscode)?;
        if raw.len() != LOCAL_KEY_SIZE {
            return Err(KeyError::Corrupt("bad local key length"));
        }
        let local_key = LocalKey::from_slice(&raw).ok_or(KeyError::Corrupt("bad local key length"))?;

        Ok(Self {
            pass_salt,
            pass_key,
            local_key,
            wrapped_local_key: wrapped.to_vec(),
            has_passcode,
            kdf,
        })
    }

    /// `unlock` on a dedicated thread
    pub fn unlock_in_background(
        passcode: Vec<u8>,
        salt: Vec<u8>,
        wrapped: Vec<u8>,
        kdf: KdfValues,
    ) -> Receiver<Result<Self, KeyError>> {
        let (tx, rx) = channel::bounded(1);
        std::thread::spawn(move || {
            let _ = tx.send(Self::unlock(&passcode, &salt, &wrapped, kdf));
        });
        rx
    }

    /// New salt and PassKey; the LocalKey is re-wrapped, not replaced
    pub fn change_passcode(&mut self, passcode: &[u8]) {
        let salt = generate_salt();
        let pass_key = derive_key(passcode, &salt, &self.kdf);
        self.rewrap(salt, pass_key, !passcode.is_empty());
    }

    /// Start a passcode change whose PassKey is derived on a dedicated thread
    #[must_use]
    pub fn begin_passcode_change(&self, passcode: &[u8]) -> PasscodeChange {
        let salt = generate_salt();
        PasscodeChange {
            salt,
            has_passcode: !passcode.is_empty(),
            derived: derive_in_background(passcode.to_vec(), salt.to_vec(), self.kdf),
        }
    }

    /// Re-wrap the LocalKey with the PassKey of a finished change
    pub fn complete_passcode_change(&mut self, change: PasscodeChange) -> Result<(), KeyError> {
        let pass_key = change.derived.recv().map_err(|_| KeyError::Interrupted)?;
        self.rewrap(change.salt, pass_key, change.has_passcode);
        Ok(())
    }

    fn rewrap(&mut self, salt: [u8; SALT_SIZE], pass_key: PassKey, has_passcode: bool) {
        self.pass_salt = salt;
        self.wrapped_local_key = encrypt_local(self.local_key.as_bytes(), &pass_key);
        self.pass_key = pass_key;
        self.has_passcode = has_passcode;
        debug!(has_passcode, "passcode changed");
    }

    /// Whether `passcode` derives the current PassKey
    #[must_use]
    pub fn check_passcode(&self, passcode: &[u8]) -> bool {
        let candidate = derive_key(passcode, &self.pass_salt, &self.kdf);
        constant_time_eq(candidate.as_bytes(), self.pass_key.as_bytes())
    }

    #[must_use]
    pub fn has_passcode(&self) -> bool {
        self.has_passcode
    }

    #[must_use]
    pub fn pass_salt(&self) -> &[u8; SALT_SIZE] {
        &self.pass_salt
    }

    #[must_use]
    pub fn wrapped_local_key(&self) -> &[u8] {
        &self.wrapped_local_key
    }

    #[must_use]
    pub fn local_key(&self) -> &LocalKey {
        &self.local_key
    }

    #[must_use]
    pub fn kdf(&self) -> &KdfValues {
        &self.kdf
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("has_passcode", &self.has_passcode)
            .finish_non_exhaustive()
    }
}

/// A passcode change waiting for its PassKey
pub struct PasscodeChange {
    salt: [u8; SALT_SIZE],
    has_passcode: bool,
    derived: Receiver<PassKey>,
}

impl PasscodeChange {
    /// Whether the derivation finished, so completing will not block
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.derived.is_empty()
    }
}

impl std::fmt::Debug for PasscodeChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasscodeChange")
            .field("has_passcode", &self.has_passcode)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

/// Block on a background unlock
pub fn wait_unlock(rx: &Receiver<Result<KeyManager, KeyError>>) -> Result<KeyManager, KeyError> {
    rx.recv().map_err(|_| KeyError::Interrupted)?
}

// ============================================================
// TESTS
// ============================================================
