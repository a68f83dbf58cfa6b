//! Storage configuration
//!
//! Holds KDF iteration counts, flush timings and the running app version.
//! KDF and timing values are only overridable in test builds.

use std::time::Duration;

/// Version stamped into every container written by this build.
pub const APP_VERSION: i32 = 10_019;

/// PBKDF2 iteration counts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfValues {
    /// Iterations used when a passcode is set
    pub passcode_iterations: u32,
    /// Iterations used for the empty passcode
    pub no_passcode_iterations: u32,
}

impl KdfValues {
    /// Production values (compatible with existing profiles)
    pub const PROD: Self = Self {
        passcode_iterations: 4000,
        no_passcode_iterations: 4,
    };

    /// Test values for fast tests
    pub const TEST: Self = Self {
        passcode_iterations: 16,
        no_passcode_iterations: 1,
    };

    /// Iteration count for the given passcode
    #[must_use]
    pub fn iterations_for(&self, passcode: &[u8]) -> u32 {
        if passcode.is_empty() {
            self.no_passcode_iterations
        } else {
            self.passcode_iterations
        }
    }
}

impl Default for KdfValues {
    fn default() -> Self {
        #[cfg(any(test, feature = "test-constants"))]
        { Self::TEST }
        #[cfg(not(any(test, feature = "test-constants")))]
        { Self::PROD }
    }
}

/// Flush and shutdown timings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimingValues {
    /// Delay of a "fast" catalog flush
    pub map_write_fast: Duration,
    /// Debounce window of a regular catalog flush
    pub map_write_debounce: Duration,
    /// How long `finish()` waits for in-flight load tasks
    pub loader_shutdown: Duration,
}

impl TimingValues {
    /// Production values
    pub const PROD: Self = Self {
        map_write_fast: Duration::from_millis(1),
        map_write_debounce: Duration::from_millis(1000),
        loader_shutdown: Duration::from_millis(500),
    };

    /// Test values
    pub const TEST: Self = Self {
        map_write_fast: Duration::from_millis(1),
        map_write_debounce: Duration::from_millis(50),
        loader_shutdown: Duration::from_millis(200),
    };
}

impl Default for TimingValues {
    fn default() -> Self {
        #[cfg(any(test, feature = "test-constants"))]
        { Self::TEST }
        #[cfg(not(any(test, feature = "test-constants")))]
        { Self::PROD }
    }
}

/// Storage configuration
#[derive(Clone, Copy, Debug)]
pub struct StorageConfig {
    app_version: i32,
    test_mode: bool,
    keep_legacy_backup: bool,
    #[cfg(any(test, feature = "test-constants"))]
    kdf_values: KdfValues,
    #[cfg(any(test, feature = "test-constants"))]
    timing_values: TimingValues,
}

impl StorageConfig {
    /// Create config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config with custom KDF and timing values (test builds only)
    #[cfg(any(test, feature = "test-constants"))]
    pub fn with_values(kdf: KdfValues, timing: TimingValues) -> Self {
        Self {
            kdf_values: kdf,
            timing_values: timing,
            ..Self::default()
        }
    }

    /// Override the app version stamped into containers
    #[must_use]
    pub fn with_app_version(mut self, version: i32) -> Self {
        self.app_version = version;
        self
    }

    /// Select the `settings_test` file instead of `settings`
    #[must_use]
    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    /// Keep `config.bak` after migrating the legacy flat config
    #[must_use]
    pub fn with_legacy_backup(mut self, keep: bool) -> Self {
        self.keep_legacy_backup = keep;
        self
    }

    #[must_use]
    pub fn app_version(&self) -> i32 {
        self.app_version
    }

    #[must_use]
    pub fn test_mode(&self) -> bool {
        self.test_mode
    }

    #[must_use]
    pub fn keep_legacy_backup(&self) -> bool {
        self.keep_legacy_backup
    }

    /// Get KDF values
    /// In production, always returns PROD values regardless of what was set
    pub fn kdf(&self) -> &KdfValues {
        #[cfg(any(test, feature = "test-constants"))]
        { &self.kdf_values }
        #[cfg(not(any(test, feature = "test-constants")))]
        { &KdfValues::PROD }
    }

    /// Get timing values
    /// In production, always returns PROD values regardless of what was set
    pub fn timing(&self) -> &TimingValues {
        #[cfg(any(test, feature = "test-constants"))]
        { &self.timing_values }
        #[cfg(not(any(test, feature = "test-constants")))]
        { &TimingValues::PROD }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            app_version: APP_VERSION,
            test_mode: false,
            keep_legacy_backup: true,
            #[cfg(any(test, feature = "test-constants"))]
            kdf_values: KdfValues::default(),
            #[cfg(any(test, feature = "test-constants"))]
            timing_values: TimingValues::default(),
        }
    }
}
