use async_trait::async_trait;

use crate::{paths, StorageError, StorageMode};

/// Package whose application-data directory holds the saves.
pub const GAME_PACKAGE: &str = "com.chucklefish.stardewvalley";

/// Highest SDK level on which the application-data directory is reachable
/// with plain filesystem access.
pub const LEGACY_MAX_SDK: u32 = 29;

/// Highest SDK level on which a document-tree grant can cover the
/// application-data directory.
pub const SAF_MAX_SDK: u32 = 32;

/// Facts about the device the engine runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub primary_storage: String,
    pub sdk_version: u32,
}

impl Platform {
    pub fn new(primary_storage: impl Into<String>, sdk_version: u32) -> Self {
        Self {
            primary_storage: paths::normalize(&primary_storage.into()),
            sdk_version,
        }
    }

    /// `{primary}/Android/data`, the directory that needs a special backend.
    pub fn protected_dir(&self) -> String {
        paths::combine(&self.primary_storage, &["Android", "data"])
    }

    pub fn default_saves_path(&self) -> String {
        paths::combine(
            &self.primary_storage,
            &["Android", "data", GAME_PACKAGE, "files", "Saves"],
        )
    }

    pub fn is_protected(&self, path: &str) -> bool {
        paths::is_under(&self.protected_dir(), path)
    }

    /// Storage modes usable on this SDK level, most preferred first.
    pub fn allowed_storage_modes(&self) -> Vec<StorageMode> {
        let mut modes = Vec::with_capacity(3);
        if self.sdk_version <= LEGACY_MAX_SDK {
            modes.push(StorageMode::Legacy);
        }
        if self.sdk_version <= SAF_MAX_SDK {
            modes.push(StorageMode::Saf);
        }
        modes.push(StorageMode::Shizuku);
        modes
    }

    pub fn is_storage_mode_allowed(&self, mode: StorageMode) -> bool {
        self.allowed_storage_modes().contains(&mode)
    }

    pub fn best_storage_mode(&self) -> StorageMode {
        self.allowed_storage_modes()
            .first()
            .copied()
            .unwrap_or(StorageMode::Shizuku)
    }
}

/// Platform hook that knows whether a backend's access grant is in place and
/// how to ask the user for it.
#[async_trait]
pub trait PermissionBroker: Send + Sync {
    async fn is_granted(&self) -> bool;

    /// Prompts for the grant. Returns the resulting grant state.
    async fn request(&self) -> Result<bool, StorageError>;
}

/// Broker for environments where no grant is needed, such as desktop
/// filesystems and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysGranted;

#[async_trait]
impl PermissionBroker for AlwaysGranted {
    async fn is_granted(&self) -> bool {
        true
    }

    async fn request(&self) -> Result<bool, StorageError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_storage_modes_by_sdk() {
        let old = Platform::new("/storage/emulated/0", 29);
        assert_eq!(
            old.allowed_storage_modes(),
            vec![StorageMode::Legacy, StorageMode::Saf, StorageMode::Shizuku]
        );

        let mid = Platform::new("/storage/emulated/0", 31);
        assert_eq!(mid.allowed_storage_modes(), vec![StorageMode::Saf, StorageMode::Shizuku]);
        assert_eq!(mid.best_storage_mode(), StorageMode::Saf);

        let new = Platform::new("/storage/emulated/0", 34);
        assert_eq!(new.allowed_storage_modes(), vec![StorageMode::Shizuku]);
        assert!(!new.is_storage_mode_allowed(StorageMode::Legacy));
    }

    #[test]
    fn test_platform_paths() {
        let platform = Platform::new("/storage/emulated/0/", 33);
        assert_eq!(platform.protected_dir(), "/storage/emulated/0/Android/data");
        assert_eq!(
            platform.default_saves_path(),
            "/storage/emulated/0/Android/data/com.chucklefish.stardewvalley/files/Saves"
        );
        assert!(platform.is_protected("/storage/emulated/0/android/data/some.pkg"));
        assert!(!platform.is_protected("/storage/emulated/0/Download/Saves"));
    }
}
