use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use save_cloud_sync_cloud::{CloudProvider, Credentials, SyncOptions};
use save_cloud_sync_core::{Platform, StorageMode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub provider: CloudProvider,
    pub dropbox: Credentials,
    pub google_drive: Credentials,

    // Device
    pub primary_storage: String,
    pub sdk_version: u32,
    /// `None` picks the best mode the device allows.
    pub storage_mode: Option<StorageMode>,
    /// `None` uses the game's default location.
    pub saves_path: Option<String>,

    // Backups
    pub backup_saves: bool,
    pub purge_backups: bool,
    pub backups_to_keep: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        let options = SyncOptions::default();
        Self {
            provider: CloudProvider::Dropbox,
            dropbox: Credentials::default(),
            google_drive: Credentials::default(),
            primary_storage: "/storage/emulated/0".to_string(),
            sdk_version: 33,
            storage_mode: None,
            saves_path: None,
            backup_saves: options.backup_saves,
            purge_backups: options.purge_backups,
            backups_to_keep: options.backups_to_keep,
        }
    }
}

impl AppSettings {
    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?
            .join("save-cloud-sync");

        std::fs::create_dir_all(&config_dir)?;
        Ok(config_dir.join("settings.json"))
    }

    pub fn load() -> Result<AppSettings> {
        Self::load_from(&Self::get_config_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<AppSettings> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(AppSettings::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn platform(&self) -> Platform {
        Platform::new(self.primary_storage.clone(), self.sdk_version)
    }

    /// The configured mode, or the best one the device allows that this
    /// binary can serve. Document trees need a platform document provider,
    /// so `saf` is rejected up front instead of failing on first access.
    pub fn storage_mode(&self) -> Result<StorageMode> {
        let platform = self.platform();
        match self.storage_mode {
            Some(StorageMode::Saf) => Err(anyhow::anyhow!(
                "Storage mode Saf needs a document provider, which is not available here. Use legacy or shizuku."
            )),
            Some(mode) if !platform.is_storage_mode_allowed(mode) => Err(anyhow::anyhow!(
                "Storage mode {mode:?} is not available on SDK {}",
                self.sdk_version
            )),
            Some(mode) => Ok(mode),
            None => Ok(platform
                .allowed_storage_modes()
                .into_iter()
                .find(|mode| *mode != StorageMode::Saf)
                .unwrap_or(StorageMode::Shizuku)),
        }
    }

    pub fn saves_path(&self) -> String {
        self.saves_path
            .clone()
            .unwrap_or_else(|| self.platform().default_saves_path())
    }

    pub fn credentials(&self) -> &Credentials {
        match self.provider {
            CloudProvider::Dropbox => &self.dropbox,
            CloudProvider::GoogleDrive => &self.google_drive,
        }
    }

    pub fn credentials_mut(&mut self) -> &mut Credentials {
        match self.provider {
            CloudProvider::Dropbox => &mut self.dropbox,
            CloudProvider::GoogleDrive => &mut self.google_drive,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            backup_saves: self.backup_saves,
            purge_backups: self.purge_backups,
            backups_to_keep: self.backups_to_keep,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = AppSettings::load_from(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, AppSettings::default());
        assert!(settings.backup_saves);
        assert!(settings.purge_backups);
        assert_eq!(settings.backups_to_keep, 2);
        assert_eq!(settings.provider, CloudProvider::Dropbox);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = AppSettings {
            provider: CloudProvider::GoogleDrive,
            backups_to_keep: 5,
            ..AppSettings::default()
        };
        settings.credentials_mut().refresh_token = "refresh".into();
        settings.save_to(&path).unwrap();

        let loaded = AppSettings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.google_drive.refresh_token, "refresh");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"provider":"google_drive","purge_backups":false}"#).unwrap();

        let settings = AppSettings::load_from(&path).unwrap();
        assert_eq!(settings.provider, CloudProvider::GoogleDrive);
        assert!(!settings.purge_backups);
        assert_eq!(settings.backups_to_keep, 2);
    }

    #[test]
    fn test_storage_mode_follows_platform() {
        let old_device = AppSettings { sdk_version: 29, ..AppSettings::default() };
        assert_eq!(old_device.storage_mode().unwrap(), StorageMode::Legacy);

        let settings = AppSettings { sdk_version: 30, ..AppSettings::default() };
        assert_eq!(settings.storage_mode().unwrap(), StorageMode::Shizuku);

        let saf = AppSettings {
            sdk_version: 30,
            storage_mode: Some(StorageMode::Saf),
            ..AppSettings::default()
        };
        let err = saf.storage_mode().unwrap_err();
        assert!(err.to_string().contains("document provider"));

        let legacy = AppSettings {
            sdk_version: 30,
            storage_mode: Some(StorageMode::Legacy),
            ..AppSettings::default()
        };
        assert!(legacy.storage_mode().is_err());
    }

    #[test]
    fn test_default_saves_path() {
        let settings = AppSettings::default();
        assert_eq!(
            settings.saves_path(),
            "/storage/emulated/0/Android/data/com.chucklefish.stardewvalley/files/Saves"
        );
    }
}
