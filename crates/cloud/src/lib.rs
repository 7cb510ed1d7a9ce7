use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use save_cloud_sync_core::{SaveListing, Storage, StorageMode};

pub mod archive;
pub mod auth;
pub mod backup;
pub mod dropbox;
pub mod error;
pub mod fanout;
pub mod gdrive;
pub mod retry;
pub mod sync_service;

pub use backup::BackupInfo;
pub use dropbox::{DropboxClient, DropboxEndpoints};
pub use error::CloudError;
pub use gdrive::{DriveEndpoints, GoogleDriveClient};
pub use retry::RetryPolicy;
pub use sync_service::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudProvider {
    Dropbox,
    GoogleDrive,
}

impl CloudProvider {
    pub fn display_name(&self) -> &'static str {
        match self {
            CloudProvider::Dropbox => "Dropbox",
            CloudProvider::GoogleDrive => "Google Drive",
        }
    }
}

/// OAuth client registration plus the refresh token obtained at sign-in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub refresh_token: String,
}

impl Credentials {
    /// Whether these are enough to obtain access tokens.
    pub fn is_complete(&self) -> bool {
        !self.client_id.is_empty() && !self.refresh_token.is_empty()
    }
}

/// Operations every cloud provider supports. Save names are folder names such
/// as `Farm_123456789`; backups are addressed by their cloud folder name.
#[async_trait]
pub trait CloudClient: Send + Sync {
    fn provider(&self) -> CloudProvider;

    fn is_signed_in(&self) -> bool;

    /// Summaries of every save in the cloud. Summaries that cannot be read
    /// are skipped and reported through `load_failed`.
    async fn get_saves(&self) -> Result<SaveListing, CloudError>;

    /// Removes a save and its summary. Removing an absent save succeeds.
    async fn delete_save(&self, save_name: &str) -> Result<(), CloudError>;

    /// Uploads `saves_path/save_name`. On failure whatever was uploaded is
    /// removed again before the error is returned.
    async fn upload_save(&self, mode: StorageMode, saves_path: &str, save_name: &str) -> Result<(), CloudError>;

    /// Writes the contents of a cloud save into `destination`.
    async fn download_save(&self, mode: StorageMode, save_name: &str, destination: &str) -> Result<(), CloudError>;

    /// Backups, newest first.
    async fn get_backups(&self) -> Result<Vec<BackupInfo>, CloudError>;

    async fn delete_backup(&self, cloud_folder_name: &str) -> Result<(), CloudError>;

    /// Copies the cloud save into a new timestamped backup. A save that is not
    /// in the cloud is not an error.
    async fn backup_save(&self, save_name: &str) -> Result<(), CloudError>;

    async fn download_backup(
        &self,
        mode: StorageMode,
        cloud_folder_name: &str,
        destination: &str,
    ) -> Result<(), CloudError>;

    /// Deletes all but the newest `backups_to_keep` backups of each save.
    /// Individual delete failures are logged, not returned.
    async fn purge_backups(&self, backups_to_keep: usize) -> Result<(), CloudError>;
}

pub fn client(
    provider: CloudProvider,
    credentials: &Credentials,
    storage: Arc<Storage>,
) -> Result<Box<dyn CloudClient>, CloudError> {
    Ok(match provider {
        CloudProvider::Dropbox => Box::new(DropboxClient::new(credentials, storage)?),
        CloudProvider::GoogleDrive => Box::new(GoogleDriveClient::new(credentials, storage)?),
    })
}
