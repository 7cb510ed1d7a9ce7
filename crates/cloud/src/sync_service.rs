use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use save_cloud_sync_core::saves::TEMP_DIRECTORY;
use save_cloud_sync_core::{
    find_conflict, get_local_saves, paths, read_save_info, Conflict, SaveListing, Storage, StorageError,
    StorageMode,
};

use crate::{BackupInfo, CloudClient, CloudError};

/// Backup behaviour applied around uploads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub backup_saves: bool,
    pub purge_backups: bool,
    pub backups_to_keep: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            backup_saves: true,
            purge_backups: true,
            backups_to_keep: 2,
        }
    }
}

/// Progress update message
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub operation_id: Uuid,
    /// Save name or backup folder name the operation works on.
    pub target: String,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Upload,
    Download,
    Delete,
    Backup,
    Purge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Starting,
    InProgress,
    Completed,
    Failed,
}

/// Identifiers with a transfer in flight. At most one operation runs per
/// identifier at a time.
#[derive(Debug, Clone, Default)]
pub struct TransferState {
    active: Arc<Mutex<HashSet<(OperationType, String)>>>,
}

impl TransferState {
    /// Marks `id` busy for the lifetime of the returned guard, or returns
    /// `None` when another operation already holds it.
    pub fn try_begin(&self, operation_type: OperationType, id: &str) -> Option<TransferGuard> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.iter().any(|(_, busy)| busy == id) {
            return None;
        }
        let key = (operation_type, id.to_string());
        active.insert(key.clone());
        Some(TransferGuard {
            state: self.clone(),
            key,
        })
    }

    pub fn is_transferring(&self, operation_type: OperationType, id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(operation_type, id.to_string()))
    }

    pub fn in_flight(&self) -> Vec<(OperationType, String)> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Releases its identifier when dropped.
#[derive(Debug)]
pub struct TransferGuard {
    state: TransferState,
    key: (OperationType, String),
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.state
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Runs the user-facing sync workflows for one saves directory on top of a
/// [`CloudClient`].
pub struct SyncService {
    client: Arc<dyn CloudClient>,
    storage: Arc<Storage>,
    mode: StorageMode,
    saves_path: String,
    options: SyncOptions,
    transfers: TransferState,
    progress_tx: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

impl SyncService {
    pub fn new(
        client: Arc<dyn CloudClient>,
        storage: Arc<Storage>,
        mode: StorageMode,
        saves_path: impl Into<String>,
    ) -> Self {
        Self {
            client,
            storage,
            mode,
            saves_path: paths::normalize(&saves_path.into()),
            options: SyncOptions::default(),
            transfers: TransferState::default(),
            progress_tx: None,
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_progress_channel(mut self, tx: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    pub fn transfers(&self) -> &TransferState {
        &self.transfers
    }

    pub fn saves_path(&self) -> &str {
        &self.saves_path
    }

    /// Asks for storage permission on the saves directory when it has not been
    /// granted yet.
    pub async fn ensure_permission(&self) -> Result<(), CloudError> {
        if self.storage.is_permission_granted(&self.saves_path, self.mode).await? {
            return Ok(());
        }
        if self.storage.request_permission(&self.saves_path, self.mode).await? {
            Ok(())
        } else {
            Err(StorageError::PermissionDenied.into())
        }
    }

    pub async fn local_saves(&self) -> Result<SaveListing, CloudError> {
        Ok(get_local_saves(&self.storage, self.mode, &self.saves_path).await?)
    }

    pub async fn cloud_saves(&self) -> Result<SaveListing, CloudError> {
        self.client.get_saves().await
    }

    pub async fn backups(&self) -> Result<Vec<BackupInfo>, CloudError> {
        self.client.get_backups().await
    }

    /// Conflict raised when uploading the local `save_name` would replace a
    /// cloud copy that has been played longer.
    pub async fn upload_conflict(&self, save_name: &str) -> Result<Option<Conflict>, CloudError> {
        let local = read_save_info(&self.storage, self.mode, &self.saves_path, save_name).await?;
        let cloud = self.client.get_saves().await?;
        Ok(find_conflict(&local, &cloud.saves))
    }

    /// Conflict raised when restoring the cloud `save_name` would replace a
    /// local copy that has been played longer.
    pub async fn download_conflict(&self, save_name: &str) -> Result<Option<Conflict>, CloudError> {
        let cloud = self.client.get_saves().await?;
        let Some(incoming) = cloud.saves.iter().find(|save| save.folder_name == save_name) else {
            return Err(CloudError::SaveDoesntExist(save_name.to_string()));
        };
        let local = self.local_saves().await?;
        Ok(find_conflict(incoming, &local.saves))
    }

    /// Backs up the current cloud copy when enabled, trims the backups it
    /// pushed over the limit, then replaces the cloud copy with the local
    /// save. A failed purge does not stop the upload.
    pub async fn upload_save(&self, save_name: &str) -> Result<(), CloudError> {
        let _guard = self.begin(OperationType::Upload, save_name)?;
        self.track(OperationType::Upload, save_name, |operation_id| async move {
            if self.options.backup_saves {
                self.client.backup_save(save_name).await?;
                self.report(operation_id, OperationType::Upload, save_name, OperationStatus::InProgress, None);

                if self.options.purge_backups {
                    if let Err(e) = self.client.purge_backups(self.options.backups_to_keep).await {
                        warn!("Failed to purge old backups of {save_name}: {e}");
                    }
                }
            }
            self.client.delete_save(save_name).await?;
            self.client
                .upload_save(self.mode, &self.saves_path, save_name)
                .await
        })
        .await
    }

    /// Replaces the local save with the cloud copy.
    pub async fn restore_save(&self, save_name: &str) -> Result<(), CloudError> {
        let _guard = self.begin(OperationType::Download, save_name)?;
        let mode = self.mode;
        self.track(OperationType::Download, save_name, |operation_id| {
            self.staged_restore(operation_id, save_name, move |staging: String| async move {
                self.client.download_save(mode, save_name, &staging).await
            })
        })
        .await
    }

    /// Replaces the local save with the contents of a backup.
    pub async fn restore_backup(&self, backup: &BackupInfo) -> Result<(), CloudError> {
        let _guard = self.begin(OperationType::Download, &backup.folder_name)?;
        let mode = self.mode;
        let cloud_folder_name = backup.cloud_folder_name.as_str();
        self.track(OperationType::Download, &backup.folder_name, |operation_id| {
            self.staged_restore(operation_id, &backup.folder_name, move |staging: String| async move {
                self.client
                    .download_backup(mode, cloud_folder_name, &staging)
                    .await
            })
        })
        .await
    }

    pub async fn backup_save(&self, save_name: &str) -> Result<(), CloudError> {
        let _guard = self.begin(OperationType::Backup, save_name)?;
        self.track(OperationType::Backup, save_name, |_| self.client.backup_save(save_name))
            .await
    }

    pub async fn delete_cloud_save(&self, save_name: &str) -> Result<(), CloudError> {
        let _guard = self.begin(OperationType::Delete, save_name)?;
        self.track(OperationType::Delete, save_name, |_| self.client.delete_save(save_name))
            .await
    }

    pub async fn delete_backup(&self, cloud_folder_name: &str) -> Result<(), CloudError> {
        let _guard = self.begin(OperationType::Delete, cloud_folder_name)?;
        self.track(OperationType::Delete, cloud_folder_name, |_| {
            self.client.delete_backup(cloud_folder_name)
        })
        .await
    }

    /// Trims old backups when purging is enabled.
    pub async fn purge_backups(&self) -> Result<(), CloudError> {
        if !self.options.purge_backups {
            return Ok(());
        }
        let keep = self.options.backups_to_keep;
        self.track(OperationType::Purge, "backups", |_| self.client.purge_backups(keep))
            .await
    }

    fn begin(&self, operation_type: OperationType, id: &str) -> Result<TransferGuard, CloudError> {
        self.transfers
            .try_begin(operation_type, id)
            .ok_or_else(|| CloudError::TransferInProgress(id.to_string()))
    }

    /// Downloads into `{saves}/cstemp/{save_name}` first and only touches the
    /// live save once the download is complete.
    async fn staged_restore<F, Fut>(
        &self,
        operation_id: Uuid,
        save_name: &str,
        download: F,
    ) -> Result<(), CloudError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<(), CloudError>>,
    {
        let staging = paths::combine(&self.saves_path, &[TEMP_DIRECTORY, save_name]);
        let target = paths::combine(&self.saves_path, &[save_name]);

        self.storage.delete_path(&staging, self.mode, true).await?;
        let result = self
            .swap_in(operation_id, save_name, &staging, &target, download)
            .await;

        if let Err(e) = self.storage.delete_path(&staging, self.mode, true).await {
            warn!("Failed to clean up {staging}: {e}");
        }
        result
    }

    async fn swap_in<F, Fut>(
        &self,
        operation_id: Uuid,
        save_name: &str,
        staging: &str,
        target: &str,
        download: F,
    ) -> Result<(), CloudError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<(), CloudError>>,
    {
        download(staging.to_string()).await?;
        self.report(operation_id, OperationType::Download, save_name, OperationStatus::InProgress, None);

        self.storage.delete_path(target, self.mode, true).await?;
        if let Err(e) = self.storage.move_path(staging, target, self.mode).await {
            error!("Failed to move {staging} to {target}: {e}");
            if let Err(cleanup) = self.storage.delete_path(target, self.mode, true).await {
                error!("Failed to remove the partial save at {target}: {cleanup}");
            }
            return Err(e.into());
        }
        info!("Restored {save_name}");
        Ok(())
    }

    async fn track<T, F, Fut>(&self, operation_type: OperationType, target: &str, work: F) -> Result<T, CloudError>
    where
        F: FnOnce(Uuid) -> Fut,
        Fut: Future<Output = Result<T, CloudError>>,
    {
        let operation_id = Uuid::new_v4();
        self.report(operation_id, operation_type, target, OperationStatus::Starting, None);

        let result = work(operation_id).await;
        match &result {
            Ok(_) => self.report(operation_id, operation_type, target, OperationStatus::Completed, None),
            Err(e) => {
                error!("{operation_type:?} of {target} failed: {e}");
                self.report(operation_id, operation_type, target, OperationStatus::Failed, Some(e.to_string()))
            }
        }
        result
    }

    /// Send progress update through channel
    fn report(
        &self,
        operation_id: Uuid,
        operation_type: OperationType,
        target: &str,
        status: OperationStatus,
        error: Option<String>,
    ) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(ProgressUpdate {
                operation_id,
                target: target.to_string(),
                operation_type,
                status,
                error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CloudProvider;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use save_cloud_sync_core::{DirectBackend, SaveInfo};
    use tempfile::TempDir;

    const SAVE_GAME_INFO: &str = "<Farmer><name>Alex</name><farmName>Sunny</farmName><stats><Values><item><key><string>daysPlayed</string></key><value><unsignedInt>12</unsignedInt></value></item></Values></stats></Farmer>";

    /// Records every call and serves a fixed cloud listing. Downloads write a
    /// single `cloud` file into the destination.
    struct FakeClient {
        storage: Arc<Storage>,
        calls: Mutex<Vec<String>>,
        cloud: Vec<SaveInfo>,
        fail_on: Option<&'static str>,
    }

    impl FakeClient {
        fn new(storage: Arc<Storage>) -> Self {
            Self {
                storage,
                calls: Mutex::new(Vec::new()),
                cloud: Vec::new(),
                fail_on: None,
            }
        }

        fn record(&self, call: &'static str, arg: &str) -> Result<(), CloudError> {
            self.calls.lock().unwrap().push(format!("{call} {arg}"));
            if self.fail_on == Some(call) {
                Err(CloudError::InvalidResponse(call.to_string()))
            } else {
                Ok(())
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        async fn write_download(&self, mode: StorageMode, destination: &str) -> Result<(), CloudError> {
            self.storage.write_file(destination, "cloud", b"from cloud", mode).await?;
            Ok(())
        }
    }

    #[async_trait]
    impl CloudClient for FakeClient {
        fn provider(&self) -> CloudProvider {
            CloudProvider::Dropbox
        }

        fn is_signed_in(&self) -> bool {
            true
        }

        async fn get_saves(&self) -> Result<SaveListing, CloudError> {
            self.record("get_saves", "")?;
            Ok(SaveListing {
                saves: self.cloud.clone(),
                load_failed: false,
            })
        }

        async fn delete_save(&self, save_name: &str) -> Result<(), CloudError> {
            self.record("delete_save", save_name)
        }

        async fn upload_save(&self, _: StorageMode, _: &str, save_name: &str) -> Result<(), CloudError> {
            self.record("upload_save", save_name)
        }

        async fn download_save(&self, mode: StorageMode, save_name: &str, destination: &str) -> Result<(), CloudError> {
            self.record("download_save", save_name)?;
            self.write_download(mode, destination).await
        }

        async fn get_backups(&self) -> Result<Vec<BackupInfo>, CloudError> {
            self.record("get_backups", "")?;
            Ok(Vec::new())
        }

        async fn delete_backup(&self, cloud_folder_name: &str) -> Result<(), CloudError> {
            self.record("delete_backup", cloud_folder_name)
        }

        async fn backup_save(&self, save_name: &str) -> Result<(), CloudError> {
            self.record("backup_save", save_name)
        }

        async fn download_backup(
            &self,
            mode: StorageMode,
            cloud_folder_name: &str,
            destination: &str,
        ) -> Result<(), CloudError> {
            self.record("download_backup", cloud_folder_name)?;
            self.write_download(mode, destination).await
        }

        async fn purge_backups(&self, backups_to_keep: usize) -> Result<(), CloudError> {
            self.record("purge_backups", &backups_to_keep.to_string())
        }
    }

    struct Fixture {
        _dir: TempDir,
        saves: String,
        storage: Arc<Storage>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let saves = paths::combine(&dir.path().to_string_lossy(), &["Saves"]);
        let storage = Arc::new(Storage::new("/nonexistent/Android/data", Arc::new(DirectBackend::unrestricted())));
        let folder = paths::combine(&saves, &["Farm_1"]);
        for (name, content) in [("SaveGameInfo", SAVE_GAME_INFO), ("Farm_1", "local")] {
            storage
                .write_file(&folder, name, content.as_bytes(), StorageMode::Legacy)
                .await
                .unwrap();
        }
        Fixture { _dir: dir, saves, storage }
    }

    fn service(fixture: &Fixture, client: Arc<FakeClient>) -> SyncService {
        SyncService::new(client, fixture.storage.clone(), StorageMode::Legacy, fixture.saves.clone())
    }

    fn cloud_save(days_played: u32) -> SaveInfo {
        SaveInfo {
            folder_name: "Farm_1".into(),
            farmer_name: "Alex".into(),
            farm_name: "Sunny".into(),
            days_played,
        }
    }

    #[tokio::test]
    async fn test_upload_backs_up_then_replaces() {
        let fixture = fixture().await;
        let client = Arc::new(FakeClient::new(fixture.storage.clone()));
        service(&fixture, client.clone()).upload_save("Farm_1").await.unwrap();

        assert_eq!(
            client.calls(),
            vec![
                "backup_save Farm_1",
                "purge_backups 2",
                "delete_save Farm_1",
                "upload_save Farm_1"
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_purge_does_not_stop_upload() {
        let fixture = fixture().await;
        let mut client = FakeClient::new(fixture.storage.clone());
        client.fail_on = Some("purge_backups");
        let client = Arc::new(client);

        service(&fixture, client.clone())
            .with_options(SyncOptions { backups_to_keep: 3, ..SyncOptions::default() })
            .upload_save("Farm_1")
            .await
            .unwrap();

        assert_eq!(
            client.calls(),
            vec![
                "backup_save Farm_1",
                "purge_backups 3",
                "delete_save Farm_1",
                "upload_save Farm_1"
            ]
        );
    }

    #[tokio::test]
    async fn test_upload_without_purge() {
        let fixture = fixture().await;
        let client = Arc::new(FakeClient::new(fixture.storage.clone()));
        service(&fixture, client.clone())
            .with_options(SyncOptions { purge_backups: false, ..SyncOptions::default() })
            .upload_save("Farm_1")
            .await
            .unwrap();

        assert_eq!(
            client.calls(),
            vec!["backup_save Farm_1", "delete_save Farm_1", "upload_save Farm_1"]
        );
    }

    #[tokio::test]
    async fn test_upload_without_backups() {
        let fixture = fixture().await;
        let client = Arc::new(FakeClient::new(fixture.storage.clone()));
        service(&fixture, client.clone())
            .with_options(SyncOptions { backup_saves: false, ..SyncOptions::default() })
            .upload_save("Farm_1")
            .await
            .unwrap();

        assert_eq!(client.calls(), vec!["delete_save Farm_1", "upload_save Farm_1"]);
    }

    #[tokio::test]
    async fn test_failed_backup_keeps_cloud_copy() {
        let fixture = fixture().await;
        let mut client = FakeClient::new(fixture.storage.clone());
        client.fail_on = Some("backup_save");
        let client = Arc::new(client);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = service(&fixture, client.clone())
            .with_progress_channel(tx)
            .upload_save("Farm_1")
            .await;

        assert!(result.is_err());
        assert_eq!(client.calls(), vec!["backup_save Farm_1"]);
        assert_eq!(rx.recv().await.unwrap().status, OperationStatus::Starting);
        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.status, OperationStatus::Failed);
        assert!(failed.error.is_some());
    }

    #[tokio::test]
    async fn test_restore_replaces_local_save() {
        let fixture = fixture().await;
        let client = Arc::new(FakeClient::new(fixture.storage.clone()));
        service(&fixture, client.clone()).restore_save("Farm_1").await.unwrap();

        let folder = paths::combine(&fixture.saves, &["Farm_1"]);
        let files = fixture.storage.file_paths(&folder, StorageMode::Legacy).await.unwrap();
        assert_eq!(files, vec![paths::combine(&folder, &["cloud"])]);

        let staging = paths::combine(&fixture.saves, &[TEMP_DIRECTORY]);
        let leftovers = fixture
            .storage
            .subdirectory_names(&staging, StorageMode::Legacy)
            .await
            .unwrap_or_default();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_failed_download_leaves_local_save() {
        let fixture = fixture().await;
        let mut client = FakeClient::new(fixture.storage.clone());
        client.fail_on = Some("download_save");
        let client = Arc::new(client);

        assert!(service(&fixture, client).restore_save("Farm_1").await.is_err());

        let text = fixture
            .storage
            .file_text(&paths::combine(&fixture.saves, &["Farm_1", "Farm_1"]), StorageMode::Legacy)
            .await
            .unwrap();
        assert_eq!(text, "local");
    }

    #[tokio::test]
    async fn test_restore_backup_targets_its_save() {
        let fixture = fixture().await;
        let client = Arc::new(FakeClient::new(fixture.storage.clone()));
        let date = chrono::FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 1, 1, 0, 0)
            .unwrap();
        let backup = BackupInfo {
            cloud_folder_name: "Farm_1_[2024-05-01T01.00.00+0000]".into(),
            folder_name: "Farm_1".into(),
            date,
        };

        service(&fixture, client.clone()).restore_backup(&backup).await.unwrap();

        assert_eq!(client.calls(), vec!["download_backup Farm_1_[2024-05-01T01.00.00+0000]"]);
        let text = fixture
            .storage
            .file_text(&paths::combine(&fixture.saves, &["Farm_1", "cloud"]), StorageMode::Legacy)
            .await
            .unwrap();
        assert_eq!(text, "from cloud");
    }

    #[tokio::test]
    async fn test_conflicts_compare_days_played() {
        let fixture = fixture().await;
        let mut client = FakeClient::new(fixture.storage.clone());
        client.cloud = vec![cloud_save(20)];
        let service = service(&fixture, Arc::new(client));

        let conflict = service.upload_conflict("Farm_1").await.unwrap().unwrap();
        assert_eq!(conflict.days_played, 12);
        assert_eq!(conflict.existing_days_played, 20);
        assert!(service.download_conflict("Farm_1").await.unwrap().is_none());
        assert!(matches!(
            service.download_conflict("Farm_9").await,
            Err(CloudError::SaveDoesntExist(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_respects_options() {
        let fixture = fixture().await;
        let client = Arc::new(FakeClient::new(fixture.storage.clone()));
        service(&fixture, client.clone())
            .with_options(SyncOptions { purge_backups: false, ..SyncOptions::default() })
            .purge_backups()
            .await
            .unwrap();
        assert!(client.calls().is_empty());

        service(&fixture, client.clone())
            .with_options(SyncOptions { backups_to_keep: 5, ..SyncOptions::default() })
            .purge_backups()
            .await
            .unwrap();
        assert_eq!(client.calls(), vec!["purge_backups 5"]);
    }

    #[tokio::test]
    async fn test_busy_identifier_is_rejected() {
        let fixture = fixture().await;
        let client = Arc::new(FakeClient::new(fixture.storage.clone()));
        let service = service(&fixture, client.clone());

        let _held = service.transfers().try_begin(OperationType::Download, "Farm_1").unwrap();
        assert!(matches!(
            service.upload_save("Farm_1").await,
            Err(CloudError::TransferInProgress(_))
        ));
        assert!(client.calls().is_empty());
    }

    #[test]
    fn test_transfer_guard_releases() {
        let state = TransferState::default();
        let guard = state.try_begin(OperationType::Upload, "Farm_1").unwrap();
        assert!(state.is_transferring(OperationType::Upload, "Farm_1"));
        assert!(state.try_begin(OperationType::Delete, "Farm_1").is_none());
        assert!(state.try_begin(OperationType::Delete, "Farm_2").is_some());

        drop(guard);
        assert!(!state.is_transferring(OperationType::Upload, "Farm_1"));
        assert!(state.in_flight().is_empty());
    }
}
