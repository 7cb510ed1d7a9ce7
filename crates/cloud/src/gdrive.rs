use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use futures::future::{join_all, try_join};
use log::{debug, error, info, warn};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use uuid::Uuid;

use save_cloud_sync_core::{
    collect_save_tree, parse_save_info_json, paths, read_save_info, SaveListing, Storage, StorageMode,
};

use crate::archive::contained_target;
use crate::auth::{OAuthConfig, TokenSource};
use crate::backup::{
    self, backup_folder_name, format_backup_timestamp, parse_backup_name, parse_backup_timestamp,
    select_for_purge, BackupInfo,
};
use crate::error::check_response;
use crate::fanout::fan_out;
use crate::retry::{RemoteCaller, RetryPolicy};
use crate::{CloudClient, CloudError, CloudProvider, Credentials};

const PROVIDER: &str = "Google Drive";
const MAX_IN_FLIGHT: usize = 200;
const APP_FOLDER: &str = "CloudSync";
const SAVES_FOLDER: &str = "Saves";
const BACKUPS_FOLDER: &str = "Backups";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,parents,description)";
const FILE_FIELDS: &str = "id,name,mimeType,parents,description";
const PAGE_SIZE: &str = "1000";

#[derive(Debug, Clone)]
pub struct DriveEndpoints {
    pub api_base: String,
    pub upload_base: String,
    pub auth_url: String,
    pub token_url: String,
}

impl Default for DriveEndpoints {
    fn default() -> Self {
        Self {
            api_base: "https://www.googleapis.com/drive/v3".to_string(),
            upload_base: "https://www.googleapis.com/upload/drive/v3".to_string(),
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    description: Option<String>,
}

impl DriveFile {
    fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

/// IDs of the app's `Saves` and `Backups` folders.
#[derive(Debug)]
struct Folders {
    saves: String,
    backups: String,
}

/// A file or folder found while walking a remote folder.
#[derive(Debug)]
struct RemoteEntry {
    id: String,
    /// Path below the walked folder, `/`-separated.
    relative: String,
}

#[derive(Debug, Default)]
struct RemoteTree {
    /// Parents before children.
    folders: Vec<RemoteEntry>,
    files: Vec<RemoteEntry>,
}

fn is_retriable(e: &CloudError) -> bool {
    match e {
        CloudError::Api { status: 403 | 429, body, .. } => body.to_lowercase().contains("ratelimitexceeded"),
        _ => false,
    }
}

fn is_not_found(e: &CloudError) -> bool {
    e.status() == Some(404)
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn children_query(parent_id: &str) -> String {
    format!("'{}' in parents and trashed = false", escape_query(parent_id))
}

fn folder_query(parent_id: &str, name: &str) -> String {
    format!(
        "'{}' in parents and name = '{}' and mimeType = '{FOLDER_MIME_TYPE}' and trashed = false",
        escape_query(parent_id),
        escape_query(name)
    )
}

/// Body of a `multipart/related` upload: JSON metadata followed by the
/// file content.
fn multipart_related(boundary: &str, metadata: &Value, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 256);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n\
             --{boundary}\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

/// Date of a backup folder: the timestamp in its description, or failing
/// that the one in its name.
fn backup_date(file: &DriveFile, backup: &BackupInfo) -> DateTime<FixedOffset> {
    file.description
        .as_deref()
        .and_then(parse_backup_timestamp)
        .unwrap_or(backup.date)
}

/// Cloud client for Google Drive. Everything lives below an app folder,
/// `CloudSync/Saves/{name}` and `CloudSync/Backups/{name}_[{timestamp}]`.
/// Save folders carry their [`save_cloud_sync_core::SaveInfo`] as JSON in
/// the folder description.
pub struct GoogleDriveClient {
    http: reqwest::Client,
    endpoints: DriveEndpoints,
    tokens: Option<TokenSource>,
    caller: RemoteCaller,
    storage: Arc<Storage>,
    folders: OnceCell<Folders>,
}

impl GoogleDriveClient {
    pub fn new(credentials: &Credentials, storage: Arc<Storage>) -> Result<Self, CloudError> {
        Self::with_endpoints(credentials, storage, DriveEndpoints::default())
    }

    pub fn with_endpoints(
        credentials: &Credentials,
        storage: Arc<Storage>,
        endpoints: DriveEndpoints,
    ) -> Result<Self, CloudError> {
        let tokens = if credentials.is_complete() {
            let config = OAuthConfig {
                auth_url: endpoints.auth_url.clone(),
                token_url: endpoints.token_url.clone(),
                client_id: credentials.client_id.clone(),
                client_secret: credentials.client_secret.clone(),
            };
            Some(TokenSource::new(config, credentials.refresh_token.clone())?)
        } else {
            None
        };

        Ok(Self {
            http: reqwest::Client::new(),
            endpoints,
            tokens,
            caller: RemoteCaller::new(PROVIDER, MAX_IN_FLIGHT, is_retriable),
            storage,
            folders: OnceCell::new(),
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.caller = self.caller.with_policy(policy);
        self
    }

    async fn access_token(&self) -> Result<String, CloudError> {
        match &self.tokens {
            Some(tokens) => tokens.access_token().await,
            None => Err(CloudError::NotSignedIn),
        }
    }

    /// Sends the request `build` makes, through the retry policy. `build` runs
    /// once per attempt.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response, CloudError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Sync,
    {
        let build = &build;
        self.caller
            .call(move || async move {
                let token = self.access_token().await?;
                let response = build(&self.http).bearer_auth(token).send().await?;
                if response.status() == StatusCode::UNAUTHORIZED {
                    if let Some(tokens) = &self.tokens {
                        tokens.invalidate().await;
                    }
                }
                check_response(PROVIDER, response).await
            })
            .await
    }

    async fn list(&self, query: &str) -> Result<Vec<DriveFile>, CloudError> {
        let url = format!("{}/files", self.endpoints.api_base);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let current = page_token.as_deref();
            let page: FileList = self
                .send(|http| {
                    let request = http.get(&url).query(&[
                        ("q", query),
                        ("fields", LIST_FIELDS),
                        ("pageSize", PAGE_SIZE),
                    ]);
                    match current {
                        Some(token) => request.query(&[("pageToken", token)]),
                        None => request,
                    }
                })
                .await?
                .json()
                .await?;

            files.extend(page.files);
            page_token = page.next_page_token;
            if page_token.is_none() {
                return Ok(files);
            }
        }
    }

    async fn children(&self, parent_id: &str) -> Result<Vec<DriveFile>, CloudError> {
        self.list(&children_query(parent_id)).await
    }

    async fn find_folders(&self, parent_id: &str, name: &str) -> Result<Vec<DriveFile>, CloudError> {
        self.list(&folder_query(parent_id, name)).await
    }

    async fn create_folder(&self, name: &str, parent_id: &str, description: Option<&str>) -> Result<String, CloudError> {
        let mut metadata = json!({ "name": name, "mimeType": FOLDER_MIME_TYPE, "parents": [parent_id] });
        if let Some(description) = description {
            metadata["description"] = json!(description);
        }

        let url = format!("{}/files", self.endpoints.api_base);
        let metadata = &metadata;
        let created: DriveFile = self
            .send(|http| http.post(&url).query(&[("fields", FILE_FIELDS)]).json(metadata))
            .await?
            .json()
            .await?;
        debug!("Created folder {name} ({})", created.id);
        Ok(created.id)
    }

    async fn set_description(&self, id: &str, description: &str) -> Result<(), CloudError> {
        let url = format!("{}/files/{id}", self.endpoints.api_base);
        let body = json!({ "description": description });
        let body = &body;
        self.send(|http| http.patch(&url).query(&[("fields", "id")]).json(body))
            .await?;
        Ok(())
    }

    async fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<String, CloudError> {
        match self.find_folders(parent_id, name).await?.into_iter().next() {
            Some(folder) => Ok(folder.id),
            None => {
                info!("Creating Google Drive folder {name}");
                self.create_folder(name, parent_id, None).await
            }
        }
    }

    async fn discover_folders(&self) -> Result<Folders, CloudError> {
        debug!("Locating the {APP_FOLDER} folder");
        let app = self.ensure_folder("root", APP_FOLDER).await?;
        let (saves, backups) = try_join(
            self.ensure_folder(&app, SAVES_FOLDER),
            self.ensure_folder(&app, BACKUPS_FOLDER),
        )
        .await?;
        Ok(Folders { saves, backups })
    }

    /// Folder IDs, resolved by the first caller. Callers arriving during the
    /// lookup wait for it instead of starting their own.
    async fn folders(&self) -> Result<&Folders, CloudError> {
        self.folders.get_or_try_init(|| self.discover_folders()).await
    }

    async fn delete_file(&self, id: &str) -> Result<(), CloudError> {
        let url = format!("{}/files/{id}", self.endpoints.api_base);
        match self.send(|http| http.delete(&url)).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!("{id} is already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_all(&self, files: Vec<DriveFile>) -> Result<(), CloudError> {
        let results = join_all(files.iter().map(|file| self.delete_file(&file.id))).await;
        match CloudError::from_errors(results.into_iter().filter_map(Result::err).collect()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn upload_file(&self, parent_id: &str, name: &str, content: Vec<u8>) -> Result<(), CloudError> {
        let boundary = Uuid::new_v4().simple().to_string();
        let metadata = json!({ "name": name, "parents": [parent_id] });
        let body = Bytes::from(multipart_related(&boundary, &metadata, &content));
        let content_type = format!("multipart/related; boundary={boundary}");

        let url = format!("{}/files", self.endpoints.upload_base);
        let (body, content_type) = (&body, &content_type);
        self.send(|http| {
            http.post(&url)
                .query(&[("uploadType", "multipart"), ("fields", "id")])
                .header(CONTENT_TYPE, content_type.as_str())
                .body(body.clone())
        })
        .await?;
        Ok(())
    }

    async fn download_file(&self, id: &str) -> Result<Bytes, CloudError> {
        let url = format!("{}/files/{id}", self.endpoints.api_base);
        Ok(self
            .send(|http| http.get(&url).query(&[("alt", "media")]))
            .await?
            .bytes()
            .await?)
    }

    async fn copy_file(&self, id: &str, name: &str, parent_id: &str) -> Result<(), CloudError> {
        let url = format!("{}/files/{id}/copy", self.endpoints.api_base);
        let body = json!({ "name": name, "parents": [parent_id] });
        let body = &body;
        self.send(|http| http.post(&url).query(&[("fields", "id")]).json(body))
            .await?;
        Ok(())
    }

    /// Walks a remote folder with one listing per subfolder.
    async fn walk(&self, root_id: &str) -> Result<RemoteTree, CloudError> {
        let mut tree = RemoteTree::default();
        let mut pending = vec![(root_id.to_string(), String::new())];

        while let Some((id, relative)) = pending.pop() {
            for child in self.children(&id).await? {
                let path = paths::combine(&relative, &[child.name.as_str()]);
                if child.is_folder() {
                    pending.push((child.id.clone(), path.clone()));
                    tree.folders.push(RemoteEntry { id: child.id, relative: path });
                } else {
                    tree.files.push(RemoteEntry { id: child.id, relative: path });
                }
            }
        }
        Ok(tree)
    }

    /// Creates `relative_folders` below `root_id` in order and returns the ID
    /// of every folder by relative path, the root under `""`.
    async fn create_folders<'a>(
        &self,
        root_id: &str,
        relative_folders: impl Iterator<Item = &'a str>,
    ) -> Result<HashMap<String, String>, CloudError> {
        let mut ids = HashMap::from([(String::new(), root_id.to_string())]);
        for relative in relative_folders {
            let parent = ids
                .get(&paths::parent(relative))
                .cloned()
                .unwrap_or_else(|| root_id.to_string());
            let id = self.create_folder(&paths::name(relative), &parent, None).await?;
            ids.insert(relative.to_string(), id);
        }
        Ok(ids)
    }

    async fn download_folder(&self, mode: StorageMode, folder_id: &str, destination: &str) -> Result<(), CloudError> {
        let tree = self.walk(folder_id).await?;
        for entry in tree.folders.iter().chain(&tree.files) {
            contained_target(destination, &entry.relative)?;
        }
        self.storage.create_directory(destination, mode).await?;
        for folder in &tree.folders {
            self.storage
                .create_directory(&paths::combine(destination, &[folder.relative.as_str()]), mode)
                .await?;
        }

        debug!("Downloading {} files into {destination}", tree.files.len());
        fan_out(tree.files, MAX_IN_FLIGHT, move |file| async move {
            let bytes = self.download_file(&file.id).await?;
            let target = contained_target(destination, &file.relative)?;
            self.storage
                .write_file(&paths::parent(&target), &paths::name(&target), &bytes, mode)
                .await?;
            Ok(())
        })
        .await
    }

    async fn upload_contents(
        &self,
        mode: StorageMode,
        saves_path: &str,
        save_name: &str,
        folder_id: &str,
    ) -> Result<(), CloudError> {
        let folder = paths::combine(saves_path, &[save_name]);
        let tree = collect_save_tree(&self.storage, mode, &folder, save_name).await?;
        let ids = self
            .create_folders(folder_id, tree.directories.iter().map(String::as_str))
            .await?;

        debug!("Uploading {} files of {save_name}", tree.files.len());
        let ids = &ids;
        fan_out(tree.files, MAX_IN_FLIGHT, move |file| async move {
            let parent = ids
                .get(&paths::parent(&file.relative))
                .map(String::as_str)
                .unwrap_or(folder_id);
            let content = self.storage.file_bytes(&file.path, mode).await?;
            self.upload_file(parent, &paths::name(&file.relative), content).await
        })
        .await
    }

    async fn copy_tree(&self, source_id: &str, target_id: &str) -> Result<(), CloudError> {
        let tree = self.walk(source_id).await?;
        let ids = self
            .create_folders(target_id, tree.folders.iter().map(|folder| folder.relative.as_str()))
            .await?;

        let ids = &ids;
        fan_out(tree.files, MAX_IN_FLIGHT, move |file| async move {
            let parent = ids
                .get(&paths::parent(&file.relative))
                .map(String::as_str)
                .unwrap_or(target_id);
            self.copy_file(&file.id, &paths::name(&file.relative), parent).await
        })
        .await
    }

    /// Backup folders whose name has the backup shape.
    async fn backup_folders(&self) -> Result<Vec<(DriveFile, BackupInfo)>, CloudError> {
        let folders = self.folders().await?;
        let mut backups = Vec::new();
        for file in self.children(&folders.backups).await? {
            if !file.is_folder() {
                continue;
            }
            match parse_backup_name(&file.name) {
                Some(backup) => backups.push((file, backup)),
                None => warn!("Ignoring unrecognised backup folder {}", file.name),
            }
        }
        Ok(backups)
    }
}

#[async_trait]
impl CloudClient for GoogleDriveClient {
    fn provider(&self) -> CloudProvider {
        CloudProvider::GoogleDrive
    }

    fn is_signed_in(&self) -> bool {
        self.tokens.is_some()
    }

    async fn get_saves(&self) -> Result<SaveListing, CloudError> {
        let folders = self.folders().await?;
        let mut listing = SaveListing::default();

        for folder in self.children(&folders.saves).await? {
            if !folder.is_folder() {
                continue;
            }
            // The description is written last, so a folder without one is
            // an upload still in progress.
            let Some(description) = folder.description.as_deref().filter(|d| !d.is_empty()) else {
                debug!("Skipping incomplete save {}", folder.name);
                continue;
            };
            match parse_save_info_json(description) {
                Ok(info) => listing.saves.push(info),
                Err(e) => {
                    warn!("Skipping unreadable save {}: {e}", folder.name);
                    listing.load_failed = true;
                }
            }
        }
        Ok(listing)
    }

    async fn delete_save(&self, save_name: &str) -> Result<(), CloudError> {
        let folders = self.folders().await?;
        let existing = self.find_folders(&folders.saves, save_name).await?;
        self.delete_all(existing).await
    }

    async fn upload_save(&self, mode: StorageMode, saves_path: &str, save_name: &str) -> Result<(), CloudError> {
        let info = read_save_info(&self.storage, mode, saves_path, save_name).await?;
        let folders = self.folders().await?;
        info!("Uploading {save_name} to Google Drive");

        self.delete_save(save_name).await?;
        let folder_id = self.create_folder(save_name, &folders.saves, None).await?;

        let uploaded = match self.upload_contents(mode, saves_path, save_name, &folder_id).await {
            Ok(()) => self.set_description(&folder_id, &serde_json::to_string(&info)?).await,
            Err(e) => Err(e),
        };
        if let Err(e) = uploaded {
            warn!("Upload of {save_name} failed, removing what was uploaded: {e}");
            if let Err(cleanup) = self.delete_file(&folder_id).await {
                error!("Failed to remove the partial upload of {save_name}: {cleanup}");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn download_save(&self, mode: StorageMode, save_name: &str, destination: &str) -> Result<(), CloudError> {
        let folders = self.folders().await?;
        match self.find_folders(&folders.saves, save_name).await?.into_iter().next() {
            Some(folder) => self.download_folder(mode, &folder.id, destination).await,
            None => Err(CloudError::SaveDoesntExist(save_name.to_string())),
        }
    }

    async fn get_backups(&self) -> Result<Vec<BackupInfo>, CloudError> {
        let mut backups: Vec<BackupInfo> = self
            .backup_folders()
            .await?
            .into_iter()
            .map(|(file, mut backup)| {
                backup.date = backup_date(&file, &backup);
                backup
            })
            .collect();
        backups.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(backups)
    }

    async fn delete_backup(&self, cloud_folder_name: &str) -> Result<(), CloudError> {
        let folders = self.folders().await?;
        let existing = self.find_folders(&folders.backups, cloud_folder_name).await?;
        self.delete_all(existing).await
    }

    async fn backup_save(&self, save_name: &str) -> Result<(), CloudError> {
        let folders = self.folders().await?;
        let Some(source) = self.find_folders(&folders.saves, save_name).await?.into_iter().next() else {
            info!("{save_name} is not in the cloud yet, nothing to back up");
            return Ok(());
        };

        let date = backup::now();
        let name = backup_folder_name(save_name, &date);
        let target = self
            .create_folder(&name, &folders.backups, Some(&format_backup_timestamp(&date)))
            .await?;

        if let Err(e) = self.copy_tree(&source.id, &target).await {
            warn!("Backup of {save_name} failed, removing {name}: {e}");
            if let Err(cleanup) = self.delete_file(&target).await {
                error!("Failed to remove the partial backup {name}: {cleanup}");
            }
            return Err(e);
        }
        info!("Backed up {save_name} to {name}");
        Ok(())
    }

    async fn download_backup(
        &self,
        mode: StorageMode,
        cloud_folder_name: &str,
        destination: &str,
    ) -> Result<(), CloudError> {
        let folders = self.folders().await?;
        match self
            .find_folders(&folders.backups, cloud_folder_name)
            .await?
            .into_iter()
            .next()
        {
            Some(folder) => self.download_folder(mode, &folder.id, destination).await,
            None => Err(CloudError::BackupDoesntExist(cloud_folder_name.to_string())),
        }
    }

    async fn purge_backups(&self, backups_to_keep: usize) -> Result<(), CloudError> {
        let doomed = select_for_purge(
            self.backup_folders().await?,
            backups_to_keep,
            |(_, backup)| backup.folder_name.clone(),
            |(file, backup)| Some(backup_date(file, backup)),
        );
        if doomed.is_empty() {
            return Ok(());
        }

        info!("Purging {} old backups", doomed.len());
        let results = join_all(
            doomed
                .iter()
                .map(move |(file, _)| async move { (file, self.delete_file(&file.id).await) }),
        )
        .await;

        for (file, result) in results {
            if let Err(e) = result {
                error!("Failed to purge backup {}: {e}", file.name);
            }
        }
        Ok(())
    }
}
