use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use log::{debug, error, info, warn};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{json, Value};

use save_cloud_sync_core::{
    collect_save_tree, parse_save_info_json, paths, read_save_info, SaveInfo, SaveListing, Storage,
    StorageMode,
};

use crate::archive::{contained_target, read_archive, strip_root_folder, ArchiveEntry};
use crate::auth::{OAuthConfig, TokenSource};
use crate::backup::{
    self, backup_folder_name, is_save_backup_name, parse_backup_name, save_id_group, select_for_purge,
    BackupInfo,
};
use crate::error::check_response;
use crate::fanout::fan_out;
use crate::retry::{RemoteCaller, RetryPolicy};
use crate::{CloudClient, CloudError, CloudProvider, Credentials};

const PROVIDER: &str = "Dropbox";
const MAX_IN_FLIGHT: usize = 10;

#[derive(Debug, Clone)]
pub struct DropboxEndpoints {
    pub api_base: String,
    pub content_base: String,
    pub auth_url: String,
    pub token_url: String,
}

impl Default for DropboxEndpoints {
    fn default() -> Self {
        Self {
            api_base: "https://api.dropboxapi.com/2".to_string(),
            content_base: "https://content.dropboxapi.com/2".to_string(),
            auth_url: "https://www.dropbox.com/oauth2/authorize".to_string(),
            token_url: "https://api.dropbox.com/oauth2/token".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListFolderResult {
    entries: Vec<Metadata>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(rename = ".tag")]
    tag: String,
    name: String,
    #[serde(default)]
    path_lower: Option<String>,
}

fn is_retriable(e: &CloudError) -> bool {
    matches!(e.status(), Some(429) | Some(503))
}

fn is_not_found(e: &CloudError) -> bool {
    matches!(e, CloudError::Api { status: 409, body, .. } if body.contains("/not_found/"))
}

fn info_path(save_name: &str) -> String {
    format!("/Info/{save_name}.json")
}

fn save_path(save_name: &str) -> String {
    format!("/Saves/{save_name}")
}

fn backup_path(cloud_folder_name: &str) -> String {
    format!("/Backups/{cloud_folder_name}")
}

/// JSON for the `Dropbox-API-Arg` header. Header values must be ASCII, so
/// everything else is written as `\u` escapes.
fn api_arg(value: &Value) -> String {
    let mut escaped = String::new();
    for c in value.to_string().chars() {
        if c.is_ascii() {
            escaped.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                escaped.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    escaped
}

/// Cloud client for Dropbox. Saves live in `/Saves/{name}`, their summaries
/// in `/Info/{name}.json` and backups in `/Backups/{name}_[{timestamp}]`.
pub struct DropboxClient {
    http: reqwest::Client,
    endpoints: DropboxEndpoints,
    tokens: Option<TokenSource>,
    caller: RemoteCaller,
    storage: Arc<Storage>,
}

impl DropboxClient {
    pub fn new(credentials: &Credentials, storage: Arc<Storage>) -> Result<Self, CloudError> {
        Self::with_endpoints(credentials, storage, DropboxEndpoints::default())
    }

    pub fn with_endpoints(
        credentials: &Credentials,
        storage: Arc<Storage>,
        endpoints: DropboxEndpoints,
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

    async fn rpc(&self, endpoint: &str, body: &Value) -> Result<reqwest::Response, CloudError> {
        let token = self.access_token().await?;
        debug!("Dropbox {endpoint} {body}");
        let response = self
            .http
            .post(format!("{}/{endpoint}", self.endpoints.api_base))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        check_response(PROVIDER, response).await
    }

    async fn call_rpc(&self, endpoint: &'static str, body: Value) -> Result<reqwest::Response, CloudError> {
        let body = &body;
        self.caller.call(move || self.rpc(endpoint, body)).await
    }

    async fn download(&self, endpoint: &str, arg: &Value) -> Result<Bytes, CloudError> {
        let token = self.access_token().await?;
        debug!("Dropbox {endpoint} {arg}");
        let response = self
            .http
            .post(format!("{}/{endpoint}", self.endpoints.content_base))
            .bearer_auth(token)
            .header("Dropbox-API-Arg", api_arg(arg))
            .send()
            .await?;
        Ok(check_response(PROVIDER, response).await?.bytes().await?)
    }

    async fn download_zip(&self, path: &str) -> Result<Vec<ArchiveEntry>, CloudError> {
        let arg = json!({ "path": path });
        let arg = &arg;
        let bytes = self
            .caller
            .call(move || self.download("files/download_zip", arg))
            .await?;
        read_archive(bytes).await
    }

    async fn upload(&self, path: &str, bytes: Bytes) -> Result<(), CloudError> {
        let arg = json!({ "path": path, "mode": "overwrite", "mute": true });
        let (arg, bytes) = (&arg, &bytes);
        self.caller
            .call(move || async move {
                let token = self.access_token().await?;
                let response = self
                    .http
                    .post(format!("{}/files/upload", self.endpoints.content_base))
                    .bearer_auth(token)
                    .header("Dropbox-API-Arg", api_arg(arg))
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(bytes.clone())
                    .send()
                    .await?;
                check_response(PROVIDER, response).await.map(|_| ())
            })
            .await
    }

    async fn delete_if_exists(&self, path: String) -> Result<(), CloudError> {
        match self.call_rpc("files/delete_v2", json!({ "path": path })).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!("Nothing to delete at {path}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_folder(&self, path: &str) -> Result<Vec<Metadata>, CloudError> {
        let mut page: ListFolderResult = self
            .call_rpc("files/list_folder", json!({ "path": path }))
            .await?
            .json()
            .await?;
        let mut entries = std::mem::take(&mut page.entries);

        while page.has_more {
            page = self
                .call_rpc("files/list_folder/continue", json!({ "cursor": page.cursor }))
                .await?
                .json()
                .await?;
            entries.append(&mut page.entries);
        }
        Ok(entries)
    }

    async fn backup_folders(&self) -> Result<Vec<Metadata>, CloudError> {
        match self.list_folder("/Backups").await {
            Ok(entries) => Ok(entries.into_iter().filter(|entry| entry.tag == "folder").collect()),
            Err(e) if is_not_found(&e) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn download_folder(
        &self,
        mode: StorageMode,
        cloud_path: &str,
        folder_name: &str,
        destination: &str,
    ) -> Result<(), CloudError> {
        let entries = self.download_zip(cloud_path).await?;
        let targets = entries
            .iter()
            .map(|entry| contained_target(destination, strip_root_folder(&entry.name, folder_name)))
            .collect::<Result<Vec<_>, _>>()?;
        for (entry, target) in entries.into_iter().zip(targets) {
            self.storage
                .write_file(&paths::parent(&target), &paths::name(&target), &entry.data, mode)
                .await?;
        }
        Ok(())
    }

    async fn upload_contents(
        &self,
        mode: StorageMode,
        saves_path: &str,
        save_name: &str,
        info: &SaveInfo,
    ) -> Result<(), CloudError> {
        let folder = paths::combine(saves_path, &[save_name]);
        let tree = collect_save_tree(&self.storage, mode, &folder, save_name).await?;
        debug!("Uploading {} files of {save_name}", tree.files.len());

        let remote_root = save_path(save_name);
        let remote_root = remote_root.as_str();
        fan_out(tree.files, MAX_IN_FLIGHT, move |file| async move {
            let bytes = self.storage.file_bytes(&file.path, mode).await?;
            self.upload(&format!("{remote_root}/{}", file.relative), Bytes::from(bytes))
                .await
        })
        .await?;

        // The summary goes last so listings only ever show complete uploads.
        self.upload(&info_path(save_name), Bytes::from(serde_json::to_vec(info)?))
            .await
    }
}

#[async_trait]
impl CloudClient for DropboxClient {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Dropbox
    }

    fn is_signed_in(&self) -> bool {
        self.tokens.is_some()
    }

    async fn get_saves(&self) -> Result<SaveListing, CloudError> {
        let entries = match self.download_zip("/Info").await {
            Ok(entries) => entries,
            Err(e) if is_not_found(&e) => return Ok(SaveListing::default()),
            Err(e) => return Err(e),
        };

        let mut listing = SaveListing::default();
        for entry in entries {
            let parsed = String::from_utf8(entry.data)
                .map_err(|e| e.to_string())
                .and_then(|text| parse_save_info_json(&text).map_err(|e| e.to_string()));
            match parsed {
                Ok(info) => listing.saves.push(info),
                Err(e) => {
                    warn!("Skipping unreadable save info {}: {e}", entry.name);
                    listing.load_failed = true;
                }
            }
        }
        Ok(listing)
    }

    async fn delete_save(&self, save_name: &str) -> Result<(), CloudError> {
        let (info, folder) = tokio::join!(
            self.delete_if_exists(info_path(save_name)),
            self.delete_if_exists(save_path(save_name)),
        );
        match CloudError::from_errors([info, folder].into_iter().filter_map(Result::err).collect()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn upload_save(&self, mode: StorageMode, saves_path: &str, save_name: &str) -> Result<(), CloudError> {
        let info = read_save_info(&self.storage, mode, saves_path, save_name).await?;
        info!("Uploading {save_name} to Dropbox");

        if let Err(e) = self.upload_contents(mode, saves_path, save_name, &info).await {
            warn!("Upload of {save_name} failed, removing what was uploaded: {e}");
            if let Err(cleanup) = self.delete_save(save_name).await {
                error!("Failed to remove the partial upload of {save_name}: {cleanup}");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn download_save(&self, mode: StorageMode, save_name: &str, destination: &str) -> Result<(), CloudError> {
        match self
            .download_folder(mode, &save_path(save_name), save_name, destination)
            .await
        {
            Err(e) if is_not_found(&e) => Err(CloudError::SaveDoesntExist(save_name.to_string())),
            result => result,
        }
    }

    async fn get_backups(&self) -> Result<Vec<BackupInfo>, CloudError> {
        let mut backups = Vec::new();
        for entry in self.backup_folders().await? {
            match parse_backup_name(&entry.name) {
                Some(backup) => backups.push(backup),
                None => warn!("Ignoring unrecognised backup folder {}", entry.name),
            }
        }
        backups.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(backups)
    }

    async fn delete_backup(&self, cloud_folder_name: &str) -> Result<(), CloudError> {
        self.delete_if_exists(backup_path(cloud_folder_name)).await
    }

    async fn backup_save(&self, save_name: &str) -> Result<(), CloudError> {
        let target = backup_path(&backup_folder_name(save_name, &backup::now()));
        let body = json!({ "from_path": save_path(save_name), "to_path": target });

        match self.call_rpc("files/copy_v2", body).await {
            Ok(_) => {
                info!("Backed up {save_name} to {target}");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                info!("{save_name} is not in the cloud yet, nothing to back up");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn download_backup(
        &self,
        mode: StorageMode,
        cloud_folder_name: &str,
        destination: &str,
    ) -> Result<(), CloudError> {
        match self
            .download_folder(mode, &backup_path(cloud_folder_name), cloud_folder_name, destination)
            .await
        {
            Err(e) if is_not_found(&e) => Err(CloudError::BackupDoesntExist(cloud_folder_name.to_string())),
            result => result,
        }
    }

    async fn purge_backups(&self, backups_to_keep: usize) -> Result<(), CloudError> {
        let folders: Vec<Metadata> = self
            .backup_folders()
            .await?
            .into_iter()
            .filter(|entry| is_save_backup_name(&entry.name))
            .collect();

        let doomed = select_for_purge(
            folders,
            backups_to_keep,
            |entry| save_id_group(&entry.name),
            |entry| parse_backup_name(&entry.name).map(|backup| backup.date),
        );
        if doomed.is_empty() {
            return Ok(());
        }

        info!("Purging {} old backups", doomed.len());
        let results = join_all(doomed.iter().map(move |entry| async move {
            let path = entry
                .path_lower
                .clone()
                .unwrap_or_else(|| backup_path(&entry.name));
            (entry, self.delete_if_exists(path).await)
        }))
        .await;

        for (entry, result) in results {
            if let Err(e) = result {
                error!("Failed to purge backup {}: {e}", entry.name);
            }
        }
        Ok(())
    }
}
