use std::io::{ErrorKind, SeekFrom};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::direct::DirectBackend;
use super::StorageBackend;
use crate::{paths, PermissionBroker, StorageError, StorageMode};

/// Largest payload moved across the service boundary in one call.
pub const CHUNK_SIZE: usize = 51200;

/// Error categories that survive the trip across the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    DirectoryDoesntExist,
    FileDoesntExist,
    PathDoesntExist,
    ScopeViolation,
    AlreadyExists,
    IsDirectory,
    InvalidName,
    PermissionDenied,
    Io,
    Other,
}

impl FaultKind {
    const ALL: [FaultKind; 10] = [
        FaultKind::DirectoryDoesntExist,
        FaultKind::FileDoesntExist,
        FaultKind::PathDoesntExist,
        FaultKind::ScopeViolation,
        FaultKind::AlreadyExists,
        FaultKind::IsDirectory,
        FaultKind::InvalidName,
        FaultKind::PermissionDenied,
        FaultKind::Io,
        FaultKind::Other,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FaultKind::DirectoryDoesntExist => "directory_doesnt_exist",
            FaultKind::FileDoesntExist => "file_doesnt_exist",
            FaultKind::PathDoesntExist => "path_doesnt_exist",
            FaultKind::ScopeViolation => "scope_violation",
            FaultKind::AlreadyExists => "already_exists",
            FaultKind::IsDirectory => "is_directory",
            FaultKind::InvalidName => "invalid_name",
            FaultKind::PermissionDenied => "permission_denied",
            FaultKind::Io => "io",
            FaultKind::Other => "other",
        }
    }

    pub fn from_name(name: &str) -> Option<FaultKind> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

/// A storage failure in the form it crosses the service boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    pub kind: String,
    pub message: String,
}

impl RemoteFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind: kind.name().to_string(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }

    /// Decodes a fault payload. Text that is not a fault object is kept as
    /// the message of an unknown fault.
    pub fn from_json(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_else(|_| Self {
            kind: String::new(),
            message: text.to_string(),
        })
    }

    /// Rebuilds the typed error on the caller's side.
    pub fn into_error(self) -> StorageError {
        let Some(kind) = FaultKind::from_name(&self.kind) else {
            warn!("Unrecognised storage fault kind {:?}", self.kind);
            return StorageError::Remote(self.message);
        };

        let message = self.message;
        match kind {
            FaultKind::DirectoryDoesntExist => StorageError::DirectoryDoesntExist(message),
            FaultKind::FileDoesntExist => StorageError::FileDoesntExist(message),
            FaultKind::PathDoesntExist => StorageError::PathDoesntExist(message),
            FaultKind::ScopeViolation => StorageError::ScopeViolation(message),
            FaultKind::AlreadyExists => StorageError::AlreadyExists(message),
            FaultKind::IsDirectory => StorageError::IsDirectory(message),
            FaultKind::InvalidName => StorageError::InvalidName(message),
            FaultKind::PermissionDenied => StorageError::PermissionDenied,
            FaultKind::Io => StorageError::Io(std::io::Error::new(ErrorKind::Other, message)),
            FaultKind::Other => StorageError::Other(message),
        }
    }
}

impl From<StorageError> for RemoteFault {
    fn from(error: StorageError) -> Self {
        let kind = match &error {
            StorageError::DirectoryDoesntExist(_) => FaultKind::DirectoryDoesntExist,
            StorageError::FileDoesntExist(_) => FaultKind::FileDoesntExist,
            StorageError::PathDoesntExist(_) => FaultKind::PathDoesntExist,
            StorageError::ScopeViolation(_) => FaultKind::ScopeViolation,
            StorageError::AlreadyExists(_) => FaultKind::AlreadyExists,
            StorageError::IsDirectory(_) => FaultKind::IsDirectory,
            StorageError::InvalidName(_) => FaultKind::InvalidName,
            StorageError::PermissionDenied => FaultKind::PermissionDenied,
            StorageError::Io(_) => FaultKind::Io,
            StorageError::BackendUnavailable(_) | StorageError::Remote(_) | StorageError::Other(_) => {
                FaultKind::Other
            }
        };
        let message = match error {
            StorageError::Io(e) => e.to_string(),
            other => other.to_string(),
        };
        RemoteFault::new(kind, message)
    }
}

impl From<std::io::Error> for RemoteFault {
    fn from(error: std::io::Error) -> Self {
        StorageError::Io(error).into()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub is_file: bool,
    pub is_directory: bool,
}

/// Calls the privileged helper process understands.
#[async_trait]
pub trait StorageServiceRpc: Send + Sync {
    /// Whether the helper process is reachable.
    async fn ping(&self) -> bool;

    async fn info(&self, path: &str) -> Result<FileInfo, RemoteFault>;

    async fn subdirectories(&self, path: &str) -> Result<Vec<String>, RemoteFault>;

    async fn files(&self, path: &str) -> Result<Vec<String>, RemoteFault>;

    async fn file_size(&self, path: &str) -> Result<u64, RemoteFault>;

    /// Bytes `start..end` of a file.
    async fn file_chunk(&self, path: &str, start: u64, end: u64) -> Result<Vec<u8>, RemoteFault>;

    async fn create_directory(&self, path: &str) -> Result<(), RemoteFault>;

    /// Writes `bytes` at offset `start`, creating the file when needed.
    async fn write_file_chunk(&self, path: &str, bytes: &[u8], start: u64) -> Result<(), RemoteFault>;

    async fn delete(&self, path: &str) -> Result<(), RemoteFault>;

    async fn move_path(&self, from: &str, to: &str) -> Result<(), RemoteFault>;
}

/// Backend that forwards every operation to the privileged helper process.
pub struct PrivilegedServiceBackend {
    service: Arc<dyn StorageServiceRpc>,
    permissions: Arc<dyn PermissionBroker>,
}

impl PrivilegedServiceBackend {
    pub fn new(service: Arc<dyn StorageServiceRpc>, permissions: Arc<dyn PermissionBroker>) -> Self {
        Self { service, permissions }
    }

    async fn service(&self) -> Result<&dyn StorageServiceRpc, StorageError> {
        if self.service.ping().await {
            Ok(self.service.as_ref())
        } else {
            Err(StorageError::BackendUnavailable(StorageMode::Shizuku))
        }
    }
}

#[async_trait]
impl StorageBackend for PrivilegedServiceBackend {
    async fn subdirectory_paths(&self, path: &str) -> Result<Vec<String>, StorageError> {
        self.service().await?.subdirectories(path).await.map_err(RemoteFault::into_error)
    }

    async fn file_paths(&self, path: &str) -> Result<Vec<String>, StorageError> {
        self.service().await?.files(path).await.map_err(RemoteFault::into_error)
    }

    async fn file_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let service = self.service().await?;
        let size = service.file_size(path).await.map_err(RemoteFault::into_error)?;

        let mut bytes = Vec::with_capacity(size as usize);
        let mut offset = 0u64;
        while offset < size {
            let end = (offset + CHUNK_SIZE as u64).min(size);
            let chunk = service
                .file_chunk(path, offset, end)
                .await
                .map_err(RemoteFault::into_error)?;
            if chunk.is_empty() {
                return Err(StorageError::Other(format!(
                    "The storage service returned no data for \"{path}\" at offset {offset}."
                )));
            }
            offset += chunk.len() as u64;
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }

    async fn create_directory(&self, path: &str) -> Result<(), StorageError> {
        self.service().await?.create_directory(path).await.map_err(RemoteFault::into_error)
    }

    async fn write_file(&self, parent: &str, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if !paths::is_name_valid(name) {
            return Err(StorageError::invalid_name(name));
        }
        let service = self.service().await?;
        service.create_directory(parent).await.map_err(RemoteFault::into_error)?;

        let target = paths::combine(parent, &[name]);
        let info = service.info(&target).await.map_err(RemoteFault::into_error)?;
        if info.is_directory {
            return Err(StorageError::is_directory(&target));
        }
        if info.is_file {
            service.delete(&target).await.map_err(RemoteFault::into_error)?;
        }

        if bytes.is_empty() {
            return service
                .write_file_chunk(&target, bytes, 0)
                .await
                .map_err(RemoteFault::into_error);
        }
        for (index, chunk) in bytes.chunks(CHUNK_SIZE).enumerate() {
            let start = (index * CHUNK_SIZE) as u64;
            service
                .write_file_chunk(&target, chunk, start)
                .await
                .map_err(RemoteFault::into_error)?;
        }
        Ok(())
    }

    async fn delete_path(&self, path: &str) -> Result<(), StorageError> {
        self.service().await?.delete(path).await.map_err(RemoteFault::into_error)
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.service().await?.move_path(from, to).await.map_err(RemoteFault::into_error)
    }

    async fn is_permission_granted(&self) -> bool {
        self.permissions.is_granted().await
    }

    async fn request_permission(&self) -> Result<bool, StorageError> {
        self.permissions.request().await
    }
}

/// The helper-process side of [`StorageServiceRpc`], running with the
/// privileges needed to reach the protected directory directly.
pub struct LocalStorageService {
    files: DirectBackend,
}

impl LocalStorageService {
    pub fn new(files: DirectBackend) -> Self {
        Self { files }
    }

    async fn regular_file(&self, path: &str) -> Result<String, RemoteFault> {
        let path = self.files.checked(path)?;
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(path),
            _ => Err(StorageError::file_doesnt_exist(&path).into()),
        }
    }
}

impl Default for LocalStorageService {
    fn default() -> Self {
        Self::new(DirectBackend::unrestricted())
    }
}

#[async_trait]
impl StorageServiceRpc for LocalStorageService {
    async fn ping(&self) -> bool {
        true
    }

    async fn info(&self, path: &str) -> Result<FileInfo, RemoteFault> {
        let path = self.files.checked(path)?;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(FileInfo {
                is_file: metadata.is_file(),
                is_directory: metadata.is_dir(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(FileInfo::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn subdirectories(&self, path: &str) -> Result<Vec<String>, RemoteFault> {
        Ok(self.files.subdirectory_paths(path).await?)
    }

    async fn files(&self, path: &str) -> Result<Vec<String>, RemoteFault> {
        Ok(self.files.file_paths(path).await?)
    }

    async fn file_size(&self, path: &str) -> Result<u64, RemoteFault> {
        let path = self.regular_file(path).await?;
        Ok(fs::metadata(&path).await?.len())
    }

    async fn file_chunk(&self, path: &str, start: u64, end: u64) -> Result<Vec<u8>, RemoteFault> {
        let path = self.regular_file(path).await?;
        let mut file = fs::File::open(&path).await?;
        file.seek(SeekFrom::Start(start)).await?;

        let mut chunk = Vec::with_capacity(end.saturating_sub(start) as usize);
        file.take(end.saturating_sub(start)).read_to_end(&mut chunk).await?;
        Ok(chunk)
    }

    async fn create_directory(&self, path: &str) -> Result<(), RemoteFault> {
        Ok(self.files.create_directory(path).await?)
    }

    async fn write_file_chunk(&self, path: &str, bytes: &[u8], start: u64) -> Result<(), RemoteFault> {
        let path = self.files.checked(path)?;
        debug!("Writing {} bytes at offset {start} of {path}", bytes.len());

        let mut file = OpenOptions::new().write(true).create(true).open(&path).await?;
        file.seek(SeekFrom::Start(start)).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteFault> {
        Ok(self.files.delete_path(path).await?)
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<(), RemoteFault> {
        Ok(self.files.move_path(from, to).await?)
    }
}
