use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use uuid::Uuid;

use crate::{paths, Platform, StorageError, StorageMode};

pub mod direct;
pub mod document_tree;
pub mod privileged;

/// Number of random temporary names tried before a case-only rename gives up.
pub(crate) const MAX_TEMP_NAME_ATTEMPTS: usize = 100;

/// Operations every storage backend provides. Paths are absolute,
/// `/`-separated strings.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Full paths of the directories directly below `path`.
    async fn subdirectory_paths(&self, path: &str) -> Result<Vec<String>, StorageError>;

    async fn subdirectory_names(&self, path: &str) -> Result<Vec<String>, StorageError> {
        let children = self.subdirectory_paths(path).await?;
        Ok(children.iter().map(|child| paths::name(child)).collect())
    }

    /// Full paths of the regular files directly below `path`.
    async fn file_paths(&self, path: &str) -> Result<Vec<String>, StorageError>;

    async fn file_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    async fn file_text(&self, path: &str) -> Result<String, StorageError> {
        let bytes = self.file_bytes(path).await?;
        String::from_utf8(bytes)
            .map_err(|e| StorageError::Other(format!("The file \"{path}\" is not valid UTF-8: {e}")))
    }

    /// Creates `path` and any missing ancestors.
    async fn create_directory(&self, path: &str) -> Result<(), StorageError>;

    /// Writes `bytes` to `parent/name`, creating `parent` when needed. An
    /// existing file is replaced; an existing directory is an error.
    async fn write_file(&self, parent: &str, name: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Removes a file or a whole directory tree.
    async fn delete_path(&self, path: &str) -> Result<(), StorageError>;

    async fn move_path(&self, from: &str, to: &str) -> Result<(), StorageError>;

    async fn is_permission_granted(&self) -> bool;

    async fn request_permission(&self) -> Result<bool, StorageError>;
}

/// How a move has to be carried out, decided from the two paths alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MovePlan {
    Unchanged,
    /// Same parent, names differ only by letter case.
    CaseOnlyRename { new_name: String },
    /// Same parent, different name.
    Rename { new_name: String },
    /// Different parent; `new_name` is set when the name changes as well.
    Relocate {
        to_parent: String,
        new_name: Option<String>,
    },
}

pub(crate) fn plan_move(from: &str, to: &str) -> Result<MovePlan, StorageError> {
    let from = paths::normalize(from);
    let to = paths::normalize(to);

    if from == to {
        return Ok(MovePlan::Unchanged);
    }
    if paths::relative_to(&from, &to).is_some_and(|rest| !rest.is_empty()) {
        return Err(StorageError::Other(format!(
            "Cannot move \"{from}\" into its own subdirectory \"{to}\"."
        )));
    }

    let from_name = paths::name(&from);
    let to_name = paths::name(&to);
    if !paths::is_name_valid(&to_name) {
        return Err(StorageError::invalid_name(&to_name));
    }

    let to_parent = paths::parent(&to);
    if paths::path_equal(&paths::parent(&from), &to_parent) {
        if paths::equals_ignore_case(&from_name, &to_name) {
            Ok(MovePlan::CaseOnlyRename { new_name: to_name })
        } else {
            Ok(MovePlan::Rename { new_name: to_name })
        }
    } else {
        Ok(MovePlan::Relocate {
            to_parent,
            new_name: (from_name != to_name).then_some(to_name),
        })
    }
}

pub(crate) fn temporary_name() -> String {
    format!(".cloudsync-{}", Uuid::new_v4().simple())
}

/// Single entry point for file access. Paths below the protected directory
/// are routed to the backend matching the selected [`StorageMode`];
/// everything else, and everything in [`StorageMode::Legacy`], uses direct
/// I/O.
pub struct Storage {
    protected_dir: String,
    direct: Arc<dyn StorageBackend>,
    document_tree: Option<Arc<dyn StorageBackend>>,
    privileged: Option<Arc<dyn StorageBackend>>,
}

impl Storage {
    pub fn new(protected_dir: impl Into<String>, direct: Arc<dyn StorageBackend>) -> Self {
        Self {
            protected_dir: paths::normalize(&protected_dir.into()),
            direct,
            document_tree: None,
            privileged: None,
        }
    }

    pub fn for_platform(platform: &Platform, direct: Arc<dyn StorageBackend>) -> Self {
        Self::new(platform.protected_dir(), direct)
    }

    pub fn with_document_tree(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.document_tree = Some(backend);
        self
    }

    pub fn with_privileged_service(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.privileged = Some(backend);
        self
    }

    pub fn protected_dir(&self) -> &str {
        &self.protected_dir
    }

    fn backend(&self, path: &str, mode: StorageMode) -> Result<&Arc<dyn StorageBackend>, StorageError> {
        if mode == StorageMode::Legacy || !paths::is_under(&self.protected_dir, path) {
            return Ok(&self.direct);
        }

        let backend = match mode {
            StorageMode::Saf => self.document_tree.as_ref(),
            StorageMode::Shizuku => self.privileged.as_ref(),
            StorageMode::Legacy => Some(&self.direct),
        };
        backend.ok_or(StorageError::BackendUnavailable(mode))
    }

    pub async fn subdirectory_names(&self, path: &str, mode: StorageMode) -> Result<Vec<String>, StorageError> {
        self.backend(path, mode)?.subdirectory_names(path).await
    }

    pub async fn subdirectory_paths(&self, path: &str, mode: StorageMode) -> Result<Vec<String>, StorageError> {
        self.backend(path, mode)?.subdirectory_paths(path).await
    }

    pub async fn file_paths(&self, path: &str, mode: StorageMode) -> Result<Vec<String>, StorageError> {
        self.backend(path, mode)?.file_paths(path).await
    }

    pub async fn file_bytes(&self, path: &str, mode: StorageMode) -> Result<Vec<u8>, StorageError> {
        self.backend(path, mode)?.file_bytes(path).await
    }

    pub async fn file_text(&self, path: &str, mode: StorageMode) -> Result<String, StorageError> {
        self.backend(path, mode)?.file_text(path).await
    }

    pub async fn create_directory(&self, path: &str, mode: StorageMode) -> Result<(), StorageError> {
        self.backend(path, mode)?.create_directory(path).await
    }

    pub async fn write_file(
        &self,
        parent: &str,
        name: &str,
        bytes: &[u8],
        mode: StorageMode,
    ) -> Result<(), StorageError> {
        self.backend(parent, mode)?.write_file(parent, name, bytes).await
    }

    /// Deletes `path`. With `safe` set, a path that does not exist is not an
    /// error.
    pub async fn delete_path(&self, path: &str, mode: StorageMode, safe: bool) -> Result<(), StorageError> {
        match self.backend(path, mode)?.delete_path(path).await {
            Err(e) if safe && e.is_not_found() => {
                debug!("Nothing to delete at {path}");
                Ok(())
            }
            result => result,
        }
    }

    pub async fn move_path(&self, from: &str, to: &str, mode: StorageMode) -> Result<(), StorageError> {
        let source = self.backend(from, mode)?;
        let target = self.backend(to, mode)?;
        if !Arc::ptr_eq(source, target) {
            return Err(StorageError::Other(format!(
                "Cannot move \"{from}\" to \"{to}\" across storage backends."
            )));
        }
        source.move_path(from, to).await
    }

    pub async fn is_permission_granted(&self, path: &str, mode: StorageMode) -> Result<bool, StorageError> {
        Ok(self.backend(path, mode)?.is_permission_granted().await)
    }

    pub async fn request_permission(&self, path: &str, mode: StorageMode) -> Result<bool, StorageError> {
        self.backend(path, mode)?.request_permission().await
    }
}
