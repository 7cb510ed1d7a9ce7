use std::io::ErrorKind;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::fs;

use super::{plan_move, temporary_name, MovePlan, StorageBackend, MAX_TEMP_NAME_ATTEMPTS};
use crate::{paths, AlwaysGranted, PermissionBroker, StorageError};

/// Filesystem backend built on `tokio::fs`.
pub struct DirectBackend {
    scope: Option<String>,
    permissions: Arc<dyn PermissionBroker>,
}

impl DirectBackend {
    pub fn new(permissions: Arc<dyn PermissionBroker>) -> Self {
        Self {
            scope: None,
            permissions,
        }
    }

    /// Backend that refuses every path outside `scope`.
    pub fn scoped(scope: impl Into<String>, permissions: Arc<dyn PermissionBroker>) -> Self {
        Self {
            scope: Some(paths::normalize(&scope.into())),
            permissions,
        }
    }

    /// Unrestricted backend that never asks for permission.
    pub fn unrestricted() -> Self {
        Self::new(Arc::new(AlwaysGranted))
    }

    pub(crate) fn checked(&self, path: &str) -> Result<String, StorageError> {
        let path = paths::normalize(path);
        match &self.scope {
            Some(scope) if !paths::is_under(scope, &path) => Err(StorageError::scope_violation(&path, scope)),
            _ => Ok(path),
        }
    }

    async fn children(&self, path: &str, directories: bool) -> Result<Vec<String>, StorageError> {
        let path = self.checked(path)?;
        if !is_directory(&path).await {
            return Err(StorageError::directory_doesnt_exist(&path));
        }

        let mut entries = fs::read_dir(&path).await?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let wanted = if directories { file_type.is_dir() } else { file_type.is_file() };
            if wanted {
                let name = entry.file_name();
                children.push(paths::combine(&path, &[name.to_string_lossy().as_ref()]));
            }
        }
        children.sort();
        Ok(children)
    }

    async fn unused_temporary_path(&self, parent: &str) -> Result<String, StorageError> {
        for _ in 0..MAX_TEMP_NAME_ATTEMPTS {
            let candidate = paths::combine(parent, &[temporary_name().as_str()]);
            if !exists(&candidate).await {
                return Ok(candidate);
            }
        }
        Err(StorageError::Other(format!(
            "Could not find an unused temporary name in \"{parent}\"."
        )))
    }
}

async fn exists(path: &str) -> bool {
    fs::symlink_metadata(path).await.is_ok()
}

async fn is_directory(path: &str) -> bool {
    fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}

async fn is_file(path: &str) -> bool {
    fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}

#[async_trait]
impl StorageBackend for DirectBackend {
    async fn subdirectory_paths(&self, path: &str) -> Result<Vec<String>, StorageError> {
        self.children(path, true).await
    }

    async fn file_paths(&self, path: &str) -> Result<Vec<String>, StorageError> {
        self.children(path, false).await
    }

    async fn file_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.checked(path)?;
        if !is_file(&path).await {
            return Err(StorageError::file_doesnt_exist(&path));
        }
        Ok(fs::read(&path).await?)
    }

    async fn create_directory(&self, path: &str) -> Result<(), StorageError> {
        let path = self.checked(path)?;
        if is_file(&path).await {
            return Err(StorageError::already_exists(&path));
        }
        fs::create_dir_all(&path).await?;
        Ok(())
    }

    async fn write_file(&self, parent: &str, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if !paths::is_name_valid(name) {
            return Err(StorageError::invalid_name(name));
        }
        let parent = self.checked(parent)?;
        self.create_directory(&parent).await?;

        let target = paths::combine(&parent, &[name]);
        if is_directory(&target).await {
            return Err(StorageError::is_directory(&target));
        }
        match fs::remove_file(&target).await {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        debug!("Writing {} bytes to {target}", bytes.len());
        fs::write(&target, bytes).await?;
        Ok(())
    }

    async fn delete_path(&self, path: &str) -> Result<(), StorageError> {
        let path = self.checked(path)?;
        let metadata = match fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StorageError::path_doesnt_exist(&path)),
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let from = self.checked(from)?;
        let to = self.checked(to)?;
        let plan = plan_move(&from, &to)?;

        if !exists(&from).await {
            return Err(StorageError::path_doesnt_exist(&from));
        }

        match plan {
            MovePlan::Unchanged => Ok(()),
            MovePlan::CaseOnlyRename { .. } => {
                // Case-insensitive filesystems treat the target as the source,
                // so go through a name that cannot collide.
                let temporary = self.unused_temporary_path(&paths::parent(&from)).await?;
                fs::rename(&from, &temporary).await?;
                fs::rename(&temporary, &to).await?;
                Ok(())
            }
            MovePlan::Rename { .. } => {
                if exists(&to).await {
                    return Err(StorageError::already_exists(&to));
                }
                fs::rename(&from, &to).await?;
                Ok(())
            }
            MovePlan::Relocate { to_parent, .. } => {
                if exists(&to).await {
                    return Err(StorageError::already_exists(&to));
                }
                self.create_directory(&to_parent).await?;
                fs::rename(&from, &to).await?;
                Ok(())
            }
        }
    }

    async fn is_permission_granted(&self) -> bool {
        self.permissions.is_granted().await
    }

    async fn request_permission(&self) -> Result<bool, StorageError> {
        self.permissions.request().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn root(dir: &TempDir) -> String {
        paths::normalize(&dir.path().to_string_lossy())
    }

    #[tokio::test]
    async fn test_write_creates_parents_and_replaces_files() {
        let dir = TempDir::new().unwrap();
        let backend = DirectBackend::unrestricted();
        let parent = paths::combine(&root(&dir), &["Saves", "Farm_1"]);

        backend.write_file(&parent, "Farm_1", b"first version").await.unwrap();
        backend.write_file(&parent, "Farm_1", b"second").await.unwrap();

        let bytes = backend.file_bytes(&paths::combine(&parent, &["Farm_1"])).await.unwrap();
        assert_eq!(bytes, b"second");
        assert_eq!(backend.file_paths(&parent).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_write_over_directory_fails() {
        let dir = TempDir::new().unwrap();
        let backend = DirectBackend::unrestricted();
        let base = root(&dir);
        backend.create_directory(&paths::combine(&base, &["taken"])).await.unwrap();

        let err = backend.write_file(&base, "taken", b"data").await.unwrap_err();
        assert!(matches!(err, StorageError::IsDirectory(_)));
    }

    #[tokio::test]
    async fn test_listing_missing_directory() {
        let dir = TempDir::new().unwrap();
        let backend = DirectBackend::unrestricted();

        let err = backend
            .subdirectory_names(&paths::combine(&root(&dir), &["nope"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DirectoryDoesntExist(_)));
    }

    #[tokio::test]
    async fn test_delete_is_recursive() {
        let dir = TempDir::new().unwrap();
        let backend = DirectBackend::unrestricted();
        let save = paths::combine(&root(&dir), &["Farm_1"]);
        backend.write_file(&paths::combine(&save, &["nested"]), "a", b"1").await.unwrap();

        backend.delete_path(&save).await.unwrap();
        assert!(!exists(&save).await);

        let err = backend.delete_path(&save).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_case_only_rename() {
        let dir = TempDir::new().unwrap();
        let backend = DirectBackend::unrestricted();
        let base = root(&dir);
        backend.write_file(&paths::combine(&base, &["Farm"]), "SaveGameInfo", b"x").await.unwrap();

        backend
            .move_path(&paths::combine(&base, &["Farm"]), &paths::combine(&base, &["FARM"]))
            .await
            .unwrap();

        assert_eq!(backend.subdirectory_names(&base).await.unwrap(), vec!["FARM".to_string()]);
    }

    #[tokio::test]
    async fn test_move_to_new_parent() {
        let dir = TempDir::new().unwrap();
        let backend = DirectBackend::unrestricted();
        let base = root(&dir);
        let staged = paths::combine(&base, &["cstemp", "Farm_1"]);
        backend.write_file(&staged, "Farm_1", b"save").await.unwrap();

        let target = paths::combine(&base, &["Saves", "Farm_1"]);
        backend.move_path(&staged, &target).await.unwrap();

        assert_eq!(
            backend.file_text(&paths::combine(&target, &["Farm_1"])).await.unwrap(),
            "save"
        );
        assert!(!exists(&staged).await);
    }

    #[tokio::test]
    async fn test_move_onto_existing_path_fails() {
        let dir = TempDir::new().unwrap();
        let backend = DirectBackend::unrestricted();
        let base = root(&dir);
        backend.create_directory(&paths::combine(&base, &["a"])).await.unwrap();
        backend.create_directory(&paths::combine(&base, &["b"])).await.unwrap();

        let err = backend
            .move_path(&paths::combine(&base, &["a"]), &paths::combine(&base, &["b"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_scope_is_enforced() {
        let dir = TempDir::new().unwrap();
        let base = root(&dir);
        let backend = DirectBackend::scoped(paths::combine(&base, &["inside"]), Arc::new(AlwaysGranted));

        let err = backend
            .create_directory(&paths::combine(&base, &["outside"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ScopeViolation(_)));
        backend
            .create_directory(&paths::combine(&base, &["inside", "ok"]))
            .await
            .unwrap();
    }
}
