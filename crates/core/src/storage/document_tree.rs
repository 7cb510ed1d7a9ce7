use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use super::{plan_move, temporary_name, MovePlan, StorageBackend, MAX_TEMP_NAME_ATTEMPTS};
use crate::{paths, StorageError};

/// Opaque handle the platform uses for a document or directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: DocumentId,
    pub name: String,
    pub is_directory: bool,
}

/// The platform's document API for one granted directory tree.
///
/// Lookups by name on this interface are not reliable, so the backend only
/// ever lists children and matches names itself.
#[async_trait]
pub trait DocumentProvider: Send + Sync {
    /// The directory the grant covers.
    async fn root(&self) -> Result<Document, StorageError>;

    async fn list_children(&self, directory: &DocumentId) -> Result<Vec<Document>, StorageError>;

    async fn read(&self, document: &DocumentId) -> Result<Vec<u8>, StorageError>;

    async fn create_directory(&self, parent: &DocumentId, name: &str) -> Result<Document, StorageError>;

    async fn create_file(&self, parent: &DocumentId, name: &str) -> Result<Document, StorageError>;

    async fn write(&self, document: &DocumentId, bytes: &[u8]) -> Result<(), StorageError>;

    /// Deletes a document, recursively for directories. Returns whether the
    /// platform reported success.
    async fn delete(&self, document: &DocumentId) -> Result<bool, StorageError>;

    /// Renames in place. The handle may change.
    async fn rename(&self, document: &DocumentId, name: &str) -> Result<DocumentId, StorageError>;

    /// Moves to another parent, keeping the name. The handle may change.
    async fn move_document(
        &self,
        document: &DocumentId,
        from_parent: &DocumentId,
        to_parent: &DocumentId,
    ) -> Result<DocumentId, StorageError>;

    async fn has_grant(&self) -> bool;

    async fn request_grant(&self) -> Result<bool, StorageError>;
}

/// Backend for a document-tree grant rooted at `scope` (normally
/// `{primary}/Android/data`).
pub struct DocumentTreeBackend {
    provider: Arc<dyn DocumentProvider>,
    scope: String,
}

impl DocumentTreeBackend {
    pub fn new(provider: Arc<dyn DocumentProvider>, scope: impl Into<String>) -> Self {
        Self {
            provider,
            scope: paths::normalize(&scope.into()),
        }
    }

    fn segments(&self, path: &str) -> Result<Vec<String>, StorageError> {
        let relative = paths::relative_to(&self.scope, path)
            .ok_or_else(|| StorageError::scope_violation(&paths::normalize(path), &self.scope))?;
        Ok(relative
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn child(&self, directory: &DocumentId, name: &str) -> Result<Option<Document>, StorageError> {
        let children = self.provider.list_children(directory).await?;
        Ok(children
            .into_iter()
            .find(|child| !child.name.is_empty() && paths::equals_ignore_case(&child.name, name)))
    }

    /// Walks from the root, matching each segment case-insensitively.
    async fn resolve(&self, path: &str) -> Result<Option<Document>, StorageError> {
        let mut current = self.provider.root().await?;
        for segment in self.segments(path)? {
            if !current.is_directory {
                return Ok(None);
            }
            match self.child(&current.id, &segment).await? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    async fn resolve_directory(&self, path: &str) -> Result<Document, StorageError> {
        match self.resolve(path).await? {
            Some(document) if document.is_directory => Ok(document),
            _ => Err(StorageError::directory_doesnt_exist(&paths::normalize(path))),
        }
    }

    async fn ensure_directory(&self, path: &str) -> Result<Document, StorageError> {
        let mut current = self.provider.root().await?;
        let mut walked = self.scope.clone();
        for segment in self.segments(path)? {
            if !paths::is_name_valid(&segment) {
                return Err(StorageError::invalid_name(&segment));
            }
            walked = paths::combine(&walked, &[segment.as_str()]);
            current = match self.child(&current.id, &segment).await? {
                Some(existing) if existing.is_directory => existing,
                Some(_) => return Err(StorageError::already_exists(&walked)),
                None => {
                    debug!("Creating document directory {walked}");
                    self.provider.create_directory(&current.id, &segment).await?
                }
            };
        }
        Ok(current)
    }

    async fn children(&self, path: &str, directories: bool) -> Result<Vec<String>, StorageError> {
        let directory = self.resolve_directory(path).await?;
        let base = paths::normalize(path);
        let mut children: Vec<String> = self
            .provider
            .list_children(&directory.id)
            .await?
            .into_iter()
            .filter(|child| child.is_directory == directories && !child.name.is_empty())
            .map(|child| paths::combine(&base, &[child.name.as_str()]))
            .collect();
        children.sort();
        Ok(children)
    }

    /// Renames `document` inside `parent` to a name that differs only in
    /// letter case. Providers treat that as a no-op, so the rename goes
    /// through a random intermediate name.
    async fn rename_case_only(
        &self,
        document: &DocumentId,
        parent: &DocumentId,
        new_name: &str,
    ) -> Result<DocumentId, StorageError> {
        let siblings = self.provider.list_children(parent).await?;
        let temporary = (0..MAX_TEMP_NAME_ATTEMPTS)
            .map(|_| temporary_name())
            .find(|candidate| {
                !siblings
                    .iter()
                    .any(|sibling| paths::equals_ignore_case(&sibling.name, candidate))
            })
            .ok_or_else(|| StorageError::Other("Could not find an unused temporary name.".into()))?;

        let intermediate = self.provider.rename(document, &temporary).await?;
        self.provider.rename(&intermediate, new_name).await
    }
}

#[async_trait]
impl StorageBackend for DocumentTreeBackend {
    async fn subdirectory_paths(&self, path: &str) -> Result<Vec<String>, StorageError> {
        self.children(path, true).await
    }

    async fn file_paths(&self, path: &str) -> Result<Vec<String>, StorageError> {
        self.children(path, false).await
    }

    async fn file_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        match self.resolve(path).await? {
            Some(document) if !document.is_directory => self.provider.read(&document.id).await,
            _ => Err(StorageError::file_doesnt_exist(&paths::normalize(path))),
        }
    }

    async fn create_directory(&self, path: &str) -> Result<(), StorageError> {
        self.ensure_directory(path).await.map(|_| ())
    }

    async fn write_file(&self, parent: &str, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if !paths::is_name_valid(name) {
            return Err(StorageError::invalid_name(name));
        }
        let directory = self.ensure_directory(parent).await?;
        let target = paths::combine(parent, &[name]);

        if let Some(existing) = self.child(&directory.id, name).await? {
            if existing.is_directory {
                return Err(StorageError::is_directory(&target));
            }
            if !self.provider.delete(&existing.id).await? {
                return Err(StorageError::Other(format!("Failed to replace \"{target}\".")));
            }
        }

        let document = self.provider.create_file(&directory.id, name).await?;
        self.provider.write(&document.id, bytes).await
    }

    async fn delete_path(&self, path: &str) -> Result<(), StorageError> {
        let document = self
            .resolve(path)
            .await?
            .ok_or_else(|| StorageError::path_doesnt_exist(&paths::normalize(path)))?;
        if self.provider.delete(&document.id).await? {
            Ok(())
        } else {
            Err(StorageError::Other(format!("Failed to delete \"{path}\".")))
        }
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let plan = plan_move(from, to)?;
        let source = self
            .resolve(from)
            .await?
            .ok_or_else(|| StorageError::path_doesnt_exist(&paths::normalize(from)))?;
        let source_parent = self.resolve_directory(&paths::parent(from)).await?;

        match plan {
            MovePlan::Unchanged => Ok(()),
            MovePlan::CaseOnlyRename { new_name } => self
                .rename_case_only(&source.id, &source_parent.id, &new_name)
                .await
                .map(|_| ()),
            MovePlan::Rename { new_name } => {
                if self.child(&source_parent.id, &new_name).await?.is_some() {
                    return Err(StorageError::already_exists(&paths::normalize(to)));
                }
                self.provider.rename(&source.id, &new_name).await.map(|_| ())
            }
            MovePlan::Relocate { to_parent, new_name } => {
                if self.resolve(to).await?.is_some() {
                    return Err(StorageError::already_exists(&paths::normalize(to)));
                }
                let destination = self.ensure_directory(&to_parent).await?;
                if new_name.is_none() || self.child(&destination.id, &source.name).await?.is_none() {
                    let moved = self
                        .provider
                        .move_document(&source.id, &source_parent.id, &destination.id)
                        .await?;
                    if let Some(new_name) = new_name {
                        if paths::equals_ignore_case(&source.name, &new_name) {
                            self.rename_case_only(&moved, &destination.id, &new_name).await?;
                        } else {
                            self.provider.rename(&moved, &new_name).await?;
                        }
                    }
                } else {
                    // The old name is taken at the destination; rename first
                    // so the move cannot collide.
                    let temporary = self.provider.rename(&source.id, &temporary_name()).await?;
                    let moved = self
                        .provider
                        .move_document(&temporary, &source_parent.id, &destination.id)
                        .await?;
                    self.provider
                        .rename(&moved, new_name.as_deref().unwrap_or(&source.name))
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn is_permission_granted(&self) -> bool {
        self.provider.has_grant().await
    }

    async fn request_permission(&self) -> Result<bool, StorageError> {
        self.provider.request_grant().await
    }
}
