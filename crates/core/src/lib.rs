use serde::{Deserialize, Serialize};

pub mod paths;
pub mod platform;
pub mod saves;
pub mod storage;

pub use platform::{AlwaysGranted, PermissionBroker, Platform};
pub use saves::{
    collect_save_tree, filter_saves, find_conflict, get_local_saves, is_excluded_name,
    parse_save_game_info, parse_save_info_json, read_save_info, Conflict, SaveError, SaveFile,
    SaveInfo, SaveListing, SaveTree,
};
pub use storage::{
    direct::DirectBackend,
    document_tree::{Document, DocumentId, DocumentProvider, DocumentTreeBackend},
    privileged::{
        FaultKind, FileInfo, LocalStorageService, PrivilegedServiceBackend, RemoteFault,
        StorageServiceRpc, CHUNK_SIZE,
    },
    Storage, StorageBackend,
};

/// How files under the protected application-data directory are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Plain filesystem access.
    Legacy,
    /// A user-granted document tree.
    Saf,
    /// A privileged helper process reached over RPC.
    Shizuku,
}

/// Every storage failure, shared by all backends. Each variant carries the
/// complete human-readable message so that it survives a trip across the
/// privileged service boundary unchanged.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{0}")]
    DirectoryDoesntExist(String),
    #[error("{0}")]
    FileDoesntExist(String),
    #[error("{0}")]
    PathDoesntExist(String),
    #[error("{0}")]
    ScopeViolation(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("{0}")]
    IsDirectory(String),
    #[error("{0}")]
    InvalidName(String),
    #[error("Storage permission has not been granted")]
    PermissionDenied,
    #[error("The {0:?} storage backend is not available")]
    BackendUnavailable(StorageMode),
    #[error("Remote storage error: {0}")]
    Remote(String),
    #[error("{0}")]
    Other(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn directory_doesnt_exist(path: &str) -> Self {
        Self::DirectoryDoesntExist(format!("The directory \"{path}\" doesn't exist."))
    }

    pub fn file_doesnt_exist(path: &str) -> Self {
        Self::FileDoesntExist(format!("The file \"{path}\" doesn't exist."))
    }

    pub fn path_doesnt_exist(path: &str) -> Self {
        Self::PathDoesntExist(format!("The path \"{path}\" doesn't exist."))
    }

    pub fn scope_violation(path: &str, scope: &str) -> Self {
        Self::ScopeViolation(format!("The path \"{path}\" is outside of \"{scope}\"."))
    }

    pub fn already_exists(path: &str) -> Self {
        Self::AlreadyExists(format!("The path \"{path}\" already exists."))
    }

    pub fn is_directory(path: &str) -> Self {
        Self::IsDirectory(format!("The path \"{path}\" is a directory."))
    }

    pub fn invalid_name(name: &str) -> Self {
        Self::InvalidName(format!("The name \"{name}\" is not valid."))
    }

    /// True for the three "does not exist" variants.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DirectoryDoesntExist(_) | Self::FileDoesntExist(_) | Self::PathDoesntExist(_)
        )
    }
}
