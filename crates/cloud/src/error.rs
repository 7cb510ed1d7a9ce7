use save_cloud_sync_core::{SaveError, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("{provider} API error: HTTP {status} - {body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Not signed in to a cloud provider")]
    NotSignedIn,
    #[error("The save \"{0}\" doesn't exist.")]
    SaveDoesntExist(String),
    #[error("The backup \"{0}\" doesn't exist.")]
    BackupDoesntExist(String),
    #[error("\"{0}\" is already being transferred")]
    TransferInProgress(String),
    #[error("\"{0}\" would be written outside the destination folder")]
    UnsafePath(String),
    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Save(#[from] SaveError),
    #[error("{} operations failed: {}", .0.len(), join_messages(.0))]
    Aggregate(Vec<CloudError>),
}

fn join_messages(errors: &[CloudError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl CloudError {
    /// Collapses the failures of a fan-out: `None` when there were none, the
    /// error itself when there was one, an aggregate otherwise.
    pub fn from_errors(mut errors: Vec<CloudError>) -> Option<CloudError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(CloudError::Aggregate(errors)),
        }
    }

    /// HTTP status of a provider error response.
    pub fn status(&self) -> Option<u16> {
        match self {
            CloudError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Turns a non-success response into [`CloudError::Api`] carrying its body.
pub(crate) async fn check_response(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, CloudError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CloudError::Api {
        provider,
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_errors() {
        assert!(CloudError::from_errors(Vec::new()).is_none());

        let single = CloudError::from_errors(vec![CloudError::NotSignedIn]).unwrap();
        assert!(matches!(single, CloudError::NotSignedIn));

        let many = CloudError::from_errors(vec![
            CloudError::SaveDoesntExist("a".into()),
            CloudError::SaveDoesntExist("b".into()),
        ])
        .unwrap();
        assert!(matches!(&many, CloudError::Aggregate(errors) if errors.len() == 2));
        assert!(many.to_string().starts_with("2 operations failed"));
    }
}
