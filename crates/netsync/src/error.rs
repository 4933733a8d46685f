use spv_chain::HeaderTreeError;

#[derive(Debug)]
pub enum SyncError {
    /// Lifecycle operation attempted while the synchronizer is running.
    Busy(&'static str),
    NotConnected,
    Tree(HeaderTreeError),
    Internal(&'static str),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Busy(what) => write!(f, "must be stopped to {what}"),
            SyncError::NotConnected => write!(f, "not connected to a peer"),
            SyncError::Tree(err) => write!(f, "{err}"),
            SyncError::Internal(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<HeaderTreeError> for SyncError {
    fn from(err: HeaderTreeError) -> Self {
        SyncError::Tree(err)
    }
}
