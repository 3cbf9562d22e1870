//! Error taxonomy for the archive and asset subsystem.

/// Errors surfaced by the library.  Transcoding failures never appear
/// here: the transcoder absorbs them and falls back to the input bytes.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Input is neither a readable container nor parseable JSON.
    #[error("invalid project format: {0}")]
    InvalidFormat(String),
    /// Container unpacked but carries no `project.json` manifest.
    #[error("invalid project archive: {0}")]
    InvalidProject(String),
    /// An asset reference does not map to an existing file.
    #[error("asset not found: {0}")]
    NotFound(String),
    /// A decoded asset filename resolves outside the assets directory.
    #[error("asset path escapes the assets directory: {0}")]
    PathEscape(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("container: {0}")]
    Zip(#[from] zip::result::ZipError),
    /// The owning session was replaced before the write landed.
    #[error("session {0} has been closed")]
    SessionClosed(String),
    /// Upload payload could not be decoded.
    #[error("invalid upload payload: {0}")]
    Upload(String),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

impl ArchiveError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True for errors a UI should render as a placeholder rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::PathEscape(_))
    }
}

/// Attach a path-qualified context to a `std::io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, action: &str, path: &std::path::Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, action: &str, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| ArchiveError::io(format!("{action} {}", path.display()), e))
    }
}
