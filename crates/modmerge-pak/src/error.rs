use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PakError {
    #[error("archive not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("unsupported archive format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("malformed archive {}: {message}", path.display())]
    Malformed { path: PathBuf, message: String },

    #[error("entry not found: {0}")]
    MissingEntry(String),

    #[error("entry {0} is not valid UTF-8 text")]
    NotText(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PakError {
    pub(crate) fn malformed(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        PakError::Malformed {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PakError>;
