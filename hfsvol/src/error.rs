use thiserror::Error;

#[derive(Error, Debug)]
pub enum HfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("disk full")]
    DiskFull,

    #[error("read-only volume")]
    ReadOnly,

    #[error("invalid B-tree node: {0}")]
    BadNode(String),

    #[error("unrecognized on-disk format: {0}")]
    BadFormat(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("name too long")]
    NameTooLong,

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("volume is damaged; writes refused")]
    Damaged,
}

pub type Result<T> = std::result::Result<T, HfsError>;

impl HfsError {
    /// Errors that indicate on-disk metadata can no longer be trusted.
    /// The volume is marked damaged when one of these escapes a write path.
    pub fn is_damage(&self) -> bool {
        matches!(self, HfsError::Io(_) | HfsError::BadNode(_))
    }
}
