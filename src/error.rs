//! Error taxonomy shared by every service module.

use thiserror::Error;

/// Coarse classification used by the HTTP layer to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    Conflict,
    Forbidden,
    Internal,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("video {0} not found")]
    VideoNotFound(String),

    #[error("favorite not found")]
    FavoriteNotFound,

    #[error("mark {0} not found")]
    MarkNotFound(String),

    #[error("annotation {0} not found")]
    AnnotationNotFound(String),

    #[error("note {0} not found")]
    NoteNotFound(String),

    /// The video record exists but its payload does not.
    #[error("file {file} for video {video_id} is missing from storage")]
    BlobMissing {
        video_id: String,
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid video status: {0}")]
    InvalidStatus(String),

    #[error("requested range not satisfiable for {len} bytes")]
    RangeNotSatisfiable { len: u64 },

    #[error("unsupported batch action: {0}")]
    UnsupportedAction(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("video already favorited")]
    AlreadyFavorited,

    #[error("not allowed to modify this resource")]
    Forbidden,

    #[error("database error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::VideoNotFound(_)
            | Self::FavoriteNotFound
            | Self::MarkNotFound(_)
            | Self::AnnotationNotFound(_)
            | Self::NoteNotFound(_)
            | Self::BlobMissing { .. } => ErrorKind::NotFound,
            Self::InvalidId(_)
            | Self::InvalidStatus(_)
            | Self::RangeNotSatisfiable { .. }
            | Self::UnsupportedAction(_)
            | Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::AlreadyFavorited => ErrorKind::Conflict,
            Self::Forbidden => ErrorKind::Forbidden,
            Self::Store(_) | Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
