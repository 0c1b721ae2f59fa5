//! Records persisted in the document store and exposed through the API.
//!
//! Every dependent record (favorite, watch history, comment, mark, annotation,
//! note) carries the `VideoId` it belongs to so the cascade in
//! [`crate::cascade`] can sweep it by a single filter.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ServiceError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = ServiceError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(value.trim())
                    .map(Self)
                    .map_err(|_| ServiceError::InvalidId(value.to_owned()))
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.0.to_string()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                Uuid::parse_str(text)
                    .map(Self)
                    .map_err(|err| FromSqlError::Other(Box::new(err)))
            }
        }
    };
}

uuid_id!(
    /// Stable identifier of a video for the lifetime of the asset.
    VideoId
);
uuid_id!(
    /// Identifier of any dependent record (favorite, mark, note, ...).
    RecordId
);

/// Lifecycle status of a video. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Draft,
    Private,
    Public,
}

impl VideoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Private => "private",
            Self::Public => "public",
        }
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VideoStatus {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "draft" => Ok(Self::Draft),
            "private" => Ok(Self::Private),
            "public" => Ok(Self::Public),
            other => Err(ServiceError::InvalidStatus(other.to_owned())),
        }
    }
}

impl ToSql for VideoStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for VideoStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|err: ServiceError| FromSqlError::Other(Box::new(err)))
    }
}

/// Denormalized counters kept on the video row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoStats {
    pub views: i64,
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: VideoId,
    pub user_id: String,
    pub title: String,
    pub description: String,
    /// Name of the payload relative to the upload root.
    pub file_name: String,
    pub file_size: i64,
    pub duration: f64,
    /// Container format tag, e.g. `mp4`.
    pub format: String,
    pub status: VideoStatus,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_file: Option<String>,
    pub stats: VideoStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Video {
    /// Every stored file that belongs to this video, primary file first.
    pub fn stored_files(&self) -> Vec<String> {
        let mut files = vec![self.file_name.clone()];
        files.extend(self.cover_file.iter().cloned());
        files.extend(self.thumbnail_file.iter().cloned());
        files
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Favorite {
    pub id: RecordId,
    pub user_id: String,
    pub video_id: VideoId,
    pub video_title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_file: Option<String>,
    pub video_duration: f64,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchHistory {
    pub user_id: String,
    pub video_id: VideoId,
    pub video_title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_file: Option<String>,
    pub video_duration: f64,
    pub progress: f64,
    pub watched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: RecordId,
    pub video_id: VideoId,
    pub user_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mark {
    pub id: RecordId,
    pub user_id: String,
    pub video_id: VideoId,
    /// Position in the video, in seconds.
    pub timestamp: f64,
    pub content: String,
    pub annotations: Vec<Annotation>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: RecordId,
    pub user_id: String,
    pub mark_id: RecordId,
    pub video_id: VideoId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: RecordId,
    pub user_id: String,
    pub video_id: VideoId,
    pub timestamp: f64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One page of a listing plus the total number of matching documents.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    pub items: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_closed_set_only() {
        assert_eq!("public".parse::<VideoStatus>().unwrap(), VideoStatus::Public);
        assert_eq!("draft".parse::<VideoStatus>().unwrap(), VideoStatus::Draft);
        assert!(matches!(
            "archived".parse::<VideoStatus>(),
            Err(ServiceError::InvalidStatus(value)) if value == "archived"
        ));
    }

    #[test]
    fn malformed_video_id_is_invalid_input() {
        let err = "not-a-uuid".parse::<VideoId>().unwrap_err();
        assert!(matches!(err, ServiceError::InvalidId(_)));
    }

    #[test]
    fn video_id_survives_display_and_parse() {
        let id = VideoId::new();
        let parsed: VideoId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
