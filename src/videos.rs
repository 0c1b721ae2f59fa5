//! Video records: upload bookkeeping, owner-scoped reads and updates,
//! listings, stats, watch history and comments.

use std::{ffi::OsStr, path::Path};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::favorites;
use crate::model::{
    Comment, Page, RecordId, Video, VideoId, VideoStats, VideoStatus, WatchHistory,
};
use crate::storage::BlobStore;
use crate::store::{self, Database, Pagination, SortField, VideoChanges, VideoQuery};

pub const VIDEO_EXTENSIONS: [&str; 6] = ["mp4", "mov", "avi", "wmv", "flv", "mkv"];
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "gif"];
/// Upper bound for cover and thumbnail images.
pub const MAX_IMAGE_BYTES: u64 = 2 * 1024 * 1024;
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// Lowercased extension of an uploaded file name, without the dot.
fn extension_of(original: &str) -> Option<String> {
    Path::new(original)
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase)
}

/// Stored name and format tag for the payload of `id`, e.g.
/// `("<id>.mp4", "mp4")`.
pub fn payload_file_name(id: &VideoId, original: &str) -> ServiceResult<(String, String)> {
    match extension_of(original) {
        Some(ext) if VIDEO_EXTENSIONS.contains(&ext.as_str()) => Ok((format!("{id}.{ext}"), ext)),
        _ => Err(ServiceError::InvalidInput(format!(
            "unsupported video format: {original}"
        ))),
    }
}

/// Stored name for an image upload: `<prefix>_<uuid>.<ext>`.
pub fn image_file_name(prefix: &str, original: &str) -> ServiceResult<String> {
    match extension_of(original) {
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => {
            Ok(format!("{prefix}_{}.{ext}", RecordId::new()))
        }
        _ => Err(ServiceError::InvalidInput(format!(
            "unsupported image format: {original}"
        ))),
    }
}

/// Whether `name` has the shape of a file this service stores:
/// `<uuid>.<video ext>`, `cover_<uuid>.<image ext>` or `thumb_<uuid>.<image ext>`.
pub fn is_stored_name(name: &str) -> bool {
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return false;
    };
    let (id, allowed): (&str, &[&str]) = match stem.split_once('_') {
        Some(("cover" | "thumb", id)) => (id, &IMAGE_EXTENSIONS[..]),
        Some(_) => return false,
        None => (stem, &VIDEO_EXTENSIONS[..]),
    };
    allowed.contains(&ext) && Uuid::parse_str(id).is_ok()
}

/// Caller-supplied metadata of an upload.
#[derive(Debug, Clone, Default)]
pub struct NewVideo {
    pub title: String,
    pub description: String,
    /// Defaults to `private` when absent or empty.
    pub status: Option<String>,
    pub tags: Vec<String>,
    pub duration: f64,
}

/// Files already written to the blob store for an upload.
#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub id: VideoId,
    pub file_name: String,
    pub format: String,
    pub file_size: u64,
    pub cover_file: Option<String>,
}

impl StoredUpload {
    fn files(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.file_name.as_str()).chain(self.cover_file.as_deref())
    }
}

/// Splits a comma-separated tag list, dropping blanks.
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Records an upload whose files are already stored. On any failure the
/// stored files are removed again.
pub fn create(
    db: &Database,
    blobs: &dyn BlobStore,
    owner: &str,
    details: NewVideo,
    upload: StoredUpload,
) -> ServiceResult<Video> {
    let result = insert_upload(db, owner, details, &upload);
    if let Err(err) = &result {
        warn!(video_id = %upload.id, error = %err, "upload rejected, removing stored files");
        remove_quietly(blobs, upload.files());
    }
    result
}

fn insert_upload(
    db: &Database,
    owner: &str,
    details: NewVideo,
    upload: &StoredUpload,
) -> ServiceResult<Video> {
    let status = match details.status.as_deref().map(str::trim) {
        None | Some("") => VideoStatus::Private,
        Some(value) => value.parse()?,
    };
    if !details.duration.is_finite() || details.duration < 0.0 {
        return Err(ServiceError::InvalidInput(format!(
            "invalid duration: {}",
            details.duration
        )));
    }
    let file_size = i64::try_from(upload.file_size)
        .map_err(|_| ServiceError::InvalidInput("file too large".into()))?;

    let now = Utc::now();
    let video = Video {
        id: upload.id,
        user_id: owner.to_owned(),
        title: details.title,
        description: details.description,
        file_name: upload.file_name.clone(),
        file_size,
        duration: details.duration,
        format: upload.format.clone(),
        status,
        tags: details.tags,
        cover_file: upload.cover_file.clone(),
        thumbnail_file: None,
        stats: VideoStats::default(),
        created_at: now,
        updated_at: now,
    };
    db.with_connection(|conn| store::insert_video(conn, &video))?;

    info!(video_id = %video.id, owner, file_size, "video uploaded");
    Ok(video)
}

fn remove_quietly<'a>(blobs: &dyn BlobStore, files: impl IntoIterator<Item = &'a str>) {
    for file in files {
        if let Err(err) = blobs.remove(file) {
            warn!(file, error = %err, "failed to remove stored file");
        }
    }
}

pub fn get(db: &Database, video_id: &VideoId) -> ServiceResult<Video> {
    db.with_connection(|conn| store::get_video(conn, video_id))
}

/// A video as seen by a particular viewer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoView {
    pub video: Video,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_favorite: Option<bool>,
}

fn ensure_visible(video: &Video, viewer: Option<&str>) -> ServiceResult<()> {
    if video.status != VideoStatus::Public && viewer != Some(video.user_id.as_str()) {
        return Err(ServiceError::Forbidden);
    }
    Ok(())
}

/// Loads a video the viewer is allowed to see. Non-public videos are
/// visible to their owner only.
pub fn get_visible(db: &Database, video_id: &VideoId, viewer: Option<&str>) -> ServiceResult<Video> {
    let video = get(db, video_id)?;
    ensure_visible(&video, viewer)?;
    Ok(video)
}

/// [`get_visible`] plus the viewer's favorite state.
pub fn view(db: &Database, video_id: &VideoId, viewer: Option<&str>) -> ServiceResult<VideoView> {
    let video = get_visible(db, video_id, viewer)?;
    let is_favorite = viewer
        .map(|user_id| favorites::is_favorited(db, user_id, video_id))
        .transpose()?;
    Ok(VideoView { video, is_favorite })
}

/// Body of a metadata update. Empty values leave the field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateVideo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl UpdateVideo {
    fn into_changes(self) -> ServiceResult<VideoChanges> {
        let non_empty = |value: Option<String>| value.filter(|value| !value.is_empty());
        Ok(VideoChanges {
            title: non_empty(self.title),
            description: non_empty(self.description),
            status: non_empty(self.status)
                .map(|status| status.parse::<VideoStatus>())
                .transpose()?,
            tags: self.tags.filter(|tags| !tags.is_empty()),
        })
    }
}

pub fn update(
    db: &Database,
    video_id: &VideoId,
    user_id: &str,
    request: UpdateVideo,
) -> ServiceResult<Video> {
    let changes = request.into_changes()?;
    db.transaction(|tx| {
        let video = store::get_video(tx, video_id)?;
        if video.user_id != user_id {
            return Err(ServiceError::Forbidden);
        }
        store::update_video(tx, video_id, &changes, Utc::now())?;
        store::get_video(tx, video_id)
    })
}

/// Points the video at a newly stored thumbnail. The new file is removed if
/// the update fails; the replaced one is removed once it succeeds.
pub fn replace_thumbnail(
    db: &Database,
    blobs: &dyn BlobStore,
    video_id: &VideoId,
    user_id: &str,
    file: &str,
) -> ServiceResult<Video> {
    let result = db.transaction(|tx| {
        let video = store::get_video(tx, video_id)?;
        if video.user_id != user_id {
            return Err(ServiceError::Forbidden);
        }
        store::set_thumbnail(tx, video_id, file, Utc::now())?;
        Ok((video.thumbnail_file, store::get_video(tx, video_id)?))
    });

    match result {
        Ok((previous, video)) => {
            remove_quietly(blobs, previous.as_deref());
            Ok(video)
        }
        Err(err) => {
            remove_quietly(blobs, [file]);
            Err(err)
        }
    }
}

/// Query string of the listing endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub keyword: Option<String>,
    pub status: Option<String>,
    /// Comma-separated; all must match.
    pub tags: Option<String>,
    /// Restricts the public listing to one uploader.
    pub user_id: Option<String>,
    /// `created_at`, `views`, `likes` or `file_size`; a leading `-` sorts
    /// descending.
    pub sort_by: Option<String>,
    /// `asc` or `desc`.
    pub sort_order: Option<String>,
}

impl ListParams {
    fn to_query(&self, owner: Option<String>, status: Option<VideoStatus>) -> ServiceResult<VideoQuery> {
        let mut descending = match self.sort_order.as_deref() {
            None | Some("") | Some("desc") => true,
            Some("asc") => false,
            Some(other) => {
                return Err(ServiceError::InvalidInput(format!("invalid sort order: {other}")));
            }
        };
        let sort = match self.sort_by.as_deref().filter(|value| !value.is_empty()) {
            None => SortField::CreatedAt,
            Some(value) => {
                let field = match value.strip_prefix('-') {
                    Some(field) => {
                        descending = true;
                        field
                    }
                    None => value,
                };
                SortField::parse(field).ok_or_else(|| {
                    ServiceError::InvalidInput(format!("invalid sort field: {value}"))
                })?
            }
        };

        Ok(VideoQuery {
            owner,
            status,
            keyword: self.keyword.clone(),
            tags: self.tags.as_deref().map(parse_tags).unwrap_or_default(),
            sort,
            descending,
            pagination: Pagination::new(self.page, self.page_size, DEFAULT_PAGE_SIZE),
        })
    }
}

/// The caller's own videos, any status unless filtered.
pub fn list_own(db: &Database, user_id: &str, params: &ListParams) -> ServiceResult<Page<Video>> {
    let status = params
        .status
        .as_deref()
        .filter(|value| !value.is_empty())
        .map(str::parse::<VideoStatus>)
        .transpose()?;
    let query = params.to_query(Some(user_id.to_owned()), status)?;
    db.with_connection(|conn| store::list_videos(conn, &query))
}

pub fn list_public(db: &Database, params: &ListParams) -> ServiceResult<Page<Video>> {
    let owner = params.user_id.clone().filter(|value| !value.is_empty());
    let query = params.to_query(owner, Some(VideoStatus::Public))?;
    db.with_connection(|conn| store::list_videos(conn, &query))
}

pub fn stats(db: &Database, video_id: &VideoId) -> ServiceResult<VideoStats> {
    Ok(get(db, video_id)?.stats)
}

/// Upserts the caller's watch-history entry for the video.
pub fn record_watch(db: &Database, user_id: &str, video_id: &VideoId) -> ServiceResult<WatchHistory> {
    db.transaction(|tx| {
        let video = store::get_video(tx, video_id)?;
        let entry = WatchHistory {
            user_id: user_id.to_owned(),
            video_id: video.id,
            video_title: video.title,
            cover_file: video.cover_file,
            video_duration: video.duration,
            progress: video.duration,
            watched_at: Utc::now(),
        };
        store::upsert_watch_history(tx, &entry)?;
        Ok(entry)
    })
}

pub fn watch_history(
    db: &Database,
    user_id: &str,
    pagination: Pagination,
) -> ServiceResult<Page<WatchHistory>> {
    db.with_connection(|conn| store::list_watch_history(conn, user_id, pagination))
}

pub fn add_comment(
    db: &Database,
    user_id: &str,
    video_id: &VideoId,
    content: &str,
) -> ServiceResult<Comment> {
    db.transaction(|tx| {
        store::get_video(tx, video_id)?;
        let comment = Comment {
            id: RecordId::new(),
            video_id: *video_id,
            user_id: user_id.to_owned(),
            content: content.to_owned(),
            created_at: Utc::now(),
        };
        store::insert_comment(tx, &comment)?;
        store::increment_stat(tx, video_id, store::StatField::Comments)?;
        Ok(comment)
    })
}
