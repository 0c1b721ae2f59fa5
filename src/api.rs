//! HTTP surface under `/api/v1`.
//!
//! Handlers are thin: they parse the request, run the service call on the
//! blocking pool and map [`ServiceError`] onto a status code. The caller's
//! identity comes from the `X-User-Id` header set by the upstream gateway.

use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State,
        multipart::{Field, MultipartError},
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use tokio::{io::AsyncWriteExt, task};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::batch::{self, BatchOutcome, BatchRequest};
use crate::cascade::{self, CleanupReport};
use crate::error::{ErrorKind, ServiceError, ServiceResult};
use crate::favorites;
use crate::marks::{self, TimelineEntry};
use crate::model::{
    Annotation, Comment, Favorite, Mark, Note, Page, RecordId, Video, VideoId, VideoStats, WatchHistory,
};
use crate::storage::BlobStore;
use crate::store::{Database, Pagination};
use crate::streaming;
use crate::videos::{
    self, DEFAULT_PAGE_SIZE, ListParams, MAX_IMAGE_BYTES, NewVideo, StoredUpload, UpdateVideo,
    VideoView,
};
use crate::views::ViewRecorder;

pub const USER_HEADER: &str = "x-user-id";
/// Room for the non-file form fields on top of the file size limits.
const FORM_OVERHEAD_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub blobs: Arc<dyn BlobStore>,
    pub views: ViewRecorder,
    pub max_upload_bytes: u64,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    content_range: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            content_range: None,
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        if let ServiceError::RangeNotSatisfiable { len } = err {
            return Self {
                status: StatusCode::RANGE_NOT_SATISFIABLE,
                message: err.to_string(),
                content_range: Some(format!("bytes */{len}")),
            };
        }

        let status = match err.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "request failed");
            return Self::internal("internal server error");
        }
        if let ServiceError::BlobMissing { source, .. } = &err {
            warn!(error = %err, cause = %source, "stored file missing");
        }
        Self::new(status, err.to_string())
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::new(err.status(), err.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(err: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, err.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(err: QueryRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, err.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        let mut response = (self.status, Json(body)).into_response();
        if let Some(value) = self
            .content_range
            .and_then(|value| HeaderValue::from_str(&value).ok())
        {
            response.headers_mut().insert(header::CONTENT_RANGE, value);
        }
        response
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn user_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

/// Authenticated caller; rejects with 401 when the header is absent.
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        user_from_headers(&parts.headers)
            .map(Self)
            .ok_or_else(|| ApiError::unauthorized("missing X-User-Id header"))
    }
}

/// Caller identity when one was forwarded.
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<String>);

impl<S> FromRequestParts<S> for MaybeUser
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(user_from_headers(&parts.headers)))
    }
}

pub fn router(state: AppState) -> Router {
    let upload_limit = usize::try_from(state.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(FORM_OVERHEAD_BYTES);
    let image_limit = MAX_IMAGE_BYTES as usize + FORM_OVERHEAD_BYTES;

    let api = Router::new()
        .route("/videos/public", get(list_public))
        .route(
            "/videos",
            get(list_own)
                .post(upload_video)
                .layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/videos/batch", post(batch_videos))
        .route(
            "/videos/{id}",
            get(get_video).put(update_video).delete(delete_video),
        )
        .route("/videos/{id}/stream", get(stream_video))
        .route("/videos/{id}/stats", get(video_stats))
        .route(
            "/videos/{id}/favorite",
            post(add_favorite).delete(remove_favorite),
        )
        .route("/videos/{id}/watch", post(record_watch))
        .route("/videos/{id}/comments", post(add_comment))
        .route(
            "/videos/{id}/thumbnail",
            post(upload_thumbnail).layer(DefaultBodyLimit::max(image_limit)),
        )
        .route("/users/me/favorites", get(list_favorites))
        .route("/users/me/watch-history", get(list_watch_history))
        .route("/marks", get(list_marks).post(add_mark))
        .route("/marks/{id}", delete(delete_mark))
        .route("/marks/{id}/annotations", post(add_annotation))
        .route("/marks/annotations/{id}", delete(delete_annotation))
        .route("/notes", get(list_notes).post(add_note))
        .route("/notes/{id}", delete(delete_note));

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Runs a store-bound service call on the blocking pool.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> ServiceResult<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|err| ApiError::internal(format!("blocking task failed: {err}")))?
        .map_err(ApiError::from)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageParams {
    page: Option<u32>,
    #[serde(alias = "size")]
    page_size: Option<u32>,
}

impl PageParams {
    fn pagination(&self) -> Pagination {
        Pagination::new(self.page, self.page_size, DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoParam {
    video_id: String,
}

#[derive(Debug, Deserialize)]
struct ContentBody {
    #[serde(default)]
    content: String,
}

// ---------------------------------------------------------------------------
// videos

async fn list_public(
    State(state): State<AppState>,
    query: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<Json<Page<Video>>> {
    let Query(params) = query?;
    let db = state.db.clone();
    blocking(move || videos::list_public(&db, &params))
        .await
        .map(Json)
}

async fn list_own(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    query: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<Json<Page<Video>>> {
    let Query(params) = query?;
    let db = state.db.clone();
    blocking(move || videos::list_own(&db, &user_id, &params))
        .await
        .map(Json)
}

async fn get_video(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    Path(id): Path<String>,
) -> ApiResult<Json<VideoView>> {
    let video_id: VideoId = id.parse()?;
    let db = state.db.clone();
    blocking(move || videos::view(&db, &video_id, viewer.as_deref()))
        .await
        .map(Json)
}

async fn update_video(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
    body: Result<Json<UpdateVideo>, JsonRejection>,
) -> ApiResult<Json<Video>> {
    let video_id: VideoId = id.parse()?;
    let Json(request) = body?;
    let db = state.db.clone();
    blocking(move || videos::update(&db, &video_id, &user_id, request))
        .await
        .map(Json)
}

async fn delete_video(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<CleanupReport>> {
    let video_id: VideoId = id.parse()?;
    let db = state.db.clone();
    let blobs = state.blobs.clone();
    blocking(move || cascade::delete_video(&db, &*blobs, &video_id, &user_id))
        .await
        .map(Json)
}

async fn batch_videos(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    body: Result<Json<BatchRequest>, JsonRejection>,
) -> ApiResult<Json<BatchOutcome>> {
    let Json(request) = body?;
    let db = state.db.clone();
    let blobs = state.blobs.clone();
    blocking(move || batch::execute(&db, &*blobs, &user_id, &request))
        .await
        .map(Json)
}

async fn stream_video(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let video_id: VideoId = id.parse()?;
    let db = state.db.clone();
    let video = blocking(move || videos::get_visible(&db, &video_id, viewer.as_deref())).await?;

    let range = headers
        .get(header::RANGE)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());
    let response =
        streaming::stream_video(state.blobs.clone(), &state.views, &video, range.as_deref())
            .await?;
    Ok(response)
}

async fn video_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<VideoStats>> {
    let video_id: VideoId = id.parse()?;
    let db = state.db.clone();
    blocking(move || videos::stats(&db, &video_id)).await.map(Json)
}

async fn record_watch(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<WatchHistory>> {
    let video_id: VideoId = id.parse()?;
    let db = state.db.clone();
    blocking(move || videos::record_watch(&db, &user_id, &video_id))
        .await
        .map(Json)
}

async fn add_comment(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
    body: Result<Json<ContentBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Comment>)> {
    let video_id: VideoId = id.parse()?;
    let Json(body) = body?;
    if body.content.trim().is_empty() {
        return Err(ServiceError::InvalidInput("comment must not be empty".into()).into());
    }
    let db = state.db.clone();
    let comment =
        blocking(move || videos::add_comment(&db, &user_id, &video_id, &body.content)).await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

// ---------------------------------------------------------------------------
// uploads

struct UploadForm {
    details: NewVideo,
    upload: StoredUpload,
}

async fn upload_video(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<Video>)> {
    let id = VideoId::new();
    let mut written = Vec::new();
    let form = match read_upload_form(&state, &id, &mut multipart, &mut written).await {
        Ok(form) => form,
        Err(err) => {
            discard(state.blobs.clone(), written).await;
            return Err(err);
        }
    };

    let db = state.db.clone();
    let blobs = state.blobs.clone();
    let video =
        blocking(move || videos::create(&db, &*blobs, &user_id, form.details, form.upload)).await?;
    Ok((StatusCode::CREATED, Json(video)))
}

/// Streams the form to storage. Every stored file name is pushed onto
/// `written` as soon as the file is complete.
async fn read_upload_form(
    state: &AppState,
    id: &VideoId,
    multipart: &mut Multipart,
    written: &mut Vec<String>,
) -> ApiResult<UploadForm> {
    let mut details = NewVideo::default();
    let mut payload: Option<(String, String, u64)> = None;
    let mut cover_file = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "file" => {
                if payload.is_some() {
                    return Err(ServiceError::InvalidInput("more than one file field".into()).into());
                }
                let original = field.file_name().unwrap_or_default().to_owned();
                let (file_name, format) = videos::payload_file_name(id, &original)?;
                let size =
                    write_field(state.blobs.clone(), &file_name, field, state.max_upload_bytes)
                        .await?;
                written.push(file_name.clone());
                payload = Some((file_name, format, size));
            }
            "cover" => {
                let original = field.file_name().unwrap_or_default().to_owned();
                if original.is_empty() || cover_file.is_some() {
                    continue;
                }
                let file_name = videos::image_file_name("cover", &original)?;
                write_field(state.blobs.clone(), &file_name, field, MAX_IMAGE_BYTES).await?;
                written.push(file_name.clone());
                cover_file = Some(file_name);
            }
            "title" => details.title = field.text().await?,
            "description" => details.description = field.text().await?,
            "status" => details.status = Some(field.text().await?),
            "tags" => details.tags = videos::parse_tags(&field.text().await?),
            "duration" => {
                let raw = field.text().await?;
                let raw = raw.trim();
                if !raw.is_empty() {
                    details.duration = raw.parse().map_err(|_| {
                        ServiceError::InvalidInput(format!("invalid duration: {raw}"))
                    })?;
                }
            }
            other => debug!(field = other, "ignoring unknown upload field"),
        }
    }

    let (file_name, format, file_size) =
        payload.ok_or_else(|| ServiceError::InvalidInput("missing file field".into()))?;
    Ok(UploadForm {
        details,
        upload: StoredUpload {
            id: *id,
            file_name,
            format,
            file_size,
            cover_file,
        },
    })
}

/// Copies one multipart field into a new stored file of at most `limit`
/// bytes. A partially written file is removed again on failure.
async fn write_field(
    blobs: Arc<dyn BlobStore>,
    name: &str,
    mut field: Field<'_>,
    limit: u64,
) -> ApiResult<u64> {
    let file = {
        let blobs = blobs.clone();
        let name = name.to_owned();
        blocking(move || Ok(blobs.create(&name)?)).await?
    };

    let result = copy_field(tokio::fs::File::from_std(file), &mut field, limit).await;
    if result.is_err() {
        discard(blobs, vec![name.to_owned()]).await;
    }
    result
}

async fn copy_field(
    mut file: tokio::fs::File,
    field: &mut Field<'_>,
    limit: u64,
) -> ApiResult<u64> {
    let mut size = 0u64;
    while let Some(chunk) = field.chunk().await? {
        size += chunk.len() as u64;
        if size > limit {
            return Err(ServiceError::InvalidInput(format!("file exceeds {limit} bytes")).into());
        }
        file.write_all(&chunk).await.map_err(ServiceError::from)?;
    }
    file.flush().await.map_err(ServiceError::from)?;
    Ok(size)
}

async fn discard(blobs: Arc<dyn BlobStore>, files: Vec<String>) {
    if files.is_empty() {
        return;
    }
    let outcome = task::spawn_blocking(move || {
        for file in files {
            if let Err(err) = blobs.remove(&file) {
                warn!(file = %file, error = %err, "failed to discard upload");
            }
        }
    })
    .await;
    if let Err(err) = outcome {
        warn!(error = %err, "discard task failed");
    }
}

async fn upload_thumbnail(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<Video>> {
    let video_id: VideoId = id.parse()?;

    let mut stored = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = videos::image_file_name("thumb", field.file_name().unwrap_or_default())?;
        write_field(state.blobs.clone(), &file_name, field, MAX_IMAGE_BYTES).await?;
        stored = Some(file_name);
        break;
    }
    let file_name =
        stored.ok_or_else(|| ServiceError::InvalidInput("missing file field".into()))?;

    let db = state.db.clone();
    let blobs = state.blobs.clone();
    blocking(move || videos::replace_thumbnail(&db, &*blobs, &video_id, &user_id, &file_name))
        .await
        .map(Json)
}

// ---------------------------------------------------------------------------
// favorites and history

async fn add_favorite(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Favorite>)> {
    let video_id: VideoId = id.parse()?;
    let db = state.db.clone();
    let favorite = blocking(move || favorites::add(&db, &user_id, &video_id)).await?;
    Ok((StatusCode::CREATED, Json(favorite)))
}

async fn remove_favorite(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let video_id: VideoId = id.parse()?;
    let db = state.db.clone();
    blocking(move || favorites::remove(&db, &user_id, &video_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_favorites(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    query: Result<Query<PageParams>, QueryRejection>,
) -> ApiResult<Json<Page<Favorite>>> {
    let Query(params) = query?;
    let db = state.db.clone();
    blocking(move || favorites::list(&db, &user_id, params.pagination()))
        .await
        .map(Json)
}

async fn list_watch_history(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    query: Result<Query<PageParams>, QueryRejection>,
) -> ApiResult<Json<Page<WatchHistory>>> {
    let Query(params) = query?;
    let db = state.db.clone();
    blocking(move || videos::watch_history(&db, &user_id, params.pagination()))
        .await
        .map(Json)
}

// ---------------------------------------------------------------------------
// marks and notes

async fn add_mark(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    body: Result<Json<TimelineEntry>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Mark>)> {
    let Json(entry) = body?;
    let db = state.db.clone();
    let mark = blocking(move || marks::add_mark(&db, &user_id, &entry)).await?;
    Ok((StatusCode::CREATED, Json(mark)))
}

async fn list_marks(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    query: Result<Query<VideoParam>, QueryRejection>,
) -> ApiResult<Json<Vec<Mark>>> {
    let Query(params) = query?;
    let video_id: VideoId = params.video_id.parse()?;
    let db = state.db.clone();
    blocking(move || marks::list_marks(&db, &user_id, &video_id))
        .await
        .map(Json)
}

async fn delete_mark(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let mark_id: RecordId = id.parse()?;
    let db = state.db.clone();
    blocking(move || marks::delete_mark(&db, &user_id, &mark_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_annotation(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
    body: Result<Json<ContentBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Annotation>)> {
    let mark_id: RecordId = id.parse()?;
    let Json(body) = body?;
    let db = state.db.clone();
    let annotation =
        blocking(move || marks::add_annotation(&db, &user_id, &mark_id, &body.content)).await?;
    Ok((StatusCode::CREATED, Json(annotation)))
}

async fn delete_annotation(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let annotation_id: RecordId = id.parse()?;
    let db = state.db.clone();
    blocking(move || marks::delete_annotation(&db, &user_id, &annotation_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_note(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    body: Result<Json<TimelineEntry>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Note>)> {
    let Json(entry) = body?;
    let db = state.db.clone();
    let note = blocking(move || marks::add_note(&db, &user_id, &entry)).await?;
    Ok((StatusCode::CREATED, Json(note)))
}

async fn list_notes(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    query: Result<Query<VideoParam>, QueryRejection>,
) -> ApiResult<Json<Vec<Note>>> {
    let Query(params) = query?;
    let video_id: VideoId = params.video_id.parse()?;
    let db = state.db.clone();
    blocking(move || marks::list_notes(&db, &user_id, &video_id))
        .await
        .map(Json)
}

async fn delete_note(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let note_id: RecordId = id.parse()?;
    let db = state.db.clone();
    blocking(move || marks::delete_note(&db, &user_id, &note_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
