//! Full and partial-content responses for stored video payloads.

use std::{io::SeekFrom, sync::Arc};

use axum::{
    body::Body,
    http::{StatusCode, header},
    response::Response,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::error::{ServiceError, ServiceResult};
use crate::model::Video;
use crate::range::{self, RangeRequest};
use crate::storage::BlobStore;
use crate::views::ViewRecorder;

/// Builds the response for `video`, honoring an optional raw `Range` header.
///
/// The payload length is taken from the open file handle, not from the
/// video record. A satisfiable request queues one view increment on
/// `views`; a rejected range returns [`ServiceError::RangeNotSatisfiable`]
/// before any byte is sent.
pub async fn stream_video(
    blobs: Arc<dyn BlobStore>,
    views: &ViewRecorder,
    video: &Video,
    range_header: Option<&str>,
) -> ServiceResult<Response> {
    let (file, len) = open_payload(blobs, video).await?;
    let request = range::resolve(range_header, len)?;

    let mut file = tokio::fs::File::from_std(file);
    let (status, content_range, length) = match request {
        RangeRequest::Full => (StatusCode::OK, None, len),
        RangeRequest::Partial(range) => {
            file.seek(SeekFrom::Start(range.start)).await?;
            (
                StatusCode::PARTIAL_CONTENT,
                Some(range.content_range(len)),
                range.length(),
            )
        }
    };

    let mime = mime_guess::from_ext(&video.format).first_or_octet_stream();
    let mut builder = Response::builder()
        .status(status)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(header::CONTENT_LENGTH, length);
    if let Some(value) = content_range {
        builder = builder.header(header::CONTENT_RANGE, value);
    }

    let body = Body::from_stream(ReaderStream::new(file.take(length)));
    let response = builder
        .body(body)
        .map_err(|err| ServiceError::Internal(format!("building stream response: {err}")))?;

    views.record(video.id);
    Ok(response)
}

/// Opens the primary file of `video` and stats it. Either failure is
/// reported as [`ServiceError::BlobMissing`].
async fn open_payload(
    blobs: Arc<dyn BlobStore>,
    video: &Video,
) -> ServiceResult<(std::fs::File, u64)> {
    let file_name = video.file_name.clone();
    let opened = tokio::task::spawn_blocking(move || {
        let file = blobs.open(&file_name)?;
        let len = file.metadata()?.len();
        Ok::<_, std::io::Error>((file, len))
    })
    .await
    .map_err(|err| ServiceError::Internal(format!("opening payload: {err}")))?;

    opened.map_err(|source| ServiceError::BlobMissing {
        video_id: video.id.to_string(),
        file: video.file_name.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBlobStore;
    use crate::store::{self, Database};
    use crate::store::testing::{insert, open_temp, sample_video};
    use std::{io::Write, time::Duration};

    fn payload() -> Vec<u8> {
        (0..1000u32).map(|i| (i % 251) as u8).collect()
    }

    fn blobs_with(video: &Video, dir: &std::path::Path) -> Arc<dyn BlobStore> {
        let store = LocalBlobStore::new(dir).unwrap();
        let mut file = store.create(&video.file_name).unwrap();
        file.write_all(&payload()).unwrap();
        Arc::new(store)
    }

    async fn stored_views(db: &Database, video: &Video) -> i64 {
        let db = db.clone();
        let id = video.id;
        tokio::task::spawn_blocking(move || db.with_connection(|conn| store::get_video(conn, &id)))
            .await
            .unwrap()
            .unwrap()
            .stats
            .views
    }

    /// Polls until at least one view has been applied and returns the count.
    async fn first_views(db: &Database, video: &Video) -> i64 {
        for _ in 0..100 {
            let seen = stored_views(db, video).await;
            if seen > 0 {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        0
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn range_request_returns_exact_slice() {
        let (dir, db) = open_temp();
        let video = sample_video("alice");
        let blobs = blobs_with(&video, &dir.path().join("uploads"));
        let views = ViewRecorder::spawn(db, 4);

        let response = stream_video(blobs, &views, &video, Some("bytes=200-299"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 200-299/1000");
        assert_eq!(headers[header::CONTENT_LENGTH], "100");
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
        assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(body_bytes(response).await, payload()[200..300].to_vec());
    }

    #[tokio::test]
    async fn no_range_returns_whole_file() {
        let (dir, db) = open_temp();
        let video = sample_video("alice");
        let blobs = blobs_with(&video, &dir.path().join("uploads"));
        let views = ViewRecorder::spawn(db, 4);

        let response = stream_video(blobs, &views, &video, None).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "1000");
        assert!(response.headers().get(header::CONTENT_RANGE).is_none());
        assert_eq!(body_bytes(response).await, payload());
    }

    #[tokio::test]
    async fn length_comes_from_the_file_not_the_record() {
        let (dir, db) = open_temp();
        let mut video = sample_video("alice");
        video.file_size = 5;
        let blobs = blobs_with(&video, &dir.path().join("uploads"));
        let views = ViewRecorder::spawn(db, 4);

        let response = stream_video(blobs, &views, &video, Some("bytes=-10"))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 990-999/1000");
    }

    #[tokio::test]
    async fn unsatisfiable_range_reports_payload_length() {
        let (dir, db) = open_temp();
        let video = sample_video("alice");
        let blobs = blobs_with(&video, &dir.path().join("uploads"));
        let views = ViewRecorder::spawn(db, 4);

        let err = stream_video(blobs, &views, &video, Some("bytes=1000-"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::RangeNotSatisfiable { len: 1000 }));
    }

    #[tokio::test]
    async fn missing_payload_is_blob_missing() {
        let (dir, db) = open_temp();
        let video = sample_video("alice");
        let blobs: Arc<dyn BlobStore> =
            Arc::new(LocalBlobStore::new(dir.path().join("empty")).unwrap());
        let views = ViewRecorder::spawn(db, 4);

        let err = stream_video(blobs, &views, &video, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::BlobMissing { .. }));
    }

    #[tokio::test]
    async fn successful_stream_counts_one_view() {
        let (dir, db) = open_temp();
        let video = sample_video("alice");
        insert(&db, &video);
        let blobs = blobs_with(&video, &dir.path().join("uploads"));
        let views = ViewRecorder::spawn(db.clone(), 4);

        let response = stream_video(blobs, &views, &video, Some("bytes=0-99"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);

        assert_eq!(first_views(&db, &video).await, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stored_views(&db, &video).await, 1);
    }

    #[tokio::test]
    async fn rejected_streams_are_not_counted() {
        let (dir, db) = open_temp();
        let video = sample_video("alice");
        insert(&db, &video);
        let blobs = blobs_with(&video, &dir.path().join("uploads"));
        let empty: Arc<dyn BlobStore> =
            Arc::new(LocalBlobStore::new(dir.path().join("empty")).unwrap());
        let views = ViewRecorder::spawn(db.clone(), 4);

        let err = stream_video(blobs.clone(), &views, &video, Some("bytes=5000-"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::RangeNotSatisfiable { .. }));
        let err = stream_video(empty, &views, &video, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::BlobMissing { .. }));

        // The queue is FIFO, so anything the failures had queued would be
        // applied before this one.
        stream_video(blobs, &views, &video, None).await.unwrap();
        assert_eq!(first_views(&db, &video).await, 1);
    }
}
