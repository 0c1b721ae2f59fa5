//! Cascading deletion of a video and everything that references it.
//!
//! Deletion happens in two phases. The first removes every dependent record
//! and the video row inside one transaction, so readers see either the whole
//! video graph or none of it. The second removes the stored files after
//! commit; a failure there leaves an orphaned file for the `sweep` binary to
//! collect and is never reported as an error.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::model::VideoId;
use crate::storage::BlobStore;
use crate::store::{self, Database, DependentCounts};

/// Outcome of a committed deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    #[serde(skip)]
    pub removed: DependentCounts,
    /// Stored files that could not be removed after commit.
    pub orphaned_files: Vec<String>,
}

pub fn delete_video(
    db: &Database,
    blobs: &dyn BlobStore,
    video_id: &VideoId,
    user_id: &str,
) -> ServiceResult<CleanupReport> {
    let files = db.transaction(|tx| {
        let video = store::get_video(tx, video_id)?;
        if video.user_id != user_id {
            return Err(ServiceError::Forbidden);
        }

        let removed = store::delete_dependents(tx, video_id)?;
        if !store::delete_video_row(tx, video_id)? {
            return Err(ServiceError::VideoNotFound(video_id.to_string()));
        }
        Ok((video.stored_files(), removed))
    });
    let (files, removed) = files?;

    info!(
        %video_id,
        favorites = removed.favorites,
        watch_history = removed.watch_history,
        comments = removed.comments,
        marks = removed.marks,
        annotations = removed.annotations,
        notes = removed.notes,
        "video deleted"
    );

    let mut orphaned_files = Vec::new();
    for file in files {
        if let Err(err) = blobs.remove(&file) {
            warn!(%video_id, file = %file, error = %err, "failed to remove stored file");
            orphaned_files.push(file);
        }
    }

    Ok(CleanupReport {
        removed,
        orphaned_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::favorites;
    use crate::model::{Annotation, Comment, Mark, Note, RecordId, WatchHistory};
    use crate::storage::LocalBlobStore;
    use crate::store::testing::{insert, open_temp, sample_video};
    use chrono::Utc;
    use std::{fs::File, io};

    struct FailingBlobs;

    impl BlobStore for FailingBlobs {
        fn open(&self, _: &str) -> io::Result<File> {
            Err(io::Error::other("unavailable"))
        }
        fn size(&self, _: &str) -> io::Result<u64> {
            Err(io::Error::other("unavailable"))
        }
        fn create(&self, _: &str) -> io::Result<File> {
            Err(io::Error::other("unavailable"))
        }
        fn remove(&self, _: &str) -> io::Result<()> {
            Err(io::Error::other("unavailable"))
        }
    }

    fn populate(db: &Database, video_id: VideoId) {
        favorites::add(db, "bob", &video_id).unwrap();
        db.with_connection(|conn| {
            let now = Utc::now();
            store::upsert_watch_history(
                conn,
                &WatchHistory {
                    user_id: "bob".into(),
                    video_id,
                    video_title: "t".into(),
                    cover_file: None,
                    video_duration: 60.0,
                    progress: 60.0,
                    watched_at: now,
                },
            )?;
            store::insert_comment(
                conn,
                &Comment {
                    id: RecordId::new(),
                    video_id,
                    user_id: "bob".into(),
                    content: "nice".into(),
                    created_at: now,
                },
            )?;
            let mark = Mark {
                id: RecordId::new(),
                user_id: "bob".into(),
                video_id,
                timestamp: 12.5,
                content: "here".into(),
                annotations: Vec::new(),
                created_at: now,
            };
            store::insert_mark(conn, &mark)?;
            store::insert_annotation(
                conn,
                &Annotation {
                    id: RecordId::new(),
                    user_id: "bob".into(),
                    mark_id: mark.id,
                    video_id,
                    content: "why".into(),
                    created_at: now,
                },
            )?;
            store::insert_note(
                conn,
                &Note {
                    id: RecordId::new(),
                    user_id: "bob".into(),
                    video_id,
                    timestamp: 3.0,
                    content: "remember".into(),
                    created_at: now,
                },
            )
        })
        .unwrap();
    }

    fn referencing(db: &Database, video_id: &VideoId) -> i64 {
        db.with_connection(|conn| {
            let mut total = 0;
            for table in [
                "favorites",
                "watch_history",
                "comments",
                "marks",
                "annotations",
                "notes",
            ] {
                total += store::testing::count_referencing(conn, table, video_id)?;
            }
            Ok(total)
        })
        .unwrap()
    }

    #[test]
    fn removes_every_dependent_and_the_files() {
        let (dir, db) = open_temp();
        let blobs = LocalBlobStore::new(dir.path().join("uploads")).unwrap();
        let mut video = sample_video("alice");
        video.cover_file = Some(format!("cover_{}.png", video.id));
        blobs.create(&video.file_name).unwrap();
        blobs.create(video.cover_file.as_deref().unwrap()).unwrap();
        insert(&db, &video);
        populate(&db, video.id);
        assert_eq!(referencing(&db, &video.id), 6);

        let report = delete_video(&db, &blobs, &video.id, "alice").unwrap();
        assert!(report.orphaned_files.is_empty());
        assert_eq!(report.removed.annotations, 1);
        assert_eq!(referencing(&db, &video.id), 0);
        assert!(blobs.file_names().unwrap().is_empty());

        let err = db
            .with_connection(|conn| store::get_video(conn, &video.id))
            .unwrap_err();
        assert!(matches!(err, ServiceError::VideoNotFound(_)));
    }

    #[test]
    fn file_failures_are_reported_not_raised() {
        let (_dir, db) = open_temp();
        let video = sample_video("alice");
        insert(&db, &video);
        populate(&db, video.id);

        let report = delete_video(&db, &FailingBlobs, &video.id, "alice").unwrap();
        assert_eq!(report.orphaned_files, vec![video.file_name.clone()]);
        assert_eq!(referencing(&db, &video.id), 0);
        assert!(db.with_connection(|conn| store::find_video(conn, &video.id)).unwrap().is_none());
    }

    #[test]
    fn annotations_of_the_videos_marks_go_too() {
        let (_dir, db) = open_temp();
        let video = sample_video("alice");
        insert(&db, &video);
        populate(&db, video.id);
        db.with_connection(|conn| {
            conn.execute("UPDATE annotations SET video_id = 'stale'", [])?;
            Ok(())
        })
        .unwrap();

        delete_video(&db, &FailingBlobs, &video.id, "alice").unwrap();
        let left: i64 = db
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM annotations", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(left, 0);
    }

    #[test]
    fn failure_mid_transaction_changes_nothing() {
        let (_dir, db) = open_temp();
        let video = sample_video("alice");
        insert(&db, &video);
        populate(&db, video.id);
        db.with_connection(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER block_notes BEFORE DELETE ON notes \
                 BEGIN SELECT RAISE(ABORT, 'notes are locked'); END;",
            )?;
            Ok(())
        })
        .unwrap();

        let err = delete_video(&db, &FailingBlobs, &video.id, "alice").unwrap_err();
        assert!(matches!(err, ServiceError::Store(_)));
        assert_eq!(referencing(&db, &video.id), 6);
        assert!(db.with_connection(|conn| store::find_video(conn, &video.id)).unwrap().is_some());
    }

    #[test]
    fn only_the_owner_may_delete() {
        let (_dir, db) = open_temp();
        let video = sample_video("alice");
        insert(&db, &video);

        let err = delete_video(&db, &FailingBlobs, &video.id, "mallory").unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden));
        assert!(db.with_connection(|conn| store::find_video(conn, &video.id)).unwrap().is_some());
    }

    #[test]
    fn missing_video_is_not_found() {
        let (_dir, db) = open_temp();
        let err = delete_video(&db, &FailingBlobs, &VideoId::new(), "alice").unwrap_err();
        assert!(matches!(err, ServiceError::VideoNotFound(_)));
    }
}
