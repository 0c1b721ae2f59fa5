//! Per-user marks, annotations and notes on a video timeline.
//!
//! Every insert checks its parent inside the same transaction, so a record
//! can never be attached to a video that a concurrent cascade just removed.

use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use crate::error::{ServiceError, ServiceResult};
use crate::model::{Annotation, Mark, Note, RecordId, VideoId};
use crate::store::{self, Database};

/// Body for creating a mark or a note.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub video_id: VideoId,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub content: String,
}

impl TimelineEntry {
    fn validate(&self) -> ServiceResult<()> {
        if !self.timestamp.is_finite() || self.timestamp < 0.0 {
            return Err(ServiceError::InvalidInput(format!(
                "invalid timestamp: {}",
                self.timestamp
            )));
        }
        Ok(())
    }
}

pub fn add_mark(db: &Database, user_id: &str, entry: &TimelineEntry) -> ServiceResult<Mark> {
    entry.validate()?;
    let mark = db.transaction(|tx| {
        store::get_video(tx, &entry.video_id)?;
        let mark = Mark {
            id: RecordId::new(),
            user_id: user_id.to_owned(),
            video_id: entry.video_id,
            timestamp: entry.timestamp,
            content: entry.content.clone(),
            annotations: Vec::new(),
            created_at: Utc::now(),
        };
        store::insert_mark(tx, &mark)?;
        Ok(mark)
    })?;
    info!(mark_id = %mark.id, video_id = %mark.video_id, "mark added");
    Ok(mark)
}

/// The caller's marks on `video_id`, ordered by position, with annotations.
pub fn list_marks(db: &Database, user_id: &str, video_id: &VideoId) -> ServiceResult<Vec<Mark>> {
    db.with_connection(|conn| store::list_marks(conn, user_id, video_id))
}

/// Deletes one of the caller's marks together with its annotations.
pub fn delete_mark(db: &Database, user_id: &str, mark_id: &RecordId) -> ServiceResult<()> {
    let annotations = db.transaction(|tx| {
        let mark = owned_mark(tx, user_id, mark_id)?;
        store::delete_mark(tx, &mark.id)
    })?;
    info!(%mark_id, annotations, "mark deleted");
    Ok(())
}

/// Annotates one of the caller's marks; the annotation takes the mark's video.
pub fn add_annotation(
    db: &Database,
    user_id: &str,
    mark_id: &RecordId,
    content: &str,
) -> ServiceResult<Annotation> {
    db.transaction(|tx| {
        let mark = owned_mark(tx, user_id, mark_id)?;
        let annotation = Annotation {
            id: RecordId::new(),
            user_id: user_id.to_owned(),
            mark_id: mark.id,
            video_id: mark.video_id,
            content: content.to_owned(),
            created_at: Utc::now(),
        };
        store::insert_annotation(tx, &annotation)?;
        Ok(annotation)
    })
}

pub fn delete_annotation(db: &Database, user_id: &str, annotation_id: &RecordId) -> ServiceResult<()> {
    db.transaction(|tx| {
        let owner = store::annotation_owner(tx, annotation_id)?
            .ok_or_else(|| ServiceError::AnnotationNotFound(annotation_id.to_string()))?;
        if owner != user_id {
            return Err(ServiceError::Forbidden);
        }
        store::delete_annotation(tx, annotation_id)?;
        Ok(())
    })?;
    info!(%annotation_id, "annotation deleted");
    Ok(())
}

fn owned_mark(conn: &rusqlite::Connection, user_id: &str, mark_id: &RecordId) -> ServiceResult<Mark> {
    let mark = store::find_mark(conn, mark_id)?
        .ok_or_else(|| ServiceError::MarkNotFound(mark_id.to_string()))?;
    if mark.user_id != user_id {
        return Err(ServiceError::Forbidden);
    }
    Ok(mark)
}

pub fn add_note(db: &Database, user_id: &str, entry: &TimelineEntry) -> ServiceResult<Note> {
    entry.validate()?;
    db.transaction(|tx| {
        store::get_video(tx, &entry.video_id)?;
        let note = Note {
            id: RecordId::new(),
            user_id: user_id.to_owned(),
            video_id: entry.video_id,
            timestamp: entry.timestamp,
            content: entry.content.clone(),
            created_at: Utc::now(),
        };
        store::insert_note(tx, &note)?;
        Ok(note)
    })
}

pub fn list_notes(db: &Database, user_id: &str, video_id: &VideoId) -> ServiceResult<Vec<Note>> {
    db.with_connection(|conn| store::list_notes(conn, user_id, video_id))
}

pub fn delete_note(db: &Database, user_id: &str, note_id: &RecordId) -> ServiceResult<()> {
    db.transaction(|tx| {
        let owner = store::note_owner(tx, note_id)?
            .ok_or_else(|| ServiceError::NoteNotFound(note_id.to_string()))?;
        if owner != user_id {
            return Err(ServiceError::Forbidden);
        }
        store::delete_note(tx, note_id)?;
        Ok(())
    })?;
    info!(%note_id, "note deleted");
    Ok(())
}
