//! Bulk actions over a list of video ids.
//!
//! Items are independent: each is checked and applied on its own, and a
//! failure is counted without undoing earlier successes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cascade;
use crate::error::{ServiceError, ServiceResult};
use crate::model::{VideoId, VideoStatus};
use crate::storage::BlobStore;
use crate::store::{self, Database};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAction {
    Delete,
    UpdateStatus,
}

impl BatchAction {
    pub fn parse(value: &str) -> ServiceResult<Self> {
        match value {
            "delete" => Ok(Self::Delete),
            "update_status" | "updateStatus" => Ok(Self::UpdateStatus),
            other => Err(ServiceError::UnsupportedAction(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    #[serde(alias = "videoIds")]
    pub ids: Vec<String>,
    pub action: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub success_count: usize,
    pub failed_count: usize,
    pub failed_ids: Vec<String>,
}

impl BatchOutcome {
    fn record(&mut self, id: &str, result: ServiceResult<()>) {
        match result {
            Ok(()) => self.success_count += 1,
            Err(err) => {
                debug!(id, error = %err, "batch item failed");
                self.failed_count += 1;
                self.failed_ids.push(id.to_owned());
            }
        }
    }
}

/// Runs `request` for `user_id`. Only an unknown action fails the call as a
/// whole, and it does so before any item is touched.
pub fn execute(
    db: &Database,
    blobs: &dyn BlobStore,
    user_id: &str,
    request: &BatchRequest,
) -> ServiceResult<BatchOutcome> {
    let action = BatchAction::parse(&request.action)?;

    let mut outcome = BatchOutcome::default();
    for raw_id in &request.ids {
        let result = raw_id.parse::<VideoId>().and_then(|video_id| match action {
            BatchAction::Delete => {
                cascade::delete_video(db, blobs, &video_id, user_id).map(|_| ())
            }
            BatchAction::UpdateStatus => {
                update_status(db, &video_id, user_id, request.status.as_deref())
            }
        });
        outcome.record(raw_id, result);
    }

    info!(
        user_id,
        action = ?action,
        succeeded = outcome.success_count,
        failed = outcome.failed_count,
        "batch finished"
    );
    Ok(outcome)
}

fn update_status(
    db: &Database,
    video_id: &VideoId,
    user_id: &str,
    status: Option<&str>,
) -> ServiceResult<()> {
    let status: VideoStatus = status
        .ok_or_else(|| ServiceError::InvalidStatus(String::new()))?
        .parse()?;

    db.transaction(|tx| {
        let video = store::get_video(tx, video_id)?;
        if video.user_id != user_id {
            return Err(ServiceError::Forbidden);
        }
        store::set_video_status(tx, video_id, status, Utc::now())?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBlobStore;
    use crate::store::testing::{insert, open_temp, sample_video};

    fn request(ids: &[String], action: &str, status: Option<&str>) -> BatchRequest {
        BatchRequest {
            ids: ids.to_vec(),
            action: action.into(),
            status: status.map(str::to_owned),
        }
    }

    #[test]
    fn foreign_video_is_a_per_item_failure() {
        let (dir, db) = open_temp();
        let blobs = LocalBlobStore::new(dir.path().join("uploads")).unwrap();
        let own = sample_video("alice");
        let foreign = sample_video("bob");
        insert(&db, &own);
        insert(&db, &foreign);

        let ids = [own.id.to_string(), foreign.id.to_string()];
        let outcome = execute(&db, &blobs, "alice", &request(&ids, "delete", None)).unwrap();

        assert_eq!(
            outcome,
            BatchOutcome {
                success_count: 1,
                failed_count: 1,
                failed_ids: vec![foreign.id.to_string()],
            }
        );
        assert!(db.with_connection(|c| store::find_video(c, &own.id)).unwrap().is_none());
        assert!(db.with_connection(|c| store::find_video(c, &foreign.id)).unwrap().is_some());
    }

    #[test]
    fn unknown_action_touches_nothing() {
        let (dir, db) = open_temp();
        let blobs = LocalBlobStore::new(dir.path().join("uploads")).unwrap();
        let own = sample_video("alice");
        insert(&db, &own);

        let err = execute(&db, &blobs, "alice", &request(&[own.id.to_string()], "archive", None))
            .unwrap_err();
        assert!(matches!(err, ServiceError::UnsupportedAction(action) if action == "archive"));
        assert!(db.with_connection(|c| store::find_video(c, &own.id)).unwrap().is_some());
    }

    #[test]
    fn status_update_validates_per_item() {
        let (dir, db) = open_temp();
        let blobs = LocalBlobStore::new(dir.path().join("uploads")).unwrap();
        let own = sample_video("alice");
        insert(&db, &own);
        let ids = [own.id.to_string(), "not-a-uuid".to_string()];

        let outcome = execute(
            &db,
            &blobs,
            "alice",
            &request(&ids, "update_status", Some("draft")),
        )
        .unwrap();
        assert_eq!(outcome.success_count, 1);
        assert_eq!(outcome.failed_ids, vec!["not-a-uuid".to_string()]);
        let video = db.with_connection(|c| store::get_video(c, &own.id)).unwrap();
        assert_eq!(video.status, VideoStatus::Draft);

        let outcome = execute(
            &db,
            &blobs,
            "alice",
            &request(&ids[..1], "update_status", Some("archived")),
        )
        .unwrap();
        assert_eq!(outcome.failed_count, 1);
        let video = db.with_connection(|c| store::get_video(c, &own.id)).unwrap();
        assert_eq!(video.status, VideoStatus::Draft);
    }

    #[test]
    fn request_accepts_camel_case_body() {
        let request: BatchRequest = serde_json::from_str(
            r#"{"videoIds": ["a"], "action": "update_status", "status": "public"}"#,
        )
        .unwrap();
        assert_eq!(request.ids, vec!["a".to_string()]);
        assert_eq!(request.status.as_deref(), Some("public"));
    }
}
