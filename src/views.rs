//! Background queue for view-count increments.
//!
//! Streaming handlers hand a video id to [`ViewRecorder::record`] and move on.
//! A single consumer task applies the increments. Delivery is at most once:
//! a full queue drops the increment, and anything still queued when the
//! process stops is lost.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::model::VideoId;
use crate::store::{self, Database, StatField};

#[derive(Debug, Clone)]
pub struct ViewRecorder {
    tx: mpsc::Sender<VideoId>,
}

impl ViewRecorder {
    /// Spawns the consumer task on the current tokio runtime.
    pub fn spawn(database: Database, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<VideoId>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(video_id) = rx.recv().await {
                let db = database.clone();
                let result = tokio::task::spawn_blocking(move || {
                    db.with_connection(|conn| {
                        store::increment_stat(conn, &video_id, StatField::Views)
                    })
                })
                .await;

                match result {
                    Ok(Ok(true)) => {}
                    Ok(Ok(false)) => debug!(%video_id, "view increment for a deleted video"),
                    Ok(Err(err)) => warn!(%video_id, error = %err, "failed to record view"),
                    Err(err) => warn!(%video_id, error = %err, "view increment task failed"),
                }
            }
        });

        Self { tx }
    }

    /// Queues one view. Never blocks and never fails the caller.
    pub fn record(&self, video_id: VideoId) {
        if let Err(err) = self.tx.try_send(video_id) {
            warn!(%video_id, error = %err, "dropping view increment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{insert, open_temp, sample_video};
    use std::time::Duration;

    async fn views(db: &Database, id: VideoId) -> i64 {
        let db = db.clone();
        tokio::task::spawn_blocking(move || db.with_connection(|conn| store::get_video(conn, &id)))
            .await
            .unwrap()
            .unwrap()
            .stats
            .views
    }

    #[tokio::test]
    async fn queued_views_are_applied_in_the_background() {
        let (_dir, db) = open_temp();
        let video = sample_video("alice");
        insert(&db, &video);

        let recorder = ViewRecorder::spawn(db.clone(), 16);
        recorder.record(video.id);
        recorder.record(video.id);

        let mut seen = 0;
        for _ in 0..100 {
            seen = views(&db, video.id).await;
            if seen == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seen, 2);
    }

    #[tokio::test]
    async fn unknown_video_does_not_stop_the_consumer() {
        let (_dir, db) = open_temp();
        let video = sample_video("alice");
        insert(&db, &video);

        let recorder = ViewRecorder::spawn(db.clone(), 16);
        recorder.record(VideoId::new());
        recorder.record(video.id);

        let mut seen = 0;
        for _ in 0..100 {
            seen = views(&db, video.id).await;
            if seen == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seen, 1);
    }
}
