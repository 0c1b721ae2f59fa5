//! Favorite ledger: at most one favorite per (user, video), and
//! `stats.likes` always equal to the number of favorites for the video.

use chrono::Utc;
use rusqlite::ErrorCode;
use tracing::{debug, info};

use crate::error::{ServiceError, ServiceResult};
use crate::model::{Favorite, Page, RecordId, VideoId};
use crate::store::{self, Database, Pagination, StatField};

/// Favorites `video_id` for `user_id` and bumps the like counter.
pub fn add(db: &Database, user_id: &str, video_id: &VideoId) -> ServiceResult<Favorite> {
    let favorite = db
        .transaction(|tx| {
            let video = store::get_video(tx, video_id)?;
            if store::favorite_exists(tx, user_id, video_id)? {
                return Err(ServiceError::AlreadyFavorited);
            }

            let favorite = Favorite {
                id: RecordId::new(),
                user_id: user_id.to_owned(),
                video_id: video.id,
                video_title: video.title,
                cover_file: video.cover_file,
                video_duration: video.duration,
                added_at: Utc::now(),
            };
            store::insert_favorite(tx, &favorite)?;
            store::increment_stat(tx, video_id, StatField::Likes)?;
            Ok(favorite)
        })
        .map_err(unique_violation_as_duplicate)?;

    info!(user_id, %video_id, "favorite added");
    Ok(favorite)
}

/// Removes the favorite and decrements likes while they are positive.
pub fn remove(db: &Database, user_id: &str, video_id: &VideoId) -> ServiceResult<()> {
    db.transaction(|tx| {
        if !store::delete_favorite(tx, user_id, video_id)? {
            return Err(ServiceError::FavoriteNotFound);
        }
        if !store::decrement_likes_if_positive(tx, video_id)? {
            debug!(%video_id, "likes already at zero, counter left unchanged");
        }
        Ok(())
    })?;

    info!(user_id, %video_id, "favorite removed");
    Ok(())
}

pub fn is_favorited(db: &Database, user_id: &str, video_id: &VideoId) -> ServiceResult<bool> {
    db.with_connection(|conn| store::favorite_exists(conn, user_id, video_id))
}

pub fn list(db: &Database, user_id: &str, pagination: Pagination) -> ServiceResult<Page<Favorite>> {
    db.with_connection(|conn| store::list_favorites(conn, user_id, pagination))
}

/// The unique `(user_id, video_id)` index is the last line against a
/// duplicate insert; surface it the same way as the explicit check.
fn unique_violation_as_duplicate(err: ServiceError) -> ServiceError {
    match err {
        ServiceError::Store(rusqlite::Error::SqliteFailure(failure, _))
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            ServiceError::AlreadyFavorited
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{insert, likes, open_temp, sample_video};
    use std::{sync::Barrier, thread};

    #[test]
    fn add_then_remove_moves_the_counter() {
        let (_dir, db) = open_temp();
        let video = sample_video("alice");
        insert(&db, &video);

        let favorite = add(&db, "bob", &video.id).unwrap();
        assert_eq!(favorite.video_title, video.title);
        assert_eq!(likes(&db, &video.id), 1);
        assert!(is_favorited(&db, "bob", &video.id).unwrap());

        remove(&db, "bob", &video.id).unwrap();
        assert_eq!(likes(&db, &video.id), 0);
        assert!(!is_favorited(&db, "bob", &video.id).unwrap());
    }

    #[test]
    fn second_add_is_rejected() {
        let (_dir, db) = open_temp();
        let video = sample_video("alice");
        insert(&db, &video);

        add(&db, "bob", &video.id).unwrap();
        let err = add(&db, "bob", &video.id).unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyFavorited));
        assert_eq!(likes(&db, &video.id), 1);
    }

    #[test]
    fn concurrent_adds_count_once() {
        let (_dir, db) = open_temp();
        let video = sample_video("alice");
        insert(&db, &video);

        let barrier = std::sync::Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                let barrier = barrier.clone();
                let video_id = video.id;
                thread::spawn(move || {
                    barrier.wait();
                    add(&db, "bob", &video_id)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let succeeded = results.iter().filter(|result| result.is_ok()).count();
        assert_eq!(succeeded, 1);
        assert!(
            results
                .iter()
                .filter_map(|result| result.as_ref().err())
                .all(|err| matches!(err, ServiceError::AlreadyFavorited))
        );
        assert_eq!(likes(&db, &video.id), 1);
        let live = db
            .with_connection(|conn| store::testing::count_favorites_for_video(conn, &video.id))
            .unwrap();
        assert_eq!(live, 1);
    }

    #[test]
    fn remove_at_zero_deletes_row_and_keeps_counter() {
        let (_dir, db) = open_temp();
        let video = sample_video("alice");
        insert(&db, &video);
        add(&db, "bob", &video.id).unwrap();

        db.with_connection(|conn| {
            conn.execute("UPDATE videos SET likes = 0 WHERE id = ?1", [&video.id])?;
            Ok(())
        })
        .unwrap();

        remove(&db, "bob", &video.id).unwrap();
        assert_eq!(likes(&db, &video.id), 0);
        assert!(!is_favorited(&db, "bob", &video.id).unwrap());
    }

    #[test]
    fn remove_without_favorite_is_not_found() {
        let (_dir, db) = open_temp();
        let video = sample_video("alice");
        insert(&db, &video);

        let err = remove(&db, "bob", &video.id).unwrap_err();
        assert!(matches!(err, ServiceError::FavoriteNotFound));
    }

    #[test]
    fn add_on_missing_video_is_not_found() {
        let (_dir, db) = open_temp();
        let err = add(&db, "bob", &VideoId::new()).unwrap_err();
        assert!(matches!(err, ServiceError::VideoNotFound(_)));
    }

    #[test]
    fn list_is_scoped_to_the_user() {
        let (_dir, db) = open_temp();
        let first = sample_video("alice");
        let second = sample_video("alice");
        insert(&db, &first);
        insert(&db, &second);
        add(&db, "bob", &first.id).unwrap();
        add(&db, "bob", &second.id).unwrap();
        add(&db, "carol", &first.id).unwrap();

        let page = list(&db, "bob", Pagination::new(None, None, 10)).unwrap();
        assert_eq!(page.total, 2);
        assert!(page.items.iter().all(|favorite| favorite.user_id == "bob"));
    }
}
