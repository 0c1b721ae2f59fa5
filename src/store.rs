//! Document store backed by SQLite.
//!
//! Each collection is a table; documents are rows with typed columns plus a
//! JSON column for the tag list. There are no foreign keys; cross-collection
//! consistency belongs to the services that open a [`Database::transaction`].

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use rusqlite::{
    Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params,
    params_from_iter, types::Value,
};

use crate::error::{ServiceError, ServiceResult};
use crate::model::{
    Annotation, Comment, Favorite, Mark, Note, Page, RecordId, Video, VideoId, VideoStats,
    VideoStatus, WatchHistory,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_PAGE_SIZE: u32 = 50;

/// Cloneable handle on the store. Every call opens a short-lived connection so
/// no two requests ever share one.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    /// Opens (and if necessary creates) the database file and its schema.
    pub fn open(path: impl AsRef<Path>) -> ServiceResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Self { path };
        let mut conn = db.connect()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        ensure_tables(&mut conn)?;
        Ok(db)
    }

    fn connect(&self) -> ServiceResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Runs `f` against a dedicated connection outside of any transaction.
    pub fn with_connection<T, F>(&self, f: F) -> ServiceResult<T>
    where
        F: FnOnce(&Connection) -> ServiceResult<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    /// Runs `f` inside a `BEGIN IMMEDIATE` transaction. The write lock is taken
    /// up front, so reads made inside `f` cannot be invalidated by a concurrent
    /// writer before commit. Any error rolls the whole unit back.
    pub fn transaction<T, F>(&self, f: F) -> ServiceResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> ServiceResult<T>,
    {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

fn ensure_tables(conn: &mut Connection) -> ServiceResult<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            file_name TEXT NOT NULL,
            file_size INTEGER NOT NULL DEFAULT 0,
            duration REAL NOT NULL DEFAULT 0,
            format TEXT NOT NULL,
            status TEXT NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '[]',
            cover_file TEXT,
            thumbnail_file TEXT,
            views INTEGER NOT NULL DEFAULT 0 CHECK (views >= 0),
            likes INTEGER NOT NULL DEFAULT 0 CHECK (likes >= 0),
            comments INTEGER NOT NULL DEFAULT 0 CHECK (comments >= 0),
            shares INTEGER NOT NULL DEFAULT 0 CHECK (shares >= 0),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_videos_user ON videos(user_id);
        CREATE INDEX IF NOT EXISTS idx_videos_status ON videos(status);

        CREATE TABLE IF NOT EXISTS favorites (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            video_id TEXT NOT NULL,
            video_title TEXT NOT NULL DEFAULT '',
            cover_file TEXT,
            video_duration REAL NOT NULL DEFAULT 0,
            added_at TEXT NOT NULL,
            UNIQUE (user_id, video_id)
        );
        CREATE INDEX IF NOT EXISTS idx_favorites_video ON favorites(video_id);

        CREATE TABLE IF NOT EXISTS watch_history (
            user_id TEXT NOT NULL,
            video_id TEXT NOT NULL,
            video_title TEXT NOT NULL DEFAULT '',
            cover_file TEXT,
            video_duration REAL NOT NULL DEFAULT 0,
            progress REAL NOT NULL DEFAULT 0,
            watched_at TEXT NOT NULL,
            PRIMARY KEY (user_id, video_id)
        );
        CREATE INDEX IF NOT EXISTS idx_watch_history_video ON watch_history(video_id);

        CREATE TABLE IF NOT EXISTS comments (
            id TEXT PRIMARY KEY,
            video_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_comments_video ON comments(video_id);

        CREATE TABLE IF NOT EXISTS marks (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            video_id TEXT NOT NULL,
            timestamp REAL NOT NULL DEFAULT 0,
            content TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_marks_video ON marks(video_id);
        CREATE INDEX IF NOT EXISTS idx_marks_user_video ON marks(user_id, video_id);

        CREATE TABLE IF NOT EXISTS annotations (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            mark_id TEXT NOT NULL,
            video_id TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_annotations_mark ON annotations(mark_id);
        CREATE INDEX IF NOT EXISTS idx_annotations_video ON annotations(video_id);

        CREATE TABLE IF NOT EXISTS notes (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            video_id TEXT NOT NULL,
            timestamp REAL NOT NULL DEFAULT 0,
            content TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_notes_video ON notes(video_id);
        "#,
    )?;

    tx.commit()?;
    Ok(())
}

/// Normalized page/size pair; `page` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Pagination {
    pub fn new(page: Option<u32>, page_size: Option<u32>, default_size: u32) -> Self {
        let page = page.filter(|page| *page >= 1).unwrap_or(1);
        let page_size = match page_size {
            None | Some(0) => default_size,
            Some(size) => size.min(MAX_PAGE_SIZE),
        };
        Self { page, page_size }
    }

    fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.page_size)
    }

    fn into_page<T>(self, total: i64, items: Vec<T>) -> Page<T> {
        Page {
            total,
            page: self.page,
            page_size: self.page_size,
            items,
        }
    }
}

/// Counters that can be bumped with `$inc` semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatField {
    Views,
    Likes,
    Comments,
    Shares,
}

impl StatField {
    fn column(self) -> &'static str {
        match self {
            Self::Views => "views",
            Self::Likes => "likes",
            Self::Comments => "comments",
            Self::Shares => "shares",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    CreatedAt,
    Views,
    Likes,
    FileSize,
}

impl SortField {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created_at" | "createdAt" => Some(Self::CreatedAt),
            "views" => Some(Self::Views),
            "likes" => Some(Self::Likes),
            "file_size" | "fileSize" => Some(Self::FileSize),
            _ => None,
        }
    }

    fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::Views => "views",
            Self::Likes => "likes",
            Self::FileSize => "file_size",
        }
    }
}

/// Filter for video listings.
#[derive(Debug, Clone)]
pub struct VideoQuery {
    pub owner: Option<String>,
    pub status: Option<VideoStatus>,
    pub keyword: Option<String>,
    /// Every listed tag must be present on the video.
    pub tags: Vec<String>,
    pub sort: SortField,
    pub descending: bool,
    pub pagination: Pagination,
}

impl Default for VideoQuery {
    fn default() -> Self {
        Self {
            owner: None,
            status: None,
            keyword: None,
            tags: Vec::new(),
            sort: SortField::CreatedAt,
            descending: true,
            pagination: Pagination::new(None, None, 10),
        }
    }
}

/// Metadata fields an owner may change; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct VideoChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<VideoStatus>,
    pub tags: Option<Vec<String>>,
}

/// Number of dependent documents removed by [`delete_dependents`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DependentCounts {
    pub favorites: usize,
    pub watch_history: usize,
    pub comments: usize,
    pub marks: usize,
    pub annotations: usize,
    pub notes: usize,
}

const VIDEO_COLUMNS: &str = "id, user_id, title, description, file_name, file_size, duration, \
     format, status, tags_json, cover_file, thumbnail_file, views, likes, comments, shares, \
     created_at, updated_at";

// ---------------------------------------------------------------------------
// videos

pub fn insert_video(conn: &Connection, video: &Video) -> ServiceResult<()> {
    let tags_json = serde_json::to_string(&video.tags)?;
    conn.execute(
        r#"
        INSERT INTO videos (
            id, user_id, title, description, file_name, file_size, duration,
            format, status, tags_json, cover_file, thumbnail_file,
            views, likes, comments, shares, created_at, updated_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18
        )
        "#,
        params![
            video.id,
            video.user_id,
            video.title,
            video.description,
            video.file_name,
            video.file_size,
            video.duration,
            video.format,
            video.status,
            tags_json,
            video.cover_file,
            video.thumbnail_file,
            video.stats.views,
            video.stats.likes,
            video.stats.comments,
            video.stats.shares,
            video.created_at,
            video.updated_at,
        ],
    )?;
    Ok(())
}

pub fn find_video(conn: &Connection, id: &VideoId) -> ServiceResult<Option<Video>> {
    let mut stmt = conn.prepare(&format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE id = ?1"))?;
    let mut rows = stmt.query([id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_video(row)?)),
        None => Ok(None),
    }
}

/// Like [`find_video`] but absence is an error.
pub fn get_video(conn: &Connection, id: &VideoId) -> ServiceResult<Video> {
    find_video(conn, id)?.ok_or_else(|| ServiceError::VideoNotFound(id.to_string()))
}

/// Applies `$set`-style changes. Returns `false` when no video matched.
pub fn update_video(
    conn: &Connection,
    id: &VideoId,
    changes: &VideoChanges,
    now: DateTime<Utc>,
) -> ServiceResult<bool> {
    let mut assignments = vec!["updated_at = ?".to_owned()];
    let mut values: Vec<Value> = vec![Value::Text(sql_timestamp(now))];

    if let Some(title) = &changes.title {
        assignments.push("title = ?".into());
        values.push(Value::Text(title.clone()));
    }
    if let Some(description) = &changes.description {
        assignments.push("description = ?".into());
        values.push(Value::Text(description.clone()));
    }
    if let Some(status) = changes.status {
        assignments.push("status = ?".into());
        values.push(Value::Text(status.as_str().to_owned()));
    }
    if let Some(tags) = &changes.tags {
        assignments.push("tags_json = ?".into());
        values.push(Value::Text(serde_json::to_string(tags)?));
    }
    values.push(Value::Text(id.to_string()));

    let sql = format!("UPDATE videos SET {} WHERE id = ?", assignments.join(", "));
    let updated = conn.execute(&sql, params_from_iter(values))?;
    Ok(updated > 0)
}

pub fn set_video_status(
    conn: &Connection,
    id: &VideoId,
    status: VideoStatus,
    now: DateTime<Utc>,
) -> ServiceResult<bool> {
    let updated = conn.execute(
        "UPDATE videos SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status, now, id],
    )?;
    Ok(updated > 0)
}

pub fn set_thumbnail(
    conn: &Connection,
    id: &VideoId,
    file: &str,
    now: DateTime<Utc>,
) -> ServiceResult<bool> {
    let updated = conn.execute(
        "UPDATE videos SET thumbnail_file = ?1, updated_at = ?2 WHERE id = ?3",
        params![file, now, id],
    )?;
    Ok(updated > 0)
}

/// `$inc: {stats.<field>: 1}`. Returns `false` when no video matched.
pub fn increment_stat(conn: &Connection, id: &VideoId, field: StatField) -> ServiceResult<bool> {
    let column = field.column();
    let updated = conn.execute(
        &format!("UPDATE videos SET {column} = {column} + 1 WHERE id = ?1"),
        [id],
    )?;
    Ok(updated > 0)
}

/// Decrements `likes` only while it is positive. Returns `false` when the
/// counter was already at zero (or the video is gone).
pub fn decrement_likes_if_positive(conn: &Connection, id: &VideoId) -> ServiceResult<bool> {
    let updated = conn.execute(
        "UPDATE videos SET likes = likes - 1 WHERE id = ?1 AND likes > 0",
        [id],
    )?;
    Ok(updated > 0)
}

pub fn delete_video_row(conn: &Connection, id: &VideoId) -> ServiceResult<bool> {
    let deleted = conn.execute("DELETE FROM videos WHERE id = ?1", [id])?;
    Ok(deleted > 0)
}

/// Removes every document that references `id`, annotations first so the
/// sub-select on `marks` still sees their parents.
pub fn delete_dependents(conn: &Connection, id: &VideoId) -> ServiceResult<DependentCounts> {
    let favorites = conn.execute("DELETE FROM favorites WHERE video_id = ?1", [id])?;
    let watch_history = conn.execute("DELETE FROM watch_history WHERE video_id = ?1", [id])?;
    let comments = conn.execute("DELETE FROM comments WHERE video_id = ?1", [id])?;
    let annotations = conn.execute(
        r#"
        DELETE FROM annotations
        WHERE video_id = ?1
           OR mark_id IN (SELECT id FROM marks WHERE video_id = ?1)
        "#,
        [id],
    )?;
    let marks = conn.execute("DELETE FROM marks WHERE video_id = ?1", [id])?;
    let notes = conn.execute("DELETE FROM notes WHERE video_id = ?1", [id])?;

    Ok(DependentCounts {
        favorites,
        watch_history,
        comments,
        marks,
        annotations,
        notes,
    })
}

pub fn list_videos(conn: &Connection, query: &VideoQuery) -> ServiceResult<Page<Video>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(owner) = &query.owner {
        clauses.push("user_id = ?");
        values.push(Value::Text(owner.clone()));
    }
    if let Some(status) = query.status {
        clauses.push("status = ?");
        values.push(Value::Text(status.as_str().to_owned()));
    }
    if let Some(keyword) = query.keyword.as_deref().filter(|value| !value.is_empty()) {
        clauses.push(r"(title LIKE ? ESCAPE '\' OR description LIKE ? ESCAPE '\')");
        let pattern = format!("%{}%", escape_like(keyword));
        values.push(Value::Text(pattern.clone()));
        values.push(Value::Text(pattern));
    }
    for tag in &query.tags {
        clauses.push("EXISTS (SELECT 1 FROM json_each(videos.tags_json) WHERE json_each.value = ?)");
        values.push(Value::Text(tag.clone()));
    }

    let filter = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM videos {filter}"),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;

    let direction = if query.descending { "DESC" } else { "ASC" };
    let sql = format!(
        "SELECT {VIDEO_COLUMNS} FROM videos {filter} \
         ORDER BY {} {direction}, rowid {direction} LIMIT ? OFFSET ?",
        query.sort.column()
    );
    values.push(Value::Integer(i64::from(query.pagination.page_size)));
    values.push(Value::Integer(query.pagination.offset()));

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(values.iter()))?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(row_to_video(row)?);
    }

    Ok(query.pagination.into_page(total, items))
}

/// Every file name referenced by a video row, for the orphan sweep.
pub fn referenced_files(conn: &Connection) -> ServiceResult<Vec<String>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT file_name FROM videos
        UNION SELECT cover_file FROM videos WHERE cover_file IS NOT NULL
        UNION SELECT thumbnail_file FROM videos WHERE thumbnail_file IS NOT NULL
        "#,
    )?;
    let files = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(files)
}

/// `(video, stored likes, live favorite count)` for every video whose counter
/// disagrees with the favorites collection.
pub fn likes_drift(conn: &Connection) -> ServiceResult<Vec<(VideoId, i64, i64)>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT v.id, v.likes, COUNT(f.id) AS live
        FROM videos v
        LEFT JOIN favorites f ON f.video_id = v.id
        GROUP BY v.id
        HAVING v.likes != live
        "#,
    )?;
    let drift = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(drift)
}

fn row_to_video(row: &Row<'_>) -> ServiceResult<Video> {
    let tags_json: String = row.get("tags_json")?;
    let tags: Vec<String> = serde_json::from_str(&tags_json)?;

    Ok(Video {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        file_name: row.get("file_name")?,
        file_size: row.get("file_size")?,
        duration: row.get("duration")?,
        format: row.get("format")?,
        status: row.get("status")?,
        tags,
        cover_file: row.get("cover_file")?,
        thumbnail_file: row.get("thumbnail_file")?,
        stats: VideoStats {
            views: row.get("views")?,
            likes: row.get("likes")?,
            comments: row.get("comments")?,
            shares: row.get("shares")?,
        },
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Same text layout rusqlite uses when binding a `DateTime<Utc>`, so rows
/// written either way sort together.
fn sql_timestamp(value: DateTime<Utc>) -> String {
    value.format("%F %T%.f%:z").to_string()
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

// ---------------------------------------------------------------------------
// favorites

pub fn favorite_exists(conn: &Connection, user_id: &str, video_id: &VideoId) -> ServiceResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM favorites WHERE user_id = ?1 AND video_id = ?2",
            params![user_id, video_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn insert_favorite(conn: &Connection, favorite: &Favorite) -> ServiceResult<()> {
    conn.execute(
        r#"
        INSERT INTO favorites (
            id, user_id, video_id, video_title, cover_file, video_duration, added_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            favorite.id,
            favorite.user_id,
            favorite.video_id,
            favorite.video_title,
            favorite.cover_file,
            favorite.video_duration,
            favorite.added_at,
        ],
    )?;
    Ok(())
}

pub fn delete_favorite(conn: &Connection, user_id: &str, video_id: &VideoId) -> ServiceResult<bool> {
    let deleted = conn.execute(
        "DELETE FROM favorites WHERE user_id = ?1 AND video_id = ?2",
        params![user_id, video_id],
    )?;
    Ok(deleted > 0)
}

pub fn list_favorites(
    conn: &Connection,
    user_id: &str,
    pagination: Pagination,
) -> ServiceResult<Page<Favorite>> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM favorites WHERE user_id = ?1",
        [user_id],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(
        r#"
        SELECT id, user_id, video_id, video_title, cover_file, video_duration, added_at
        FROM favorites
        WHERE user_id = ?1
        ORDER BY added_at DESC, rowid DESC
        LIMIT ?2 OFFSET ?3
        "#,
    )?;
    let items = stmt
        .query_map(
            params![user_id, pagination.page_size, pagination.offset()],
            row_to_favorite,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(pagination.into_page(total, items))
}

fn row_to_favorite(row: &Row<'_>) -> rusqlite::Result<Favorite> {
    Ok(Favorite {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        video_id: row.get("video_id")?,
        video_title: row.get("video_title")?,
        cover_file: row.get("cover_file")?,
        video_duration: row.get("video_duration")?,
        added_at: row.get("added_at")?,
    })
}

// ---------------------------------------------------------------------------
// watch history

/// Upsert keyed by `(user_id, video_id)`; last write wins.
pub fn upsert_watch_history(conn: &Connection, entry: &WatchHistory) -> ServiceResult<()> {
    conn.execute(
        r#"
        INSERT INTO watch_history (
            user_id, video_id, video_title, cover_file, video_duration, progress, watched_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(user_id, video_id) DO UPDATE SET
            video_title = excluded.video_title,
            cover_file = excluded.cover_file,
            video_duration = excluded.video_duration,
            progress = excluded.progress,
            watched_at = excluded.watched_at
        "#,
        params![
            entry.user_id,
            entry.video_id,
            entry.video_title,
            entry.cover_file,
            entry.video_duration,
            entry.progress,
            entry.watched_at,
        ],
    )?;
    Ok(())
}

pub fn list_watch_history(
    conn: &Connection,
    user_id: &str,
    pagination: Pagination,
) -> ServiceResult<Page<WatchHistory>> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM watch_history WHERE user_id = ?1",
        [user_id],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(
        r#"
        SELECT user_id, video_id, video_title, cover_file, video_duration, progress, watched_at
        FROM watch_history
        WHERE user_id = ?1
        ORDER BY watched_at DESC, rowid DESC
        LIMIT ?2 OFFSET ?3
        "#,
    )?;
    let items = stmt
        .query_map(
            params![user_id, pagination.page_size, pagination.offset()],
            |row| {
                Ok(WatchHistory {
                    user_id: row.get("user_id")?,
                    video_id: row.get("video_id")?,
                    video_title: row.get("video_title")?,
                    cover_file: row.get("cover_file")?,
                    video_duration: row.get("video_duration")?,
                    progress: row.get("progress")?,
                    watched_at: row.get("watched_at")?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(pagination.into_page(total, items))
}

// ---------------------------------------------------------------------------
// comments, marks, annotations, notes

pub fn insert_comment(conn: &Connection, comment: &Comment) -> ServiceResult<()> {
    conn.execute(
        "INSERT INTO comments (id, video_id, user_id, content, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            comment.id,
            comment.video_id,
            comment.user_id,
            comment.content,
            comment.created_at,
        ],
    )?;
    Ok(())
}

pub fn insert_mark(conn: &Connection, mark: &Mark) -> ServiceResult<()> {
    conn.execute(
        "INSERT INTO marks (id, user_id, video_id, timestamp, content, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            mark.id,
            mark.user_id,
            mark.video_id,
            mark.timestamp,
            mark.content,
            mark.created_at,
        ],
    )?;
    Ok(())
}

pub fn find_mark(conn: &Connection, id: &RecordId) -> ServiceResult<Option<Mark>> {
    Ok(conn
        .query_row(
            "SELECT id, user_id, video_id, timestamp, content, created_at FROM marks WHERE id = ?1",
            [id],
            row_to_mark,
        )
        .optional()?)
}

/// Marks of one user on one video, each with its annotations.
pub fn list_marks(conn: &Connection, user_id: &str, video_id: &VideoId) -> ServiceResult<Vec<Mark>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, user_id, video_id, timestamp, content, created_at
        FROM marks
        WHERE user_id = ?1 AND video_id = ?2
        ORDER BY timestamp ASC, rowid ASC
        "#,
    )?;
    let mut marks = stmt
        .query_map(params![user_id, video_id], row_to_mark)?
        .collect::<Result<Vec<_>, _>>()?;

    for mark in &mut marks {
        mark.annotations = annotations_for_mark(conn, &mark.id)?;
    }
    Ok(marks)
}

pub fn delete_mark(conn: &Connection, id: &RecordId) -> ServiceResult<usize> {
    let annotations = conn.execute("DELETE FROM annotations WHERE mark_id = ?1", [id])?;
    conn.execute("DELETE FROM marks WHERE id = ?1", [id])?;
    Ok(annotations)
}

fn row_to_mark(row: &Row<'_>) -> rusqlite::Result<Mark> {
    Ok(Mark {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        video_id: row.get("video_id")?,
        timestamp: row.get("timestamp")?,
        content: row.get("content")?,
        annotations: Vec::new(),
        created_at: row.get("created_at")?,
    })
}

pub fn insert_annotation(conn: &Connection, annotation: &Annotation) -> ServiceResult<()> {
    conn.execute(
        "INSERT INTO annotations (id, user_id, mark_id, video_id, content, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            annotation.id,
            annotation.user_id,
            annotation.mark_id,
            annotation.video_id,
            annotation.content,
            annotation.created_at,
        ],
    )?;
    Ok(())
}

/// Owner of an annotation, if it exists.
pub fn annotation_owner(conn: &Connection, id: &RecordId) -> ServiceResult<Option<String>> {
    Ok(conn
        .query_row("SELECT user_id FROM annotations WHERE id = ?1", [id], |row| {
            row.get(0)
        })
        .optional()?)
}

pub fn delete_annotation(conn: &Connection, id: &RecordId) -> ServiceResult<bool> {
    Ok(conn.execute("DELETE FROM annotations WHERE id = ?1", [id])? > 0)
}

pub fn annotations_for_mark(conn: &Connection, mark_id: &RecordId) -> ServiceResult<Vec<Annotation>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, user_id, mark_id, video_id, content, created_at
        FROM annotations
        WHERE mark_id = ?1
        ORDER BY created_at ASC, rowid ASC
        "#,
    )?;
    let annotations = stmt
        .query_map([mark_id], |row| {
            Ok(Annotation {
                id: row.get("id")?,
                user_id: row.get("user_id")?,
                mark_id: row.get("mark_id")?,
                video_id: row.get("video_id")?,
                content: row.get("content")?,
                created_at: row.get("created_at")?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(annotations)
}

pub fn insert_note(conn: &Connection, note: &Note) -> ServiceResult<()> {
    conn.execute(
        "INSERT INTO notes (id, user_id, video_id, timestamp, content, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            note.id,
            note.user_id,
            note.video_id,
            note.timestamp,
            note.content,
            note.created_at,
        ],
    )?;
    Ok(())
}

/// Owner of a note, if it exists.
pub fn note_owner(conn: &Connection, id: &RecordId) -> ServiceResult<Option<String>> {
    Ok(conn
        .query_row("SELECT user_id FROM notes WHERE id = ?1", [id], |row| row.get(0))
        .optional()?)
}

pub fn delete_note(conn: &Connection, id: &RecordId) -> ServiceResult<bool> {
    Ok(conn.execute("DELETE FROM notes WHERE id = ?1", [id])? > 0)
}

pub fn list_notes(conn: &Connection, user_id: &str, video_id: &VideoId) -> ServiceResult<Vec<Note>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, user_id, video_id, timestamp, content, created_at
        FROM notes
        WHERE user_id = ?1 AND video_id = ?2
        ORDER BY timestamp ASC, rowid ASC
        "#,
    )?;
    let notes = stmt
        .query_map(params![user_id, video_id], |row| {
            Ok(Note {
                id: row.get("id")?,
                user_id: row.get("user_id")?,
                video_id: row.get("video_id")?,
                timestamp: row.get("timestamp")?,
                content: row.get("content")?,
                created_at: row.get("created_at")?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(notes)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the service tests.

    use super::*;

    pub fn sample_video(owner: &str) -> Video {
        let now = Utc::now();
        let id = VideoId::new();
        Video {
            id,
            user_id: owner.into(),
            title: format!("Video {id}"),
            description: "desc".into(),
            file_name: format!("{id}.mp4"),
            file_size: 1000,
            duration: 60.0,
            format: "mp4".into(),
            status: VideoStatus::Public,
            tags: vec!["demo".into()],
            cover_file: None,
            thumbnail_file: None,
            stats: VideoStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn open_temp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("vidshelf.db")).unwrap();
        (dir, db)
    }

    pub fn insert(db: &Database, video: &Video) {
        db.with_connection(|conn| insert_video(conn, video)).unwrap();
    }

    pub fn likes(db: &Database, id: &VideoId) -> i64 {
        db.with_connection(|conn| get_video(conn, id))
            .unwrap()
            .stats
            .likes
    }

    pub fn count_favorites_for_video(conn: &Connection, video_id: &VideoId) -> ServiceResult<i64> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM favorites WHERE video_id = ?1",
            [video_id],
            |row| row.get(0),
        )?)
    }

    /// Number of documents in `table` that reference `video_id`.
    pub fn count_referencing(conn: &Connection, table: &str, video_id: &VideoId) -> ServiceResult<i64> {
        const TABLES: [&str; 6] = [
            "favorites",
            "watch_history",
            "comments",
            "marks",
            "annotations",
            "notes",
        ];
        if !TABLES.contains(&table) {
            return Err(ServiceError::InvalidInput(format!("unknown collection {table}")));
        }
        Ok(conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE video_id = ?1"),
            [video_id],
            |row| row.get(0),
        )?)
    }
}
