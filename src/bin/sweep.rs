#![forbid(unsafe_code)]

//! Reconciles the upload directory with the database. Stored files that no
//! video references are reported, and removed with `--delete`. Only names the
//! service itself generates are considered, and files younger than
//! `--min-age-minutes` are left alone because an upload in progress writes
//! its file before the row exists. Like counters that disagree with the
//! favorites table are reported but never rewritten.

use std::{
    collections::BTreeSet,
    path::PathBuf,
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use vidshelf::{
    config::{DEFAULT_CONFIG_PATH, load_env_config_from},
    logging,
    security::ensure_not_root,
    storage::{BlobStore, LocalBlobStore},
    store::{self, Database},
    videos,
};

const DEFAULT_MIN_AGE_MINUTES: u64 = 60;

#[derive(Parser, Debug)]
#[command(author, version, about = "Find and remove stored files no video references.")]
struct Args {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the env config file")]
    config: PathBuf,
    #[arg(long = "upload-dir", value_name = "DIR", help = "Override UPLOAD_DIR")]
    upload_dir: Option<PathBuf>,
    #[arg(long = "database", value_name = "PATH", help = "Override DATABASE_PATH")]
    database: Option<PathBuf>,
    #[arg(
        long = "min-age-minutes",
        value_name = "MINUTES",
        default_value_t = DEFAULT_MIN_AGE_MINUTES,
        help = "Skip files modified more recently than this"
    )]
    min_age_minutes: u64,
    #[arg(long = "delete", help = "Remove orphaned files instead of only listing them")]
    delete: bool,
}

fn main() -> Result<()> {
    logging::init();
    ensure_not_root("sweep")?;

    let args = Args::parse();
    let mut env = load_env_config_from(&args.config)?;
    if args.upload_dir.is_some() {
        env.upload_dir = args.upload_dir;
    }
    if args.database.is_some() {
        env.database_path = args.database;
    }
    let config = env.resolve()?;

    let db = Database::open(&config.database_path)
        .with_context(|| format!("opening database {}", config.database_path.display()))?;
    let blobs = LocalBlobStore::new(&config.upload_dir)
        .with_context(|| format!("opening upload dir {}", config.upload_dir.display()))?;

    let min_age = Duration::from_secs(args.min_age_minutes.saturating_mul(60));
    let cutoff = SystemTime::now()
        .checked_sub(min_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let orphans = find_orphans(&db, &blobs, cutoff)?;

    let mut removed = 0usize;
    let mut reclaimed = 0u64;
    for name in &orphans {
        let size = blobs.size(name).unwrap_or(0);
        if !args.delete {
            println!("{name}\t{size}");
            continue;
        }
        match blobs.remove(name) {
            Ok(()) => {
                removed += 1;
                reclaimed += size;
                info!(file = %name, bytes = size, "removed orphaned file");
            }
            Err(err) => warn!(file = %name, error = %err, "failed to remove orphaned file"),
        }
    }

    let drift = db.with_connection(|conn| store::likes_drift(conn))?;
    for (video_id, stored, live) in &drift {
        warn!(%video_id, stored, live, "like counter disagrees with favorites");
    }

    info!(
        orphans = orphans.len(),
        removed,
        reclaimed_bytes = reclaimed,
        likes_drift = drift.len(),
        "sweep finished"
    );
    Ok(())
}

/// Generated files that no video row references and that were last modified
/// before `cutoff`, sorted by name.
fn find_orphans(db: &Database, blobs: &LocalBlobStore, cutoff: SystemTime) -> Result<Vec<String>> {
    let referenced: BTreeSet<String> = db
        .with_connection(|conn| store::referenced_files(conn))?
        .into_iter()
        .collect();

    let names = blobs
        .file_names()
        .with_context(|| format!("listing {}", blobs.root().display()))?;

    let mut orphans = Vec::new();
    for name in names {
        if !videos::is_stored_name(&name) || referenced.contains(&name) {
            continue;
        }
        let modified = blobs
            .modified(&name)
            .with_context(|| format!("reading mtime of {name}"))?;
        if modified > cutoff {
            debug!(file = %name, "skipping recent file");
            continue;
        }
        orphans.push(name);
    }
    Ok(orphans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs::{self, File};
    use vidshelf::model::{RecordId, Video, VideoId, VideoStats, VideoStatus};

    fn video(file_name: &str, cover: Option<&str>) -> Video {
        let now = Utc::now();
        Video {
            id: VideoId::new(),
            user_id: "alice".into(),
            title: "t".into(),
            description: String::new(),
            file_name: file_name.into(),
            file_size: 1,
            duration: 1.0,
            format: "mp4".into(),
            status: VideoStatus::Public,
            tags: Vec::new(),
            cover_file: cover.map(str::to_owned),
            thumbnail_file: None,
            stats: VideoStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn generated() -> String {
        format!("{}.mp4", VideoId::new())
    }

    /// Creates `name` with an mtime two hours in the past.
    fn create_old(blobs: &LocalBlobStore, name: &str) {
        let file = blobs.create(name).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(2 * 3600))
            .unwrap();
    }

    fn hour_ago() -> SystemTime {
        SystemTime::now() - Duration::from_secs(3600)
    }

    #[test]
    fn unreferenced_generated_files_are_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("vidshelf.db")).unwrap();
        let blobs = LocalBlobStore::new(dir.path().join("uploads")).unwrap();

        let payload = generated();
        let cover = format!("cover_{}.png", RecordId::new());
        let stray = generated();
        for name in [&payload, &cover, &stray] {
            create_old(&blobs, name);
        }
        db.with_connection(|conn| store::insert_video(conn, &video(&payload, Some(&cover))))
            .unwrap();

        let orphans = find_orphans(&db, &blobs, hour_ago()).unwrap();
        assert_eq!(orphans, vec![stray]);
    }

    #[test]
    fn database_inside_upload_dir_is_never_an_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let upload_dir = dir.path().join("uploads");
        // Same directory reached through a differently shaped path.
        let database_path = upload_dir.join("..").join("uploads").join(".").join("vidshelf.db");
        let db = Database::open(&database_path).unwrap();
        let blobs = LocalBlobStore::new(&upload_dir).unwrap();
        for suffix in ["-wal", "-shm"] {
            File::create(upload_dir.join(format!("vidshelf.db{suffix}"))).unwrap();
        }
        create_old(&blobs, "readme.txt");
        let stray = generated();
        create_old(&blobs, &stray);

        let cutoff = SystemTime::now() + Duration::from_secs(60);
        let orphans = find_orphans(&db, &blobs, cutoff).unwrap();
        assert_eq!(orphans, vec![stray]);
        assert!(fs::metadata(upload_dir.join("vidshelf.db")).is_ok());
    }

    #[test]
    fn recent_files_are_left_for_in_flight_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("vidshelf.db")).unwrap();
        let blobs = LocalBlobStore::new(dir.path().join("uploads")).unwrap();

        let in_flight = generated();
        blobs.create(&in_flight).unwrap();
        assert!(find_orphans(&db, &blobs, hour_ago()).unwrap().is_empty());

        let later = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(find_orphans(&db, &blobs, later).unwrap(), vec![in_flight]);
    }
}
