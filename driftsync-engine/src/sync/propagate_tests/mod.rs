use std::path::Path;
use std::sync::{Arc, Mutex};

use sqlx::SqlitePool;
use tempfile::tempdir;
use wiremock::matchers::{body_bytes, header, method, path as url_path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use driftsync_core::dav::{DavClient, DavConfig};
use driftsync_core::{LocalFs, Vio};

use super::*;

async fn make_propagator(server: &MockServer, root: &Path) -> Propagator {
    let remote = DavClient::with_config(
        &server.uri(),
        DavConfig {
            chunk_size: 4,
            chunk_retries: 0,
        },
    )
    .unwrap();
    let vio = Vio::new(LocalFs::new(root), remote);
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let journal = ProgressJournal::from_pool(pool);
    journal.init().await.unwrap();
    Propagator::new(vio, journal)
}

fn recording_progress() -> (ProgressCallback, Arc<Mutex<Vec<ProgressEvent>>>) {
    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let callback: ProgressCallback =
        Box::new(move |event: &ProgressEvent| sink.lock().unwrap().push(event.clone()));
    (callback, events)
}

fn kinds(events: &Arc<Mutex<Vec<ProgressEvent>>>) -> Vec<ProgressKind> {
    events.lock().unwrap().iter().map(|event| event.kind).collect()
}

async fn write_local(root: &Path, rel: &str, contents: &[u8], mtime: i64) {
    let full = root.join(rel);
    if let Some(parent) = full.parent() {
        tokio::fs::create_dir_all(parent).await.unwrap();
    }
    tokio::fs::write(&full, contents).await.unwrap();
    filetime::set_file_mtime(&full, filetime::FileTime::from_unix_time(mtime, 0)).unwrap();
}

fn local_file_entry(root: &Path, rel: &str, pending: Pending) -> Entry {
    let meta = std::fs::metadata(root.join(rel)).unwrap();
    let mut entry = Entry::file(rel, pending);
    entry.size = meta.len() as i64;
    entry.modtime = filetime::FileTime::from_last_modification_time(&meta).unix_seconds();
    entry.uid = current_uid();
    entry
}

include!("part1.rs");
include!("part2.rs");
include!("part3.rs");
