#[tokio::test]
async fn remove_local_file_emits_delete_notifications() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    write_local(dir.path(), "doomed.txt", b"bye", 100).await;

    let (callback, events) = recording_progress();
    let mut propagator = make_propagator(&server, dir.path())
        .await
        .with_progress(callback);

    let mut trees = SyncTrees::default();
    trees
        .local
        .insert(local_file_entry(dir.path(), "doomed.txt", Pending::Remove));

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    assert!(!dir.path().join("doomed.txt").exists());
    assert_eq!(
        trees.local.get_by_path("doomed.txt").unwrap().applied,
        Some(Applied::Deleted)
    );
    assert!(kinds(&events).contains(&ProgressKind::StartDelete));
    assert!(kinds(&events).contains(&ProgressKind::EndDelete));
}

#[tokio::test]
async fn failed_remote_remove_writes_back_none_and_marks_ancestors() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(url_path("/files/a/b.txt"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let mut propagator = make_propagator(&server, dir.path()).await;

    let mut trees = SyncTrees::default();
    trees.remote.insert(Entry::dir("a", Pending::Sync));
    let mut file = Entry::file("a/b.txt", Pending::Remove);
    file.modtime = 300;
    trees.remote.insert(file);

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    let file = trees.remote.get_by_path("a/b.txt").unwrap();
    // `None`, not `Error`: the statedb keeps the path and retries the
    // removal next sync.
    assert_eq!(file.applied, Some(Applied::None));
    assert!(file.error_string.is_some());

    let parent = trees.remote.get_by_path("a").unwrap();
    assert_eq!(parent.applied, Some(Applied::Error));
    assert_eq!(
        parent.error_string.as_deref(),
        Some("Error within the directory")
    );

    let record = propagator.journal.get(file.phash, 300, None).await.unwrap();
    assert_eq!(record.unwrap().error, 1);
}

#[tokio::test]
async fn new_directory_is_created_on_the_remote_replica() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(url_path("/dirs/fresh"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(url_path("/meta/fresh"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let mut propagator = make_propagator(&server, dir.path()).await;

    let mut entry = Entry::dir("fresh", Pending::New);
    entry.mode = 0o755;
    entry.modtime = 1234;
    let mut trees = SyncTrees::default();
    trees.local.insert(entry);

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    assert_eq!(
        trees.local.get_by_path("fresh").unwrap().applied,
        Some(Applied::Updated)
    );
}

#[tokio::test]
async fn new_directory_is_created_locally_with_its_mtime() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let mut propagator = make_propagator(&server, dir.path()).await;

    let mut entry = Entry::dir("pulled", Pending::New);
    entry.mode = 0o755;
    entry.modtime = 4321;
    let mut trees = SyncTrees::default();
    trees.remote.insert(entry);

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    let created = dir.path().join("pulled");
    assert!(created.is_dir());
    let meta = std::fs::metadata(&created).unwrap();
    assert_eq!(
        filetime::FileTime::from_last_modification_time(&meta).unix_seconds(),
        4321
    );
    assert_eq!(
        trees.remote.get_by_path("pulled").unwrap().applied,
        Some(Applied::Updated)
    );
}

#[tokio::test]
async fn non_empty_rmdir_defers_until_leftovers_are_cleaned() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    tokio::fs::create_dir(dir.path().join("d")).await.unwrap();
    tokio::fs::write(dir.path().join("d/stray.tmp"), b"leftover")
        .await
        .unwrap();

    let mut propagator = make_propagator(&server, dir.path()).await;
    let mut trees = SyncTrees::default();
    trees.local.insert(Entry::dir("d", Pending::Remove));

    let ignored = IgnoredFiles {
        local: vec!["d/stray.tmp".to_string()],
        remote: Vec::new(),
    };
    propagator.run(&mut trees, &ignored).await.unwrap();

    assert!(!dir.path().join("d").exists());
    assert_eq!(
        trees.local.get_by_path("d").unwrap().applied,
        Some(Applied::Deleted)
    );
}

#[tokio::test]
async fn nested_directory_removals_all_complete() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    tokio::fs::create_dir_all(dir.path().join("d/e/f")).await.unwrap();

    let mut propagator = make_propagator(&server, dir.path()).await;
    let mut trees = SyncTrees::default();
    trees.local.insert(Entry::dir("d", Pending::Remove));
    trees.local.insert(Entry::dir("d/e", Pending::Remove));
    trees.local.insert(Entry::dir("d/e/f", Pending::Remove));

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    // Whatever the hash walk order was, the deferred pass finished the job
    // depth-first.
    assert!(!dir.path().join("d").exists());
    for path in ["d", "d/e", "d/e/f"] {
        assert_eq!(
            trees.local.get_by_path(path).unwrap().applied,
            Some(Applied::Deleted),
            "directory {path} not deleted"
        );
    }
}

#[tokio::test]
async fn conflict_download_discards_backup_when_contents_match() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(url_path("/files/c.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"same data"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(url_path("/meta/c.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "size": 9,
            "mtime": 700,
            "file_id": "fid-c"
        })))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    write_local(dir.path(), "c.txt", b"same data", 500).await;

    let mut propagator = make_propagator(&server, dir.path()).await;
    let mut entry = Entry::file("c.txt", Pending::Conflict);
    entry.size = 9;
    entry.modtime = 700;
    let mut trees = SyncTrees::default();
    trees.remote.insert(entry);

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(dir.path().join("c.txt")).unwrap(),
        b"same data"
    );
    assert_eq!(
        trees.remote.get_by_path("c.txt").unwrap().applied,
        Some(Applied::Updated)
    );
    // No real conflict: the backup was erased again.
    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["c.txt".to_string()]);
}

#[tokio::test]
async fn conflict_upload_backs_up_the_server_side_copy_first() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(url_path("/move/c.txt"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(url_path("/chunk/c.txt"))
        .respond_with(ResponseTemplate::new(201).insert_header("X-Transfer-Id", "8"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(url_path("/meta/c.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "size": 10,
            "mtime": 600,
            "file_id": "fid-up"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(url_path("/meta/c.txt"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    write_local(dir.path(), "c.txt", b"local copy", 600).await;

    let mut propagator = make_propagator(&server, dir.path()).await;
    let mut trees = SyncTrees::default();
    trees
        .local
        .insert(local_file_entry(dir.path(), "c.txt", Pending::Conflict));

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    let entry = trees.local.get_by_path("c.txt").unwrap();
    assert_eq!(entry.applied, Some(Applied::Updated));
    assert_eq!(entry.fingerprint.as_deref(), Some("fid-up"));

    // The server-side copy was renamed to a conflict name before the push.
    let requests = server.received_requests().await.unwrap();
    let backup_move = requests
        .iter()
        .find(|request| request.url.path() == "/move/c.txt")
        .expect("backup rename request");
    let destination = backup_move
        .headers
        .get("X-Destination")
        .expect("destination header")
        .to_str()
        .unwrap();
    assert!(destination.starts_with("c_conflict-"));
    assert!(destination.ends_with(".txt"));
}

#[tokio::test]
async fn conflict_download_keeps_backup_when_contents_differ() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(url_path("/files/c.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"remote version"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(url_path("/meta/c.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "size": 14,
            "mtime": 700,
            "file_id": "fid-c"
        })))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    write_local(dir.path(), "c.txt", b"local version", 500).await;

    let mut propagator = make_propagator(&server, dir.path()).await;
    let mut entry = Entry::file("c.txt", Pending::Conflict);
    entry.size = 14;
    entry.modtime = 700;
    let mut trees = SyncTrees::default();
    trees.remote.insert(entry);

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(dir.path().join("c.txt")).unwrap(),
        b"remote version"
    );

    let backups: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains("_conflict-"))
        .collect();
    assert_eq!(backups.len(), 1);
    let backup = &backups[0];
    assert!(backup.starts_with("c_conflict-"));
    assert!(backup.ends_with(".txt"));
    assert_eq!(
        std::fs::read(dir.path().join(backup)).unwrap(),
        b"local version"
    );
}
