#[tokio::test]
async fn fresh_upload_streams_chunks_and_finalizes_metadata() {
    let server = MockServer::start().await;
    for (index, body, is_final) in
        [(0u32, &b"hell"[..], "0"), (1, &b"o wo"[..], "0"), (2, &b"rld!"[..], "1")]
    {
        Mock::given(method("PUT"))
            .and(url_path("/chunk/a/b.txt"))
            .and(query_param("chunk", index.to_string()))
            .and(query_param("final", is_final))
            .and(body_bytes(body.to_vec()))
            .respond_with(ResponseTemplate::new(201).insert_header("X-Transfer-Id", "5"))
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(url_path("/meta/a/b.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "size": 12,
            "mtime": 1000,
            "file_id": "fid-1"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(url_path("/meta/a/b.txt"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    write_local(dir.path(), "a/b.txt", b"hello world!", 1000).await;

    let (callback, events) = recording_progress();
    let mut propagator = make_propagator(&server, dir.path())
        .await
        .with_progress(callback);
    let mut trees = SyncTrees::default();
    trees
        .local
        .insert(local_file_entry(dir.path(), "a/b.txt", Pending::New));

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    let entry = trees.local.get_by_path("a/b.txt").unwrap();
    assert_eq!(entry.applied, Some(Applied::Updated));
    assert_eq!(entry.fingerprint.as_deref(), Some("fid-1"));
    assert!(entry.error_string.is_none());
    assert_eq!(propagator.journal.count().await.unwrap(), 0);
    assert_eq!(propagator.overall().byte_current, 12);

    assert_eq!(
        kinds(&events),
        vec![
            ProgressKind::StartSyncSequence,
            ProgressKind::StartUpload,
            ProgressKind::FinishedUpload,
            ProgressKind::FinishedSyncSequence,
        ]
    );
    let recorded = events.lock().unwrap();
    let upload = &recorded[1];
    assert_eq!(upload.path.as_deref(), Some("a/b.txt"));
    assert_eq!(upload.file_no, 1);
    assert_eq!(upload.file_count, 1);
    assert_eq!(upload.overall_size, 12);
}

#[tokio::test]
async fn resumed_upload_continues_from_acknowledged_chunk() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(url_path("/chunk/big.bin"))
        .and(query_param("chunk", "3"))
        .and(query_param("transfer", "42"))
        .and(query_param("final", "1"))
        .and(body_bytes(b"mnop".to_vec()))
        .respond_with(ResponseTemplate::new(201).insert_header("X-Transfer-Id", "42"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(url_path("/meta/big.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "size": 16,
            "mtime": 1000,
            "file_id": "fid-2"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(url_path("/meta/big.bin"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    write_local(dir.path(), "big.bin", b"abcdefghijklmnop", 1000).await;

    let mut propagator = make_propagator(&server, dir.path()).await;
    let entry = local_file_entry(dir.path(), "big.bin", Pending::Sync);
    let mut record = ResumeRecord::fresh(entry.phash, entry.modtime, None);
    record.chunk = 3;
    record.transfer_id = 42;
    record.error = 2;
    propagator.journal.put(&record).await.unwrap();

    let mut trees = SyncTrees::default();
    trees.local.insert(entry);

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    let entry = trees.local.get_by_path("big.bin").unwrap();
    assert_eq!(entry.applied, Some(Applied::Updated));
    // A full success retires the resume record.
    assert_eq!(propagator.journal.count().await.unwrap(), 0);
}

#[tokio::test]
async fn upload_with_bulk_put_streams_the_whole_file() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(url_path("/files/up.bin"))
        .and(body_bytes(b"payload".to_vec()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(url_path("/meta/up.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "size": 7,
            "mtime": 900,
            "file_id": "fid-up"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(url_path("/meta/up.bin"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    write_local(dir.path(), "up.bin", b"payload", 900).await;

    let (callback, events) = recording_progress();
    let mut caps = driftsync_core::ReplicaCapabilities::dav();
    caps.put_support = true;
    let mut propagator = make_propagator(&server, dir.path())
        .await
        .with_caps(driftsync_core::ReplicaCapabilities::local_fs(), caps)
        .with_progress(callback);

    let mut trees = SyncTrees::default();
    trees
        .local
        .insert(local_file_entry(dir.path(), "up.bin", Pending::New));

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    let entry = trees.local.get_by_path("up.bin").unwrap();
    assert_eq!(entry.applied, Some(Applied::Updated));
    assert_eq!(entry.fingerprint.as_deref(), Some("fid-up"));
    assert_eq!(propagator.journal.count().await.unwrap(), 0);
    assert_eq!(propagator.overall().byte_current, 7);
    assert!(kinds(&events).contains(&ProgressKind::StartUpload));
    assert!(kinds(&events).contains(&ProgressKind::FinishedUpload));

    // The bulk primitive carried the bytes: nothing went through the
    // chunked endpoint.
    let requests = server.received_requests().await.unwrap();
    assert!(
        requests
            .iter()
            .all(|request| !request.url.path().starts_with("/chunk/"))
    );
}

#[tokio::test]
async fn download_with_bulk_get_lands_in_place_with_mtime() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(url_path("/files/docs/r.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(url_path("/meta/docs/r.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "size": 7,
            "mtime": 900,
            "file_id": "fid-9"
        })))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let (callback, events) = recording_progress();
    let mut caps = driftsync_core::ReplicaCapabilities::dav();
    caps.get_support = true;
    let mut propagator = make_propagator(&server, dir.path())
        .await
        .with_caps(driftsync_core::ReplicaCapabilities::local_fs(), caps)
        .with_progress(callback);

    let mut entry = Entry::file("docs/r.txt", Pending::New);
    entry.size = 7;
    entry.modtime = 900;
    let mut trees = SyncTrees::default();
    trees.remote.insert(entry);

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    let target = dir.path().join("docs/r.txt");
    assert_eq!(std::fs::read(&target).unwrap(), b"payload");
    let meta = std::fs::metadata(&target).unwrap();
    assert_eq!(
        filetime::FileTime::from_last_modification_time(&meta).unix_seconds(),
        900
    );
    let entry = trees.remote.get_by_path("docs/r.txt").unwrap();
    assert_eq!(entry.applied, Some(Applied::Updated));
    assert_eq!(entry.fingerprint.as_deref(), Some("fid-9"));
    assert!(kinds(&events).contains(&ProgressKind::StartDownload));
    assert!(kinds(&events).contains(&ProgressKind::FinishedDownload));

    // No temp leftovers next to the destination.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("docs"))
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".part"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn zero_byte_source_produces_zero_byte_destination() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(url_path("/chunk/empty.txt"))
        .and(query_param("chunk", "0"))
        .and(query_param("final", "1"))
        .and(body_bytes(Vec::new()))
        .respond_with(ResponseTemplate::new(201).insert_header("X-Transfer-Id", "3"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(url_path("/meta/empty.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "size": 0,
            "mtime": 1200
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(url_path("/meta/empty.txt"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    write_local(dir.path(), "empty.txt", b"", 1200).await;

    let mut propagator = make_propagator(&server, dir.path()).await;
    let mut trees = SyncTrees::default();
    trees
        .local
        .insert(local_file_entry(dir.path(), "empty.txt", Pending::New));

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    assert_eq!(
        trees.local.get_by_path("empty.txt").unwrap().applied,
        Some(Applied::Updated)
    );
}

#[tokio::test]
async fn changed_source_is_skipped_without_touching_the_destination() {
    let server = MockServer::start().await;

    let dir = tempdir().unwrap();
    write_local(dir.path(), "a.txt", b"fresh content", 2000).await;

    let (callback, events) = recording_progress();
    let mut propagator = make_propagator(&server, dir.path())
        .await
        .with_progress(callback);

    // Reconciliation saw an older version of the file.
    let mut entry = local_file_entry(dir.path(), "a.txt", Pending::Sync);
    entry.modtime = 1000;
    let mut trees = SyncTrees::default();
    trees.local.insert(entry);

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    let entry = trees.local.get_by_path("a.txt").unwrap();
    assert_eq!(entry.applied, None);
    assert!(entry.error_string.is_none());
    assert_eq!(propagator.journal.count().await.unwrap(), 0);
    // The transfer was announced but never finished.
    assert!(kinds(&events).contains(&ProgressKind::StartUpload));
    assert!(!kinds(&events).contains(&ProgressKind::FinishedUpload));
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn empty_reconciliation_is_a_no_op() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();

    let (callback, events) = recording_progress();
    let mut propagator = make_propagator(&server, dir.path())
        .await
        .with_progress(callback);
    let mut trees = SyncTrees::default();

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();
    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    assert_eq!(propagator.journal.count().await.unwrap(), 0);
    assert_eq!(
        kinds(&events),
        vec![
            ProgressKind::StartSyncSequence,
            ProgressKind::FinishedSyncSequence,
            ProgressKind::StartSyncSequence,
            ProgressKind::FinishedSyncSequence,
        ]
    );
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}
