#[tokio::test]
async fn server_error_mid_upload_cascades_to_ancestor_directories() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(url_path("/chunk/a/b/c.txt"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    write_local(dir.path(), "a/b/c.txt", b"contents", 1000).await;

    let mut propagator = make_propagator(&server, dir.path()).await;
    let mut trees = SyncTrees::default();
    trees.local.insert(Entry::dir("a", Pending::Sync));
    trees.local.insert(Entry::dir("a/b", Pending::Sync));
    trees
        .local
        .insert(local_file_entry(dir.path(), "a/b/c.txt", Pending::New));

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    let file = trees.local.get_by_path("a/b/c.txt").unwrap();
    assert_eq!(file.applied, Some(Applied::Error));
    assert!(file.error_string.as_deref().unwrap().contains("500"));

    for ancestor in ["a", "a/b"] {
        let entry = trees.local.get_by_path(ancestor).unwrap();
        assert_eq!(entry.applied, Some(Applied::Error), "{ancestor} not errored");
        assert_eq!(
            entry.error_string.as_deref(),
            Some("Error within the directory")
        );
    }

    let record = propagator
        .journal
        .get(file.phash, file.modtime, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.error, 1);
    // A server-side failure is not resumable: no temp file, no cursor.
    assert_eq!(record.tmpfile, None);
    assert_eq!(record.chunk, 0);
    assert_eq!(record.transfer_id, 0);
}

#[tokio::test]
async fn size_mismatch_after_download_discards_the_partial() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(url_path("/files/short.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc"))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let mut propagator = make_propagator(&server, dir.path()).await;
    let mut entry = Entry::file("short.bin", Pending::New);
    entry.size = 10;
    entry.modtime = 100;
    let mut trees = SyncTrees::default();
    trees.remote.insert(entry);

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    let entry = trees.remote.get_by_path("short.bin").unwrap();
    assert_eq!(entry.applied, Some(Applied::Error));
    assert!(!dir.path().join("short.bin").exists());
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|item| item.ok())
        .filter(|item| item.file_name().to_string_lossy().ends_with(".part"))
        .collect();
    assert!(leftovers.is_empty(), "partial temp file was kept");

    let record = propagator
        .journal
        .get(entry.phash, 100, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.error, 1);
    assert_eq!(record.tmpfile, None);
}

#[tokio::test]
async fn download_resumes_into_a_preserved_temp_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(url_path("/files/r.txt"))
        .and(header("Range", "bytes=3-"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"lo"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(url_path("/meta/r.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "size": 5,
            "mtime": 800,
            "file_id": "fid-5"
        })))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    write_local(dir.path(), ".r.txt.abc123.part", b"hel", 750).await;

    let mut propagator = make_propagator(&server, dir.path()).await;
    let mut entry = Entry::file("r.txt", Pending::Sync);
    entry.size = 5;
    entry.modtime = 800;
    let mut record = ResumeRecord::fresh(entry.phash, 800, None);
    record.tmpfile = Some(".r.txt.abc123.part".to_string());
    record.error = 1;
    propagator.journal.put(&record).await.unwrap();

    let mut trees = SyncTrees::default();
    trees.remote.insert(entry);

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    assert_eq!(std::fs::read(dir.path().join("r.txt")).unwrap(), b"hello");
    assert_eq!(
        trees.remote.get_by_path("r.txt").unwrap().applied,
        Some(Applied::Updated)
    );
    assert_eq!(propagator.journal.count().await.unwrap(), 0);
}

#[tokio::test]
async fn rename_is_followed_by_later_transfers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(url_path("/move/old/x"))
        .and(header("X-Destination", "new/x"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(url_path("/meta/new/x"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    // The child transfer must resolve against the renamed directory.
    Mock::given(method("GET"))
        .and(url_path("/files/new/x/sub.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(url_path("/meta/new/x/sub.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "size": 5,
            "mtime": 600,
            "file_id": "subfid"
        })))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let mut propagator = make_propagator(&server, dir.path()).await;

    let mut rename = Entry::dir("old/x", Pending::Rename);
    rename.destpath = Some("new/x".to_string());
    rename.fingerprint = Some("dirfid".to_string());
    rename.modtime = 500;
    let mut sub = Entry::file("old/x/sub.txt", Pending::Sync);
    sub.size = 5;
    sub.modtime = 600;

    let mut partner = Entry::dir("new/x", Pending::Sync);
    partner.modtime = 500;

    let mut trees = SyncTrees::default();
    trees.remote.insert(rename);
    trees.remote.insert(sub);
    trees.local.insert(partner);

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    let rename = trees.remote.get_by_path("old/x").unwrap();
    assert_eq!(rename.applied, Some(Applied::Deleted));

    // Directories inherit their fingerprint across a rename.
    let partner = trees.local.get_by_path("new/x").unwrap();
    assert_eq!(partner.fingerprint.as_deref(), Some("dirfid"));

    // The child landed under the adjusted local path.
    assert_eq!(
        std::fs::read(dir.path().join("new/x/sub.txt")).unwrap(),
        b"hello"
    );
    assert_eq!(
        trees.remote.get_by_path("old/x/sub.txt").unwrap().applied,
        Some(Applied::Updated)
    );
}

#[tokio::test]
async fn local_side_rename_fails_hard() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let mut propagator = make_propagator(&server, dir.path()).await;

    let mut entry = Entry::file("misplaced.txt", Pending::Rename);
    entry.destpath = Some("elsewhere.txt".to_string());
    let mut trees = SyncTrees::default();
    trees.local.insert(entry);

    let err = propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .expect_err("local renames are not supported");
    assert!(matches!(err, PropagateError::Fatal(_)));
    assert_eq!(propagator.status(), StatusCode::ParamError);
}

#[tokio::test]
async fn cancelled_token_aborts_at_the_entry_boundary() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    write_local(dir.path(), "pending.txt", b"data", 100).await;

    let cancel = tokio_util::sync::CancellationToken::new();
    cancel.cancel();
    let mut propagator = make_propagator(&server, dir.path())
        .await
        .with_cancel(cancel);

    let mut trees = SyncTrees::default();
    trees
        .local
        .insert(local_file_entry(dir.path(), "pending.txt", Pending::New));

    let err = propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .expect_err("cancelled before the first entry");
    assert!(matches!(err, PropagateError::Aborted));
    assert_eq!(propagator.status(), StatusCode::Aborted);
    assert_eq!(
        trees.local.get_by_path("pending.txt").unwrap().applied,
        None
    );
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn blacklisted_entry_is_skipped_and_its_counter_grows() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    write_local(dir.path(), "cursed.txt", b"data", 100).await;

    let mut propagator = make_propagator(&server, dir.path()).await;
    let entry = local_file_entry(dir.path(), "cursed.txt", Pending::Sync);
    let mut record = ResumeRecord::fresh(entry.phash, entry.modtime, None);
    record.error = 5;
    record.error_string = Some("previous failure".to_string());
    propagator.journal.put(&record).await.unwrap();

    let mut trees = SyncTrees::default();
    let phash = entry.phash;
    let modtime = entry.modtime;
    trees.local.insert(entry);

    propagator
        .run(&mut trees, &IgnoredFiles::default())
        .await
        .unwrap();

    let entry = trees.local.get_by_path("cursed.txt").unwrap();
    assert_eq!(entry.applied, Some(Applied::Error));
    assert_eq!(entry.error_string.as_deref(), Some("previous failure"));
    // The record is preserved and keeps counting.
    let record = propagator
        .journal
        .get(phash, modtime, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.error, 6);
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn preserved_partials_double_the_error_counter() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    write_local(dir.path(), ".v.bin.q1w2e3.part", b"partial bytes", 10).await;

    let propagator = make_propagator(&server, dir.path()).await;
    let mut entry = Entry::file("v.bin", Pending::Sync);
    entry.modtime = 900;

    // Transport failure with a non-empty partial: keep it for resumption.
    let mut xfer = FileCopy::new(Some(ResumeRecord::fresh(entry.phash, 900, None)));
    if let Some(record) = xfer.record.as_mut() {
        record.error = 3;
    }
    propagator
        .preserve_resume_state(
            Side::Local,
            ".v.bin.q1w2e3.part",
            true,
            &VioError::new(VioErrorKind::General, "connection reset"),
            &entry,
            &mut xfer,
        )
        .await;
    let record = xfer.record.as_ref().unwrap();
    assert!(xfer.tmp_detached);
    assert_eq!(record.tmpfile.as_deref(), Some(".v.bin.q1w2e3.part"));
    assert_eq!(record.error, 6);

    // A server-side I/O failure is non-resumable: the partial is dropped.
    let mut xfer = FileCopy::new(None);
    propagator
        .preserve_resume_state(
            Side::Local,
            ".v.bin.q1w2e3.part",
            true,
            &VioError::new(VioErrorKind::Io, "server returned 500"),
            &entry,
            &mut xfer,
        )
        .await;
    assert!(!xfer.tmp_detached);
    assert!(xfer.record.is_none());
}
