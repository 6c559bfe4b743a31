use wiremock::matchers::{body_bytes, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use driftsync_core::dav::{DavClient, DavConfig};
use driftsync_core::{HbfInfo, LocalFs, Side, Vio, VioErrorKind};

fn vio_for(server: &MockServer, root: &std::path::Path, chunk_size: usize) -> Vio {
    let remote = DavClient::with_config(
        &server.uri(),
        DavConfig {
            chunk_size,
            chunk_retries: 0,
        },
    )
    .unwrap();
    Vio::new(LocalFs::new(root), remote)
}

#[tokio::test]
async fn sendfile_uploads_in_chunks_and_advances_cursor() {
    let server = MockServer::start().await;
    for (index, body, is_final) in [(0u32, b"abcd", false), (1, b"efgh", false)] {
        Mock::given(method("PUT"))
            .and(path("/chunk/out.bin"))
            .and(query_param("chunk", index.to_string()))
            .and(query_param("final", if is_final { "1" } else { "0" }))
            .and(body_bytes(body.to_vec()))
            .respond_with(ResponseTemplate::new(201).insert_header("X-Transfer-Id", "9"))
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("PUT"))
        .and(path("/chunk/out.bin"))
        .and(query_param("chunk", "2"))
        .and(query_param("final", "1"))
        .and(body_bytes(b"ij".to_vec()))
        .respond_with(ResponseTemplate::new(201).insert_header("X-Transfer-Id", "9"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("in.bin"), b"abcdefghij").unwrap();
    let vio = vio_for(&server, dir.path(), 4);

    let mut src = vio.open_read(Side::Local, "in.bin", false).await.unwrap();
    let mut dst = vio.create(Side::Remote, "out.bin", false).await.unwrap();
    let mut hbf = HbfInfo::default();
    vio.sendfile(&mut src, &mut dst, &mut hbf).await.unwrap();

    assert_eq!(hbf.start_chunk, 3);
    assert_eq!(hbf.transfer_id, 9);
    vio.close(dst).await.unwrap();
    vio.close(src).await.unwrap();
}

#[tokio::test]
async fn sendfile_resumes_from_acknowledged_chunk() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/chunk/out.bin"))
        .and(query_param("chunk", "2"))
        .and(query_param("transfer", "42"))
        .and(query_param("final", "1"))
        .and(body_bytes(b"ij".to_vec()))
        .respond_with(ResponseTemplate::new(201).insert_header("X-Transfer-Id", "42"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("in.bin"), b"abcdefghij").unwrap();
    let vio = vio_for(&server, dir.path(), 4);

    let mut src = vio.open_read(Side::Local, "in.bin", false).await.unwrap();
    let mut dst = vio.create(Side::Remote, "out.bin", false).await.unwrap();
    let mut hbf = HbfInfo {
        start_chunk: 2,
        transfer_id: 42,
    };
    vio.sendfile(&mut src, &mut dst, &mut hbf).await.unwrap();
    assert_eq!(hbf.start_chunk, 3);
}

#[tokio::test]
async fn sendfile_download_appends_to_partial_destination() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/a.txt"))
        .and(wiremock::matchers::header("Range", "bytes=5-"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b" world"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.part"), b"hello").unwrap();
    let vio = vio_for(&server, dir.path(), 4);

    let mut src = vio.open_read(Side::Remote, "a.txt", false).await.unwrap();
    let mut dst = vio.open_append(Side::Local, "a.part").await.unwrap();
    let mut hbf = HbfInfo::default();
    vio.sendfile(&mut src, &mut dst, &mut hbf).await.unwrap();
    vio.close(dst).await.unwrap();

    assert_eq!(
        std::fs::read(dir.path().join("a.part")).unwrap(),
        b"hello world"
    );
}

#[tokio::test]
async fn bulk_put_streams_the_source_file() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/files/out.bin"))
        .and(body_bytes(b"payload".to_vec()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("in.bin"), b"payload").unwrap();
    let vio = vio_for(&server, dir.path(), 1024);

    let src = vio.open_read(Side::Local, "in.bin", false).await.unwrap();
    let mut dst = vio.create(Side::Remote, "out.bin", false).await.unwrap();
    vio.put(&src, &mut dst).await.unwrap();
    // Already committed by the bulk transfer: close must not re-transmit.
    vio.close(dst).await.unwrap();
    vio.close(src).await.unwrap();
}

#[tokio::test]
async fn bulk_get_writes_the_local_destination() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/in.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let vio = vio_for(&server, dir.path(), 1024);

    let mut src = vio.open_read(Side::Remote, "in.bin", false).await.unwrap();
    let mut dst = vio.create(Side::Local, "out.bin", true).await.unwrap();
    vio.get(&mut dst, &mut src).await.unwrap();
    vio.close(dst).await.unwrap();

    assert_eq!(std::fs::read(dir.path().join("out.bin")).unwrap(), b"payload");
}

#[tokio::test]
async fn remote_append_is_rejected_so_resume_falls_back() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let vio = vio_for(&server, dir.path(), 1024);

    let err = vio
        .open_append(Side::Remote, "partial.bin")
        .await
        .expect_err("remote partials cannot be reopened");
    assert_eq!(err.kind, VioErrorKind::NotFound);
}

#[tokio::test]
async fn mkdirs_creates_each_remote_collection() {
    let server = MockServer::start().await;
    for dir_path in ["/dirs/a", "/dirs/a/b", "/dirs/a/b/c"] {
        Mock::given(method("PUT"))
            .and(path(dir_path))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
    }

    let dir = tempfile::tempdir().unwrap();
    let vio = vio_for(&server, dir.path(), 1024);
    vio.mkdirs(Side::Remote, "a/b/c").await.unwrap();
}
