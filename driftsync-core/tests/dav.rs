use serde_json::json;
use wiremock::matchers::{body_bytes, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use driftsync_core::dav::{DavClient, DavConfig};
use driftsync_core::VioErrorKind;

fn small_chunks(base: &str) -> DavClient {
    DavClient::with_config(
        base,
        DavConfig {
            chunk_size: 4,
            chunk_retries: 2,
        },
    )
    .unwrap()
}

#[tokio::test]
async fn stat_parses_remote_metadata() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/meta/Docs/A.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "size": 12,
            "mtime": 1000,
            "file_id": "fid-1"
        })))
        .mount(&server)
        .await;

    let client = DavClient::new(&server.uri()).unwrap();
    let stat = client.stat("Docs/A.txt").await.unwrap();

    assert_eq!(stat.size, 12);
    assert_eq!(stat.mtime, 1000);
    assert_eq!(stat.file_id.as_deref(), Some("fid-1"));
}

#[tokio::test]
async fn stat_maps_missing_path_to_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/meta/absent"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = DavClient::new(&server.uri()).unwrap();
    let err = client.stat("absent").await.expect_err("missing path");
    assert_eq!(err.kind, VioErrorKind::NotFound);
}

#[tokio::test]
async fn put_body_with_create_excl_sends_precondition() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/files/a.txt"))
        .and(header("If-None-Match", "*"))
        .and(body_bytes(b"payload"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let client = DavClient::new(&server.uri()).unwrap();
    client
        .put_body("a.txt", b"payload".to_vec(), true)
        .await
        .unwrap();
}

#[tokio::test]
async fn put_body_maps_existing_destination() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/files/a.txt"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    let client = DavClient::new(&server.uri()).unwrap();
    let err = client
        .put_body("a.txt", Vec::new(), true)
        .await
        .expect_err("existing destination");
    assert_eq!(err.kind, VioErrorKind::AlreadyExists);
}

#[tokio::test]
async fn put_chunk_returns_server_transfer_id() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/chunk/big.bin"))
        .and(query_param("chunk", "0"))
        .and(query_param("transfer", "0"))
        .and(query_param("final", "0"))
        .respond_with(ResponseTemplate::new(201).insert_header("X-Transfer-Id", "42"))
        .mount(&server)
        .await;

    let client = small_chunks(&server.uri());
    let id = client.put_chunk("big.bin", 0, 0, false, b"abcd").await.unwrap();
    assert_eq!(id, 42);
}

#[tokio::test]
async fn put_chunk_retries_rate_limited_requests() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/chunk/big.bin"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/chunk/big.bin"))
        .respond_with(ResponseTemplate::new(201).insert_header("X-Transfer-Id", "7"))
        .mount(&server)
        .await;

    let client = small_chunks(&server.uri());
    let id = client.put_chunk("big.bin", 1, 7, true, b"ab").await.unwrap();
    assert_eq!(id, 7);
}

#[tokio::test]
async fn put_chunk_does_not_retry_server_errors() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/chunk/big.bin"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let client = small_chunks(&server.uri());
    let err = client
        .put_chunk("big.bin", 0, 0, true, b"ab")
        .await
        .expect_err("server error");
    assert_eq!(err.kind, VioErrorKind::Io);
}

#[tokio::test]
async fn download_resume_sends_range_header() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/files/a.txt"))
        .and(header("Range", "bytes=5-"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b" world"))
        .mount(&server)
        .await;

    let client = DavClient::new(&server.uri()).unwrap();
    let mut download = client.download("a.txt", 5).await.unwrap();
    let mut out = Vec::new();
    while let Some(part) = download.chunk().await.unwrap() {
        out.extend_from_slice(&part);
    }
    assert_eq!(out, b" world");
}

#[tokio::test]
async fn cancelled_client_aborts_chunk_uploads() {
    let server = MockServer::start().await;
    let cancel = tokio_util::sync::CancellationToken::new();
    cancel.cancel();

    let client = small_chunks(&server.uri()).with_cancel(cancel);
    let err = client
        .put_chunk("big.bin", 0, 0, true, b"ab")
        .await
        .expect_err("cancelled before the first chunk");
    assert_eq!(err.kind, VioErrorKind::UserAbort);
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn rmdir_maps_conflict_to_not_empty() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/dirs/d"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let client = DavClient::new(&server.uri()).unwrap();
    let err = client.rmdir("d").await.expect_err("collection not empty");
    assert_eq!(err.kind, VioErrorKind::NotEmpty);
}

#[tokio::test]
async fn rename_carries_destination_header() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/move/old/x"))
        .and(header("X-Destination", "new/x"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let client = DavClient::new(&server.uri()).unwrap();
    client.rename("old/x", "new/x").await.unwrap();
}

#[tokio::test]
async fn set_mtime_posts_metadata() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/meta/a.txt"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = DavClient::new(&server.uri()).unwrap();
    client.set_mtime("a.txt", 1000).await.unwrap();
}
