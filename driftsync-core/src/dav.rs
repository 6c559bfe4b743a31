use std::{env, pin::Pin};

use futures_util::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::backoff::RetryBackoff;
use crate::status::{VioError, VioErrorKind};

/// Remote replica backend speaking a DAV-style HTTP protocol.
///
/// Files live under `files/<path>`, metadata under `meta/<path>`, collections
/// under `dirs/<path>`. Uploads may be chunked through `chunk/<path>`; the
/// server acknowledges every chunk with an `X-Transfer-Id` header so an
/// interrupted upload can be resumed against the same server-side transfer.
#[derive(Clone)]
pub struct DavClient {
    http: Client,
    base_url: Url,
    chunk_size: usize,
    chunk_retries: u32,
    backoff: RetryBackoff,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
pub struct DavConfig {
    pub chunk_size: usize,
    pub chunk_retries: u32,
}

impl Default for DavConfig {
    fn default() -> Self {
        Self {
            chunk_size: read_limit("DRIFTSYNC_CHUNK_SIZE", 4 * 1024 * 1024),
            chunk_retries: read_limit("DRIFTSYNC_CHUNK_RETRIES", 3) as u32,
        }
    }
}

/// Server-side metadata for one remote path.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteStat {
    pub size: i64,
    pub mtime: i64,
    #[serde(default)]
    pub file_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct MtimePayload {
    mtime: i64,
}

const TRANSFER_ID_HEADER: &str = "X-Transfer-Id";
const DESTINATION_HEADER: &str = "X-Destination";

impl DavClient {
    pub fn new(base_url: &str) -> Result<Self, VioError> {
        Self::with_config(base_url, DavConfig::default())
    }

    pub fn with_config(base_url: &str, config: DavConfig) -> Result<Self, VioError> {
        let base_url = Url::parse(base_url)
            .map_err(|err| VioError::new(VioErrorKind::InvalidArgument, err.to_string()))?;
        Ok(Self {
            http: Client::new(),
            base_url,
            chunk_size: config.chunk_size.max(1),
            chunk_retries: config.chunk_retries,
            backoff: RetryBackoff::default(),
            cancel: CancellationToken::new(),
        })
    }

    /// Token observed between chunks and stream reads; a cancelled token makes
    /// in-flight transfers fail with a user-abort error.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn stat(&self, path: &str) -> Result<RemoteStat, VioError> {
        let url = self.endpoint("meta", path)?;
        let response = self.send(self.http.get(url)).await?;
        if response.status().is_success() {
            response
                .json::<RemoteStat>()
                .await
                .map_err(|err| VioError::new(VioErrorKind::General, err.to_string()))
        } else {
            Err(Self::fail(path, "stat", response).await)
        }
    }

    pub async fn file_id(&self, path: &str) -> Result<Option<String>, VioError> {
        Ok(self.stat(path).await?.file_id)
    }

    pub async fn set_mtime(&self, path: &str, mtime: i64) -> Result<(), VioError> {
        let url = self.endpoint("meta", path)?;
        let response = self
            .send(self.http.post(url).json(&MtimePayload { mtime }))
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::fail(path, "set_mtime", response).await)
        }
    }

    /// Streaming download starting at `offset` (a non-zero offset resumes an
    /// interrupted fetch by appending to a partial file).
    pub async fn download(&self, path: &str, offset: u64) -> Result<DavDownload, VioError> {
        let url = self.endpoint("files", path)?;
        let mut request = self.http.get(url);
        if offset > 0 {
            request = request.header("Range", format!("bytes={offset}-"));
        }
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(Self::fail(path, "download", response).await);
        }
        let cancel = self.cancel.clone();
        let stream = response.bytes_stream().map(|part| part.map(|b| b.to_vec()));
        Ok(DavDownload {
            stream: Box::pin(stream),
            cancel,
        })
    }

    /// One-shot streaming upload from a local file.
    pub async fn put_file(&self, path: &str, source: &std::path::Path) -> Result<(), VioError> {
        let url = self.endpoint("files", path)?;
        let file = tokio::fs::File::open(source).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let response = self.send(self.http.put(url).body(body)).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::fail(path, "put", response).await)
        }
    }

    /// Buffered upload; with `create_excl` the request carries
    /// `If-None-Match: *` and an existing destination fails with
    /// [`VioErrorKind::AlreadyExists`].
    pub async fn put_body(
        &self,
        path: &str,
        body: Vec<u8>,
        create_excl: bool,
    ) -> Result<(), VioError> {
        let url = self.endpoint("files", path)?;
        let mut request = self.http.put(url).body(body);
        if create_excl {
            request = request.header("If-None-Match", "*");
        }
        let response = self.send(request).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::fail(path, "put", response).await)
        }
    }

    /// Upload one chunk of a resumable transfer. Returns the server-assigned
    /// transfer id to pass with the next chunk. Transient failures (rate
    /// limiting, timeouts, connection resets) are retried with backoff;
    /// server errors are not, as the server discards the transfer state.
    pub async fn put_chunk(
        &self,
        path: &str,
        chunk: u32,
        transfer_id: u64,
        is_final: bool,
        body: &[u8],
    ) -> Result<u64, VioError> {
        let mut url = self.endpoint("chunk", path)?;
        url.query_pairs_mut()
            .append_pair("chunk", &chunk.to_string())
            .append_pair("transfer", &transfer_id.to_string())
            .append_pair("final", if is_final { "1" } else { "0" });

        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(VioError::aborted());
            }
            let result = self
                .http
                .put(url.clone())
                .body(body.to_vec())
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    let id = response
                        .headers()
                        .get(TRANSFER_ID_HEADER)
                        .and_then(|value| value.to_str().ok())
                        .and_then(|value| value.parse::<u64>().ok())
                        .unwrap_or(transfer_id);
                    return Ok(id);
                }
                Ok(response) if is_transient_status(response.status()) && attempt < self.chunk_retries => {
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                    attempt += 1;
                }
                Ok(response) => return Err(Self::fail(path, "put_chunk", response).await),
                Err(err) if err.is_connect() && attempt < self.chunk_retries => {
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(VioError::new(VioErrorKind::General, err.to_string())),
            }
        }
    }

    pub async fn mkcol(&self, path: &str) -> Result<(), VioError> {
        let url = self.endpoint("dirs", path)?;
        let response = self.send(self.http.put(url)).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::fail(path, "mkcol", response).await)
        }
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), VioError> {
        let url = self.endpoint("move", from)?;
        let response = self
            .send(self.http.post(url).header(DESTINATION_HEADER, to))
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::fail(from, "rename", response).await)
        }
    }

    pub async fn unlink(&self, path: &str) -> Result<(), VioError> {
        let url = self.endpoint("files", path)?;
        let response = self.send(self.http.delete(url)).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::fail(path, "unlink", response).await)
        }
    }

    pub async fn rmdir(&self, path: &str) -> Result<(), VioError> {
        let url = self.endpoint("dirs", path)?;
        let response = self.send(self.http.delete(url)).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::CONFLICT {
            Err(VioError::new(
                VioErrorKind::NotEmpty,
                format!("{path}: collection not empty"),
            ))
        } else {
            Err(Self::fail(path, "rmdir", response).await)
        }
    }

    fn endpoint(&self, prefix: &str, path: &str) -> Result<Url, VioError> {
        let rel = format!("{prefix}/{}", path.trim_start_matches('/'));
        self.base_url
            .join(&rel)
            .map_err(|err| VioError::new(VioErrorKind::InvalidArgument, err.to_string()))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, VioError> {
        if self.cancel.is_cancelled() {
            return Err(VioError::aborted());
        }
        request
            .send()
            .await
            .map_err(|err| VioError::new(VioErrorKind::General, err.to_string()))
    }

    async fn fail(path: &str, op: &str, response: reqwest::Response) -> VioError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        VioError::new(
            classify_http_status(status),
            format!("{path}: {op} returned {status}: {body}"),
        )
    }
}

fn classify_http_status(status: StatusCode) -> VioErrorKind {
    match status {
        StatusCode::NOT_FOUND => VioErrorKind::NotFound,
        StatusCode::PRECONDITION_FAILED => VioErrorKind::AlreadyExists,
        StatusCode::INSUFFICIENT_STORAGE => VioErrorKind::NoSpace,
        // Writing into a missing parent collection.
        StatusCode::CONFLICT => VioErrorKind::NotFound,
        status if status.is_server_error() => VioErrorKind::Io,
        _ => VioErrorKind::General,
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT
    )
}

/// Streaming download body; chunks arrive as the server sends them.
pub struct DavDownload {
    stream: Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for DavDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DavDownload").finish_non_exhaustive()
    }
}

impl DavDownload {
    /// Next chunk of the body, or `None` at end of stream.
    pub async fn chunk(&mut self) -> Result<Option<Vec<u8>>, VioError> {
        if self.cancel.is_cancelled() {
            return Err(VioError::aborted());
        }
        match self.stream.next().await {
            Some(Ok(part)) => Ok(Some(part)),
            Some(Err(err)) => Err(VioError::new(VioErrorKind::Io, err.to_string())),
            None => Ok(None),
        }
    }
}

fn read_limit(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

impl std::fmt::Debug for DavClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DavClient")
            .field("base_url", &self.base_url.as_str())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}
