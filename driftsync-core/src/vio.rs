use std::io::SeekFrom;
use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::dav::{DavClient, DavDownload};
use crate::local::LocalFs;
use crate::status::{VioError, VioErrorKind};

/// Which replica an operation targets. Passed per call; the gateway holds no
/// "current replica" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

/// Resumable-upload cursor: last acknowledged chunk and the server-assigned
/// transfer id. Updated in place by [`Vio::sendfile`] as chunks are acked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HbfInfo {
    pub start_chunk: u32,
    pub transfer_id: u64,
}

/// Unified stat result across backends. The remote side fills `file_id` and
/// leaves the POSIX fields zero; the local side is the reverse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VioStat {
    pub size: i64,
    pub mtime: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub inode: u64,
    pub file_id: Option<String>,
}

/// An open file on one of the replicas.
///
/// Local handles are real file descriptors. Remote read handles are lazy
/// download streams; remote write handles buffer until [`Vio::close`]
/// transmits them (or a bulk/chunked transfer marks them committed).
/// Dropping a handle without closing discards it: a partially written remote
/// buffer is never transmitted, and a local descriptor just closes.
#[derive(Debug)]
pub enum VioHandle {
    LocalFile {
        file: File,
        path: PathBuf,
    },
    RemoteRead {
        path: String,
        download: Option<DavDownload>,
        pending: Vec<u8>,
    },
    RemoteWrite {
        path: String,
        buf: Vec<u8>,
        excl: bool,
        committed: bool,
    },
}

/// Uniform operations against either replica.
#[derive(Debug, Clone)]
pub struct Vio {
    local: LocalFs,
    remote: DavClient,
}

const XFER_BUF_SIZE: usize = 64 * 1024;

impl Vio {
    pub fn new(local: LocalFs, remote: DavClient) -> Self {
        Self { local, remote }
    }

    pub fn local(&self) -> &LocalFs {
        &self.local
    }

    pub fn remote(&self) -> &DavClient {
        &self.remote
    }

    /// Full location of a replica path, for log and error messages.
    pub fn display(&self, side: Side, path: &str) -> String {
        match side {
            Side::Local => self.local.root().join(path).display().to_string(),
            Side::Remote => format!(
                "{}/{}",
                self.remote.base_url().as_str().trim_end_matches('/'),
                path
            ),
        }
    }

    pub async fn open_read(
        &self,
        side: Side,
        path: &str,
        noatime: bool,
    ) -> Result<VioHandle, VioError> {
        match side {
            Side::Local => Ok(VioHandle::LocalFile {
                file: self.local.open_read(path, noatime).await?,
                path: self.local.resolve(path)?,
            }),
            Side::Remote => Ok(VioHandle::RemoteRead {
                path: path.to_string(),
                download: None,
                pending: Vec::new(),
            }),
        }
    }

    /// Open a destination for writing. With `excl` an existing path is an
    /// error; without it the write replaces the destination (the atomic
    /// overwrite case). Remote handles transmit on close.
    pub async fn create(&self, side: Side, path: &str, excl: bool) -> Result<VioHandle, VioError> {
        match side {
            Side::Local => {
                let file = if excl {
                    self.local.create_excl(path).await?
                } else {
                    tokio::fs::File::create(self.local.resolve(path)?).await?
                };
                Ok(VioHandle::LocalFile {
                    file,
                    path: self.local.resolve(path)?,
                })
            }
            Side::Remote => Ok(VioHandle::RemoteWrite {
                path: path.to_string(),
                buf: Vec::new(),
                excl,
                committed: false,
            }),
        }
    }

    /// Reopen a partial destination for append, to resume into a preserved
    /// temp file. Only meaningful for local destinations; a remote partial
    /// cannot be appended to and reports not-found so the caller falls back
    /// to a fresh temp name.
    pub async fn open_append(&self, side: Side, path: &str) -> Result<VioHandle, VioError> {
        match side {
            Side::Local => Ok(VioHandle::LocalFile {
                file: self.local.open_append(path).await?,
                path: self.local.resolve(path)?,
            }),
            Side::Remote => Err(VioError::new(
                VioErrorKind::NotFound,
                format!("{path}: remote partials cannot be reopened"),
            )),
        }
    }

    pub async fn read(&self, handle: &mut VioHandle, buf: &mut [u8]) -> Result<usize, VioError> {
        match handle {
            VioHandle::LocalFile { file, .. } => Ok(file.read(buf).await?),
            VioHandle::RemoteRead {
                path,
                download,
                pending,
            } => loop {
                if !pending.is_empty() {
                    let n = buf.len().min(pending.len());
                    buf[..n].copy_from_slice(&pending[..n]);
                    pending.drain(..n);
                    return Ok(n);
                }
                if download.is_none() {
                    *download = Some(self.remote.download(path, 0).await?);
                }
                let Some(stream) = download.as_mut() else {
                    return Ok(0);
                };
                match stream.chunk().await? {
                    Some(part) => *pending = part,
                    None => return Ok(0),
                }
            },
            VioHandle::RemoteWrite { path, .. } => Err(VioError::new(
                VioErrorKind::InvalidArgument,
                format!("{path}: handle not open for reading"),
            )),
        }
    }

    /// Write the whole buffer; a short write is a failure.
    pub async fn write(&self, handle: &mut VioHandle, buf: &[u8]) -> Result<(), VioError> {
        match handle {
            VioHandle::LocalFile { file, .. } => {
                file.write_all(buf).await?;
                Ok(())
            }
            VioHandle::RemoteWrite { buf: pending, .. } => {
                pending.extend_from_slice(buf);
                Ok(())
            }
            VioHandle::RemoteRead { path, .. } => Err(VioError::new(
                VioErrorKind::InvalidArgument,
                format!("{path}: handle not open for writing"),
            )),
        }
    }

    /// Commit and release a handle. For a local destination this flushes and
    /// syncs, surfacing out-of-space errors here; for a buffered remote write
    /// it transmits the body unless a bulk or chunked transfer already did.
    pub async fn close(&self, handle: VioHandle) -> Result<(), VioError> {
        match handle {
            VioHandle::LocalFile { mut file, .. } => {
                file.flush().await?;
                file.sync_all().await?;
                Ok(())
            }
            VioHandle::RemoteRead { .. } => Ok(()),
            VioHandle::RemoteWrite {
                path,
                buf,
                excl,
                committed,
            } => {
                if committed {
                    Ok(())
                } else {
                    self.remote.put_body(&path, buf, excl).await
                }
            }
        }
    }

    /// One-shot bulk upload: source must be a local handle, destination a
    /// remote one.
    pub async fn put(&self, src: &VioHandle, dst: &mut VioHandle) -> Result<(), VioError> {
        match (src, dst) {
            (
                VioHandle::LocalFile { path, .. },
                VioHandle::RemoteWrite {
                    path: remote_path,
                    committed,
                    ..
                },
            ) => {
                self.remote.put_file(remote_path, path).await?;
                *committed = true;
                Ok(())
            }
            _ => Err(VioError::new(
                VioErrorKind::InvalidArgument,
                "put requires a local source and a remote destination",
            )),
        }
    }

    /// One-shot bulk download: source must be a remote handle, destination a
    /// local one.
    pub async fn get(&self, dst: &mut VioHandle, src: &mut VioHandle) -> Result<(), VioError> {
        match (src, dst) {
            (
                VioHandle::RemoteRead { path, .. },
                VioHandle::LocalFile { file, .. },
            ) => {
                let mut download = self.remote.download(path, 0).await?;
                while let Some(part) = download.chunk().await? {
                    file.write_all(&part).await?;
                }
                Ok(())
            }
            _ => Err(VioError::new(
                VioErrorKind::InvalidArgument,
                "get requires a remote source and a local destination",
            )),
        }
    }

    /// Stream data from source to destination with chunk resume.
    ///
    /// For an upload the cursor in `hbf` selects the first chunk to send and
    /// is advanced as the server acknowledges chunks, so a retry after a
    /// failure continues where the transfer stopped. For a download the
    /// resume offset is whatever the destination file already holds.
    pub async fn sendfile(
        &self,
        src: &mut VioHandle,
        dst: &mut VioHandle,
        hbf: &mut HbfInfo,
    ) -> Result<(), VioError> {
        match (src, dst) {
            (
                VioHandle::LocalFile { file, .. },
                VioHandle::RemoteWrite {
                    path, committed, ..
                },
            ) => {
                let len = file.metadata().await?.len();
                let chunk_size = self.remote.chunk_size() as u64;
                let nchunks = if len == 0 {
                    1
                } else {
                    len.div_ceil(chunk_size) as u32
                };
                let mut index = hbf.start_chunk.min(nchunks.saturating_sub(1));
                file.seek(SeekFrom::Start(u64::from(index) * chunk_size))
                    .await?;
                let mut buf = vec![0u8; chunk_size as usize];
                while index < nchunks {
                    let offset = u64::from(index) * chunk_size;
                    let want = (len.saturating_sub(offset)).min(chunk_size) as usize;
                    let got = read_full(file, &mut buf[..want]).await?;
                    if got < want {
                        return Err(VioError::new(
                            VioErrorKind::Io,
                            format!("{path}: source truncated during transfer"),
                        ));
                    }
                    let is_final = index + 1 == nchunks;
                    let id = self
                        .remote
                        .put_chunk(path, index, hbf.transfer_id, is_final, &buf[..got])
                        .await?;
                    hbf.transfer_id = id;
                    hbf.start_chunk = index + 1;
                    index += 1;
                }
                *committed = true;
                Ok(())
            }
            (
                VioHandle::RemoteRead { path, .. },
                VioHandle::LocalFile { file, .. },
            ) => {
                let offset = file.metadata().await?.len();
                let mut download = self.remote.download(path, offset).await?;
                while let Some(part) = download.chunk().await? {
                    file.write_all(&part).await?;
                }
                Ok(())
            }
            (
                VioHandle::LocalFile { file: sfp, .. },
                VioHandle::LocalFile { file: dfp, .. },
            ) => {
                let mut buf = vec![0u8; XFER_BUF_SIZE];
                loop {
                    let n = sfp.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    dfp.write_all(&buf[..n]).await?;
                }
                Ok(())
            }
            _ => Err(VioError::new(
                VioErrorKind::InvalidArgument,
                "unsupported sendfile handle combination",
            )),
        }
    }

    pub async fn stat(&self, side: Side, path: &str) -> Result<VioStat, VioError> {
        match side {
            Side::Local => self.local.stat(path).await,
            Side::Remote => {
                let stat = self.remote.stat(path).await?;
                Ok(VioStat {
                    size: stat.size,
                    mtime: stat.mtime,
                    file_id: stat.file_id,
                    ..VioStat::default()
                })
            }
        }
    }

    pub async fn mkdirs(&self, side: Side, path: &str) -> Result<(), VioError> {
        match side {
            Side::Local => self.local.mkdirs(path).await,
            Side::Remote => {
                let mut current = String::new();
                for part in path.split('/').filter(|part| !part.is_empty()) {
                    if current.is_empty() {
                        current = part.to_string();
                    } else {
                        current = format!("{current}/{part}");
                    }
                    match self.remote.mkcol(&current).await {
                        Ok(()) => {}
                        Err(err) if err.kind == VioErrorKind::AlreadyExists => {}
                        Err(err) => return Err(err),
                    }
                }
                Ok(())
            }
        }
    }

    pub async fn rename(&self, side: Side, from: &str, to: &str) -> Result<(), VioError> {
        match side {
            Side::Local => self.local.rename(from, to).await,
            Side::Remote => self.remote.rename(from, to).await,
        }
    }

    pub async fn unlink(&self, side: Side, path: &str) -> Result<(), VioError> {
        match side {
            Side::Local => self.local.unlink(path).await,
            Side::Remote => self.remote.unlink(path).await,
        }
    }

    pub async fn rmdir(&self, side: Side, path: &str) -> Result<(), VioError> {
        match side {
            Side::Local => self.local.rmdir(path).await,
            Side::Remote => self.remote.rmdir(path).await,
        }
    }

    /// Permissions are a local concept; the server manages its own.
    pub async fn chmod(&self, side: Side, path: &str, mode: u32) -> Result<(), VioError> {
        match side {
            Side::Local => self.local.chmod(path, mode).await,
            Side::Remote => Ok(()),
        }
    }

    pub async fn chown(&self, side: Side, path: &str, uid: u32, gid: u32) -> Result<(), VioError> {
        match side {
            Side::Local => self.local.chown(path, uid, gid).await,
            Side::Remote => Ok(()),
        }
    }

    pub async fn set_mtime(&self, side: Side, path: &str, mtime: i64) -> Result<(), VioError> {
        match side {
            Side::Local => self.local.set_mtime(path, mtime).await,
            Side::Remote => self.remote.set_mtime(path, mtime).await,
        }
    }

    /// Server-side fingerprint of a path. Always answered by the remote
    /// replica: local files have no ids.
    pub async fn file_id(&self, path: &str) -> Result<Option<String>, VioError> {
        self.remote.file_id(path).await
    }
}

async fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize, VioError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
