use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncReadExt;

use crate::status::{VioError, VioErrorKind};
use crate::vio::VioStat;

/// Local filesystem replica rooted at a directory. All operations take
/// POSIX-style paths relative to the root; escaping components are rejected.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

const XFER_BUF_SIZE: usize = 64 * 1024;

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, rel: &str) -> Result<PathBuf, VioError> {
        if rel.is_empty() {
            return Err(VioError::new(
                VioErrorKind::InvalidArgument,
                "empty replica path",
            ));
        }
        let mut out = self.root.clone();
        for component in Path::new(rel).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::RootDir | Component::CurDir => continue,
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(VioError::new(
                        VioErrorKind::InvalidArgument,
                        format!("{rel}: unsupported path component"),
                    ));
                }
            }
        }
        Ok(out)
    }

    /// Open read-only without following a symlink at the final component.
    /// `O_NOATIME` is requested only when the caller owns the file or runs
    /// as root; the kernel rejects it otherwise.
    pub async fn open_read(&self, rel: &str, noatime: bool) -> Result<File, VioError> {
        let path = self.resolve(rel)?;
        let mut flags = libc::O_NOFOLLOW;
        if noatime {
            flags |= libc::O_NOATIME;
        }
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(flags)
            .open(&path)
            .await?;
        Ok(file)
    }

    pub async fn create_excl(&self, rel: &str) -> Result<File, VioError> {
        let path = self.resolve(rel)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(file)
    }

    /// Reopen a partial destination for append; used to resume into a
    /// preserved temp file. Fails if the file vanished in the meantime.
    pub async fn open_append(&self, rel: &str) -> Result<File, VioError> {
        let path = self.resolve(rel)?;
        let file = OpenOptions::new().write(true).append(true).open(&path).await?;
        Ok(file)
    }

    pub async fn stat(&self, rel: &str) -> Result<VioStat, VioError> {
        let path = self.resolve(rel)?;
        let meta = tokio::fs::symlink_metadata(&path).await?;
        Ok(VioStat {
            size: meta.size() as i64,
            mtime: meta.mtime(),
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            inode: meta.ino(),
            file_id: None,
        })
    }

    pub async fn mkdirs(&self, rel: &str) -> Result<(), VioError> {
        let path = self.resolve(rel)?;
        tokio::fs::create_dir_all(&path).await?;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), VioError> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        tokio::fs::rename(&from, &to).await?;
        Ok(())
    }

    pub async fn unlink(&self, rel: &str) -> Result<(), VioError> {
        let path = self.resolve(rel)?;
        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    pub async fn rmdir(&self, rel: &str) -> Result<(), VioError> {
        let path = self.resolve(rel)?;
        tokio::fs::remove_dir(&path).await?;
        Ok(())
    }

    pub async fn chmod(&self, rel: &str, mode: u32) -> Result<(), VioError> {
        use std::os::unix::fs::PermissionsExt;
        let path = self.resolve(rel)?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o7777)).await?;
        Ok(())
    }

    pub async fn chown(&self, rel: &str, uid: u32, gid: u32) -> Result<(), VioError> {
        let path = self.resolve(rel)?;
        std::os::unix::fs::chown(&path, Some(uid), Some(gid))?;
        Ok(())
    }

    pub async fn set_mtime(&self, rel: &str, mtime: i64) -> Result<(), VioError> {
        let path = self.resolve(rel)?;
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(mtime, 0))?;
        Ok(())
    }

    /// Byte-wise comparison of two local files.
    pub async fn files_equal(&self, a: &str, b: &str) -> Result<bool, VioError> {
        let mut fa = File::open(self.resolve(a)?).await?;
        let mut fb = File::open(self.resolve(b)?).await?;
        let mut buf_a = vec![0u8; XFER_BUF_SIZE];
        let mut buf_b = vec![0u8; XFER_BUF_SIZE];
        loop {
            let na = read_full(&mut fa, &mut buf_a).await?;
            let nb = read_full(&mut fb, &mut buf_b).await?;
            if na != nb || buf_a[..na] != buf_b[..nb] {
                return Ok(false);
            }
            if na == 0 {
                return Ok(true);
            }
        }
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

pub fn current_uid() -> u32 {
    // SAFETY: getuid has no failure modes.
    unsafe { libc::getuid() }
}

pub fn current_euid() -> u32 {
    // SAFETY: geteuid has no failure modes.
    unsafe { libc::geteuid() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_rejects_parent_components() {
        let fs = LocalFs::new("/replica");
        assert!(matches!(
            fs.resolve("../secret"),
            Err(VioError {
                kind: VioErrorKind::InvalidArgument,
                ..
            })
        ));
        assert_eq!(
            fs.resolve("Docs/A.txt").unwrap(),
            PathBuf::from("/replica/Docs/A.txt")
        );
    }

    #[tokio::test]
    async fn create_excl_fails_on_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path());
        tokio::fs::write(dir.path().join("a.txt"), b"x").await.unwrap();
        let err = fs.create_excl("a.txt").await.expect_err("file exists");
        assert_eq!(err.kind, VioErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn rmdir_reports_not_empty() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path());
        tokio::fs::create_dir(dir.path().join("d")).await.unwrap();
        tokio::fs::write(dir.path().join("d/child"), b"x").await.unwrap();
        let err = fs.rmdir("d").await.expect_err("dir not empty");
        assert_eq!(err.kind, VioErrorKind::NotEmpty);
    }

    #[tokio::test]
    async fn set_mtime_is_observable_through_stat() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path());
        tokio::fs::write(dir.path().join("a.txt"), b"hello").await.unwrap();
        fs.set_mtime("a.txt", 1000).await.unwrap();
        let st = fs.stat("a.txt").await.unwrap();
        assert_eq!(st.mtime, 1000);
        assert_eq!(st.size, 5);
    }

    #[tokio::test]
    async fn files_equal_compares_bytewise() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path());
        tokio::fs::write(dir.path().join("a"), b"same content").await.unwrap();
        tokio::fs::write(dir.path().join("b"), b"same content").await.unwrap();
        tokio::fs::write(dir.path().join("c"), b"other content").await.unwrap();
        assert!(fs.files_equal("a", "b").await.unwrap());
        assert!(!fs.files_equal("a", "c").await.unwrap());
    }
}
