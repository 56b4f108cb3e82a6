//! SFTP sub-channel
//!
//! [`SftpChannel`] is the seam between the scheduling engine and the wire: the
//! queue and the health probe only ever talk to `Arc<dyn SftpChannel>`.
//! [`RusshSftpChannel`] is the production implementation over `russh-sftp`.

use async_trait::async_trait;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use std::io::SeekFrom;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use super::error::SftpError;
use super::path_utils::join_remote_path;
use super::types::{FileInfo, FileType};

/// File-transfer sub-channel multiplexed over a transport
#[async_trait]
pub trait SftpChannel: Send + Sync {
    /// List directory contents (without `.` and `..`)
    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SftpError>;

    async fn stat(&self, path: &str) -> Result<FileInfo, SftpError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SftpError>;

    /// Create or truncate `path` and write `content`
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SftpError>;

    /// Up to `len` bytes starting at `offset`; empty at end of file
    async fn read_chunk(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>, SftpError>;

    /// Write `data` at `offset`. Offset 0 creates or truncates the file.
    async fn write_chunk(&self, path: &str, offset: u64, data: &[u8]) -> Result<(), SftpError>;

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), SftpError>;

    async fn mkdir(&self, path: &str) -> Result<(), SftpError>;

    async fn remove_file(&self, path: &str) -> Result<(), SftpError>;

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError>;

    /// Change permission bits (`mode & 0o7777`)
    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), SftpError>;

    /// Best-effort close; calling it twice is harmless
    async fn close(&self) -> Result<(), SftpError>;
}

/// Delete a file or a directory tree, returning the number of removed entries
pub async fn delete_recursive(channel: &dyn SftpChannel, path: &str) -> Result<u64, SftpError> {
    let info = channel.stat(path).await?;
    let mut deleted = 0u64;

    if info.is_dir() {
        for entry in channel.read_dir(path).await? {
            // boxed to avoid infinite future size
            deleted += Box::pin(delete_recursive(channel, &entry.path)).await?;
        }
        channel.remove_dir(path).await?;
    } else {
        channel.remove_file(path).await?;
    }

    Ok(deleted + 1)
}

/// `russh-sftp` backed sub-channel
pub struct RusshSftpChannel {
    sftp: RusshSftpSession,
}

impl RusshSftpChannel {
    pub fn new(sftp: RusshSftpSession) -> Self {
        Self { sftp }
    }

    fn to_file_info(name: String, path: String, metadata: &FileAttributes) -> FileInfo {
        let file_type = if metadata.is_dir() {
            FileType::Directory
        } else if metadata.is_symlink() {
            FileType::Symlink
        } else if metadata.is_regular() {
            FileType::File
        } else {
            FileType::Unknown
        };

        FileInfo {
            name,
            path,
            file_type,
            size: metadata.size.unwrap_or(0),
            modified: metadata.mtime.map(|t| t as i64).unwrap_or(0),
            permissions: metadata
                .permissions
                .map(|p| format!("{:o}", p & 0o777))
                .unwrap_or_else(|| "000".to_string()),
        }
    }
}

#[async_trait]
impl SftpChannel for RusshSftpChannel {
    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SftpError> {
        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let full_path = join_remote_path(path, &name);
            entries.push(Self::to_file_info(name, full_path, &entry.metadata()));
        }

        debug!("Listed {} entries in {}", entries.len(), path);
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, SftpError> {
        let metadata = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        Ok(Self::to_file_info(name, path.to_string(), &metadata))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SftpError> {
        let mut file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| SftpError::ProtocolError(format!("Failed to read {}: {}", path, e)))?;
        Ok(buf)
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SftpError> {
        let mut file = self
            .sftp
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;

        file.write_all(content)
            .await
            .map_err(|e| SftpError::WriteError(format!("Failed to write content: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| SftpError::WriteError(format!("Failed to flush file: {}", e)))?;

        info!("Wrote {} bytes to {}", content.len(), path);
        Ok(())
    }

    async fn read_chunk(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>, SftpError> {
        let mut file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| SftpError::ProtocolError(format!("Failed to seek {}: {}", path, e)))?;

        let mut buf = Vec::with_capacity(len);
        file.take(len as u64)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| SftpError::ProtocolError(format!("Failed to read {}: {}", path, e)))?;
        Ok(buf)
    }

    async fn write_chunk(&self, path: &str, offset: u64, data: &[u8]) -> Result<(), SftpError> {
        let flags = if offset == 0 {
            OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE
        } else {
            OpenFlags::WRITE
        };
        let mut file = self
            .sftp
            .open_with_flags(path, flags)
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;

        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| SftpError::WriteError(format!("Failed to seek {}: {}", path, e)))?;
        }
        file.write_all(data)
            .await
            .map_err(|e| SftpError::WriteError(format!("Failed to write content: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| SftpError::WriteError(format!("Failed to flush file: {}", e)))?;
        debug!("Wrote {} bytes to {} at offset {}", data.len(), path, offset);
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), SftpError> {
        self.sftp
            .rename(old_path, new_path)
            .await
            .map_err(|e| SftpError::from_remote(e, old_path))
    }

    async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        let mut attrs = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;
        let current = attrs.permissions.unwrap_or(0);
        // setstat 只携带权限位，避免顺带改写 size/uid/时间戳
        attrs.permissions = Some((current & !0o7777) | (mode & 0o7777));
        attrs.size = None;
        attrs.uid = None;
        attrs.gid = None;
        attrs.atime = None;
        attrs.mtime = None;
        self.sftp
            .set_metadata(path, attrs)
            .await
            .map_err(|e| SftpError::from_remote(e, path))
    }

    async fn close(&self) -> Result<(), SftpError> {
        self.sftp
            .close()
            .await
            .map_err(|e| SftpError::ChannelError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChannel;

    #[tokio::test]
    async fn test_delete_recursive_counts_entries() {
        let channel = MockChannel::new();
        channel.add_dir("/data");
        channel.add_dir("/data/sub");
        channel.add_file("/data/a.txt", b"a");
        channel.add_file("/data/sub/b.txt", b"b");

        let removed = delete_recursive(&channel, "/data").await.unwrap();
        assert_eq!(removed, 4);
        assert!(channel.stat("/data").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_recursive_missing_path() {
        let channel = MockChannel::new();
        let err = delete_recursive(&channel, "/nope").await.unwrap_err();
        assert_eq!(err, SftpError::FileNotFound("/nope".into()));
    }
}
