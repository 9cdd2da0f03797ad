use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{invalid_range, OpGuard, StorageStream};

/// Append stream over a file on local disk.
#[derive(Debug)]
pub struct LocalFileStream {
    path: PathBuf,
    writer: Mutex<Option<File>>,
    outstanding: AtomicUsize,
}

impl LocalFileStream {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StorageStream for LocalFileStream {
    async fn append(&self, data: Bytes) -> io::Result<u64> {
        let _op = OpGuard::enter(&self.outstanding);
        let mut writer = self.writer.lock().await;
        if writer.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
            *writer = Some(file);
        }
        let Some(file) = writer.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "stream not open"));
        };
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(data.len() as u64)
    }

    async fn read(&self, range: Range<u64>) -> io::Result<Bytes> {
        let _op = OpGuard::enter(&self.outstanding);
        let size = fs::metadata(&self.path).await?.len();
        if range.start > range.end || range.end > size {
            return Err(invalid_range(&range, size));
        }
        let mut file = OpenOptions::new().read(true).open(&self.path).await?;
        file.seek(io::SeekFrom::Start(range.start)).await?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn exists(&self) -> io::Result<bool> {
        fs::try_exists(&self.path).await
    }

    async fn size(&self) -> io::Result<u64> {
        match fs::metadata(&self.path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn is_idle(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) == 0
    }

    async fn close(&self) -> io::Result<()> {
        if let Some(file) = self.writer.lock().await.take() {
            file.sync_all().await?;
        }
        Ok(())
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }
}
