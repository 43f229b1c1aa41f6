use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::Writable;

/// WritableFile is an append-only file handle.
pub struct WritableFile {
    f: File,
}

impl WritableFile {
    /// create opens a new file for appending; the file must not exist.
    pub async fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let f = OpenOptions::new()
            .create_new(true)
            .write(true)
            .append(true)
            .open(path)
            .await?;

        Ok(Self { f })
    }

    /// open opens an existing file (creating it if absent) for appending.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .append(true)
            .open(path)
            .await?;

        Ok(Self { f })
    }
}

#[async_trait]
impl Writable for WritableFile {
    async fn append(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.f.write_all(data).await?;
        Ok(data.len())
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.f.flush().await
    }

    async fn sync(&self) -> std::io::Result<()> {
        self.f.sync_all().await
    }
}

#[cfg(test)]
mod tests {
    use crate::file::WritableFile;
    use crate::Writable;

    #[tokio::test]
    async fn test_append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join("append_test");

        {
            let mut f = WritableFile::create(&path).await.unwrap();
            f.append(b"one").await.unwrap();
            f.sync().await.unwrap();
        }
        {
            let mut f = WritableFile::open(&path).await.unwrap();
            f.append(b"two").await.unwrap();
            f.sync().await.unwrap();
        }

        let data = tokio::fs::read(&path).await.unwrap();
        assert_eq!(data, b"onetwo");
    }
}
