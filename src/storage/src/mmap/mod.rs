use std::fs::File;
use std::io;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

/// MmapFile is a read-only memory map of a file.
///
/// The map may be opened larger than the file (`open_sized`); bytes between
/// the file length and the map length become readable as the file grows
/// through a separate append handle, which is how the series file reads its
/// own tail without remapping.
pub struct MmapFile {
    f: File,
    len: usize,
    mmap: Mmap,
}

impl MmapFile {
    /// open maps the whole file.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let f = File::open(path)?;

        let meta = f.metadata()?;
        let len = meta.len() as usize;

        let mmap = unsafe { MmapOptions::new().offset(0).len(len).map(&f)? };

        Ok(Self { f, len, mmap })
    }

    /// open_sized maps `len` bytes regardless of the current file length.
    pub async fn open_sized(path: impl AsRef<Path>, len: usize) -> io::Result<Self> {
        let f = File::open(path)?;
        let mmap = unsafe { MmapOptions::new().offset(0).len(len).map(&f)? };
        Ok(Self { f, len, mmap })
    }

    /// len returns the mapped length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// as_slice returns the full mapped region.
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// slice returns the mapped bytes in [offset, offset+size).
    pub fn slice(&self, offset: usize, size: usize) -> io::Result<&[u8]> {
        let upper = offset + size;
        if upper > self.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "mmap slice out of range",
            ));
        }
        Ok(&self.mmap[offset..upper])
    }

    pub async fn close(self) -> io::Result<()> {
        drop(self.mmap);
        drop(self.f);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::fs::File;
    use tokio::io;
    use tokio::io::AsyncWriteExt;

    use crate::mmap::MmapFile;

    #[tokio::test]
    async fn test_mmap_file() -> io::Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join("mmap_test");

        let data = "0123456789".as_bytes();
        {
            let mut f = File::create(&path).await?;
            f.write_all(data).await?;
            f.sync_all().await?;
        }

        let accessor = MmapFile::open(&path).await?;
        assert_eq!(accessor.as_slice(), data);
        assert_eq!(accessor.slice(2, 3)?, b"234");
        assert!(accessor.slice(8, 3).is_err());

        Ok(())
    }

    #[tokio::test]
    async fn test_mmap_sized_sees_appends() -> io::Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join("mmap_grow");

        {
            let mut f = File::create(&path).await?;
            f.write_all(b"abc").await?;
            f.sync_all().await?;
        }

        let accessor = MmapFile::open_sized(&path, 1 << 16).await?;
        assert_eq!(accessor.slice(0, 3)?, b"abc");

        {
            let mut f = tokio::fs::OpenOptions::new().append(true).open(&path).await?;
            f.write_all(b"def").await?;
            f.sync_all().await?;
        }

        assert_eq!(accessor.slice(3, 3)?, b"def");
        Ok(())
    }
}
