use bytes::Buf;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::errors::IndexError;

/// Section locates a byte range inside a file or block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Section {
    pub offset: u64,
    pub size: u64,
}

impl Section {
    /// SIZE is the encoded size of a section: offset + size.
    pub const SIZE: usize = 16;

    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn max_offset(&self) -> u64 {
        self.offset + self.size
    }

    /// slice_of returns the bytes the section covers within data.
    pub fn slice_of<'a>(&self, data: &'a [u8]) -> anyhow::Result<&'a [u8]> {
        let start = self.offset as usize;
        let end = self.max_offset() as usize;
        if end > data.len() || start > end {
            return Err(IndexError::ShortBuffer.into());
        }
        Ok(&data[start..end])
    }

    pub async fn write_to<W: AsyncWrite + Send + Unpin>(&self, mut w: W) -> anyhow::Result<()> {
        w.write_u64(self.offset).await?;
        w.write_u64(self.size).await?;
        Ok(())
    }

    /// read_from decodes a section from the front of buf, returning it and
    /// the remainder.
    pub fn read_from(buf: &[u8]) -> anyhow::Result<(Self, &[u8])> {
        if buf.len() < Self::SIZE {
            return Err(IndexError::ShortBuffer.into());
        }

        let mut cur = buf;
        let offset = cur.get_u64();
        let size = cur.get_u64();
        Ok((Self { offset, size }, cur))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_section_round_trip() {
        let section = Section::new(42, 7);

        let mut buf = Vec::new();
        section.write_to(&mut buf).await.unwrap();
        assert_eq!(buf.len(), Section::SIZE);

        let (decoded, rest) = Section::read_from(&buf).unwrap();
        assert_eq!(decoded, section);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_section_slice_of() {
        let data = b"0123456789";
        let s = Section::new(2, 3);
        assert_eq!(s.slice_of(data).unwrap(), b"234");
        assert!(Section::new(8, 3).slice_of(data).is_err());
    }
}
