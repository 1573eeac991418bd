//! Metadata streams: the inode and directory tables are a concatenation of
//! 8 KiB blocks, each preceded by a two byte length header.

use crate::{Error, METADATA_BLOCK, METADATA_UNCOMPRESSED};

/// Accumulates the uncompressed contents of a metadata table.
#[derive(Debug, Default)]
pub(crate) struct MetadataWriter {
    buf: Vec<u8>,
}

impl MetadataWriter {
    /// Current uncompressed position.
    pub(crate) fn pos(&self) -> usize {
        self.buf.len()
    }

    /// Translate an uncompressed position into the on-disk start of its
    /// block (relative to the table) and the offset within it.
    pub(crate) fn locate(pos: usize) -> (u32, u16) {
        let block = pos / METADATA_BLOCK;
        let on_disk = block * (METADATA_BLOCK + 2);
        (on_disk as u32, (pos % METADATA_BLOCK) as u16)
    }

    pub(crate) fn put(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub(crate) fn put_u16(&mut self, v: u16) {
        self.put(&v.to_le_bytes());
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    /// Overwrite a previously written `u32`.
    pub(crate) fn patch_u32(&mut self, pos: usize, v: u32) {
        self.buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Render the table as it is stored on disk.
    pub(crate) fn to_blocks(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.buf.len() + 2 * self.buf.len().div_ceil(METADATA_BLOCK));
        for chunk in self.buf.chunks(METADATA_BLOCK) {
            out.extend_from_slice(&(chunk.len() as u16 | METADATA_UNCOMPRESSED).to_le_bytes());
            out.extend_from_slice(chunk);
        }
        out
    }
}

/// The uncompressed contents of an on-disk metadata table, with the
/// position of every block.
#[derive(Debug)]
pub(crate) struct MetadataTable {
    pub(crate) data: Vec<u8>,
    /// (on-disk offset relative to the table, uncompressed position)
    blocks: Vec<(u32, usize)>,
}

impl MetadataTable {
    pub(crate) fn parse(raw: &[u8]) -> Result<Self, Error> {
        let mut data = Vec::new();
        let mut blocks = Vec::new();
        let mut off = 0usize;
        while off + 2 <= raw.len() {
            let header = u16::from_le_bytes([raw[off], raw[off + 1]]);
            if header & METADATA_UNCOMPRESSED == 0 {
                return Err(Error::Corrupt("compressed metadata block".into()));
            }
            let len = (header & !METADATA_UNCOMPRESSED) as usize;
            let body = raw
                .get(off + 2..off + 2 + len)
                .ok_or_else(|| Error::Corrupt("truncated metadata block".into()))?;
            blocks.push((off as u32, data.len()));
            data.extend_from_slice(body);
            off += 2 + len;
        }
        Ok(Self { data, blocks })
    }

    /// Resolve a (block, offset) pair to an uncompressed position.
    pub(crate) fn resolve(&self, block: u32, offset: u16) -> Result<usize, Error> {
        self.blocks
            .iter()
            .find(|(b, _)| *b == block)
            .map(|(_, pos)| pos + offset as usize)
            .ok_or_else(|| Error::Corrupt(format!("no metadata block at {block}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_and_resolve() -> Result<(), Error> {
        let mut w = MetadataWriter::default();
        let payload: Vec<u8> = (0..20000u32).map(|i| i as u8).collect();
        w.put(&payload);
        let blocks = w.to_blocks();
        assert_eq!(blocks.len(), payload.len() + 3 * 2);
        assert_eq!(u16::from_le_bytes([blocks[0], blocks[1]]), 0x8000 | 8192);

        let (block, offset) = MetadataWriter::locate(12345);
        assert_eq!((block, offset), (8194, 12345 - 8192));
        let t = MetadataTable::parse(&blocks)?;
        assert_eq!(t.data, payload);
        let pos = t.resolve(block, offset)?;
        assert_eq!(t.data[pos], payload[12345]);
        assert!(t.resolve(17, 0).is_err());
        Ok(())
    }

    #[test]
    fn test_patch() {
        let mut w = MetadataWriter::default();
        w.put_u16(7);
        w.put_u32(0);
        w.patch_u32(2, 0xdeadbeef);
        assert_eq!(w.to_blocks()[4..], [0xef, 0xbe, 0xad, 0xde]);
    }
}
