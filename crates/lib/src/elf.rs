//! Minimal ELF inspection: validating toolchain output and reading build IDs.

use std::io::{Read, Seek, SeekFrom};

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

const MAGIC: &[u8; 4] = b"\x7fELF";
const CLASS_32: u8 = 1;
const CLASS_64: u8 = 2;
const DATA_LE: u8 = 1;
const DATA_BE: u8 = 2;
const PT_NOTE: u32 = 4;
const NOTE_GNU_BUILD_ID: u32 = 3;
const NOTE_GO_BUILD_ID: u32 = 4;
/// Notes larger than this are not build IDs.
const MAX_NOTE_SEGMENT: u64 = 1 << 20;

#[derive(Debug, Clone, Copy)]
struct Ident {
    class: u8,
    big_endian: bool,
}

impl Ident {
    fn u16(&self, b: &[u8], off: usize) -> Option<u16> {
        let b: [u8; 2] = b.get(off..off + 2)?.try_into().ok()?;
        Some(if self.big_endian {
            u16::from_be_bytes(b)
        } else {
            u16::from_le_bytes(b)
        })
    }

    fn u32(&self, b: &[u8], off: usize) -> Option<u32> {
        let b: [u8; 4] = b.get(off..off + 4)?.try_into().ok()?;
        Some(if self.big_endian {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        })
    }

    fn u64(&self, b: &[u8], off: usize) -> Option<u64> {
        let b: [u8; 8] = b.get(off..off + 8)?.try_into().ok()?;
        Some(if self.big_endian {
            u64::from_be_bytes(b)
        } else {
            u64::from_le_bytes(b)
        })
    }

    /// Read an address-sized field.
    fn addr(&self, b: &[u8], off: usize) -> Option<u64> {
        if self.class == CLASS_64 {
            self.u64(b, off)
        } else {
            self.u32(b, off).map(u64::from)
        }
    }
}

fn parse_ident(header: &[u8]) -> Result<Ident> {
    anyhow::ensure!(
        header.len() >= 16 && &header[..4] == MAGIC,
        "not an ELF file (bad magic)"
    );
    let class = header[4];
    anyhow::ensure!(
        class == CLASS_32 || class == CLASS_64,
        "unknown ELF class {class}"
    );
    let big_endian = match header[5] {
        DATA_LE => false,
        DATA_BE => true,
        o => anyhow::bail!("unknown ELF data encoding {o}"),
    };
    Ok(Ident { class, big_endian })
}

/// Check that `path` is an ELF file. Build failures of the toolchain have
/// been known to leave other things behind.
#[context("Validating ELF {path}")]
pub fn validate(path: &Utf8Path) -> Result<()> {
    let mut f = std::fs::File::open(path)?;
    let mut header = [0u8; 16];
    f.read_exact(&mut header).context("Reading ELF header")?;
    parse_ident(&header)?;
    Ok(())
}

/// The build ID of the executable at `path`: the Go build ID if present,
/// else the hex encoded GNU build ID.
#[context("Reading build ID of {path}")]
pub fn build_id(path: &Utf8Path) -> Result<Option<String>> {
    let mut f = std::fs::File::open(path)?;
    let mut header = [0u8; 64];
    let n = f.read(&mut header)?;
    let header = &header[..n];
    let id = parse_ident(header)?;
    let malformed = || anyhow::anyhow!("truncated ELF header");
    let (phoff, phentsize, phnum) = if id.class == CLASS_64 {
        (
            id.u64(header, 32).ok_or_else(malformed)?,
            id.u16(header, 54).ok_or_else(malformed)?,
            id.u16(header, 56).ok_or_else(malformed)?,
        )
    } else {
        (
            u64::from(id.u32(header, 28).ok_or_else(malformed)?),
            id.u16(header, 42).ok_or_else(malformed)?,
            id.u16(header, 44).ok_or_else(malformed)?,
        )
    };

    let mut phdrs = vec![0u8; usize::from(phentsize) * usize::from(phnum)];
    f.seek(SeekFrom::Start(phoff))?;
    f.read_exact(&mut phdrs).context("Reading program headers")?;

    let mut gnu = None;
    for ph in phdrs.chunks_exact(usize::from(phentsize).max(1)) {
        if id.u32(ph, 0) != Some(PT_NOTE) {
            continue;
        }
        let (offset, filesz) = if id.class == CLASS_64 {
            (id.addr(ph, 8), id.addr(ph, 32))
        } else {
            (id.addr(ph, 4), id.addr(ph, 16))
        };
        let (Some(offset), Some(filesz)) = (offset, filesz) else {
            continue;
        };
        if filesz > MAX_NOTE_SEGMENT {
            continue;
        }
        let mut notes = vec![0u8; filesz as usize];
        f.seek(SeekFrom::Start(offset))?;
        f.read_exact(&mut notes).context("Reading note segment")?;
        for (name, ntype, desc) in parse_notes(id, &notes) {
            match (name, ntype) {
                (b"Go", NOTE_GO_BUILD_ID) => {
                    return Ok(Some(String::from_utf8_lossy(desc).into_owned()))
                }
                (b"GNU", NOTE_GNU_BUILD_ID) => gnu = Some(hex::encode(desc)),
                _ => {}
            }
        }
    }
    Ok(gnu)
}

/// Iterate the `(name, type, descriptor)` triples of a note segment. Names
/// are returned without their NUL terminator.
fn parse_notes(id: Ident, mut buf: &[u8]) -> Vec<(&[u8], u32, &[u8])> {
    let align4 = |n: usize| n.div_ceil(4) * 4;
    let mut out = Vec::new();
    while let (Some(namesz), Some(descsz), Some(ntype)) =
        (id.u32(buf, 0), id.u32(buf, 4), id.u32(buf, 8))
    {
        let (namesz, descsz) = (namesz as usize, descsz as usize);
        let name_end = 12 + namesz;
        let desc_start = 12 + align4(namesz);
        let desc_end = desc_start + descsz;
        let (Some(name), Some(desc)) = (buf.get(12..name_end), buf.get(desc_start..desc_end))
        else {
            break;
        };
        let name = name.strip_suffix(b"\0").unwrap_or(name);
        out.push((name, ntype, desc));
        buf = buf.get(align4(desc_end)..).unwrap_or_default();
    }
    out
}
