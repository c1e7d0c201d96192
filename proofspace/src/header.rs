//! Plot file header.
//!
//! Layout (bit-exact):
//! ```text
//! +----------------------+--------------------------------------+
//! | 19 bytes             | "Proof of Space Plot"                |
//! | 32 bytes             | plot id                              |
//! | 1 byte               | k                                    |
//! | 2 bytes BE           | format description length            |
//! | n bytes              | format description ("v1.0")          |
//! | 2 bytes BE           | memo length                          |
//! | n bytes              | memo                                 |
//! | 80 bytes             | 10 x u64 BE table start offsets      |
//! |                      | [T1..T7, C1, C2, C3]                 |
//! +----------------------+--------------------------------------+
//! ```
//! The pointer slots are written as zeros when the file is created and
//! patched with the real offsets at the end of Phase 4.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::{Cursor, Read};

use crate::constants::{FORMAT_DESCRIPTION, HEADER_MAGIC, K_ID_LEN, K_MAX_PLOT_SIZE, K_MIN_PLOT_SIZE};
use crate::disk::FileDisk;
use crate::{PosError, Result};

/// Parsed header of an existing plot.
#[derive(Debug, Clone)]
pub struct PlotHeader {
    pub k: u32,
    pub id: [u8; K_ID_LEN],
    pub memo: Vec<u8>,
    /// Absolute byte offsets; index 1..=7 are tables, 8..=10 are C1..C3.
    /// Index 0 is unused.
    pub table_begin: [u64; 11],
    pub header_size: u32,
}

/// Writes a fresh header with zeroed pointer slots; returns its size.
pub fn write_header(disk: &mut FileDisk, k: u32, id: &[u8; K_ID_LEN], memo: &[u8]) -> Result<u32> {
    let mut pos = 0u64;
    disk.write(pos, HEADER_MAGIC)?;
    pos += HEADER_MAGIC.len() as u64;
    disk.write(pos, id)?;
    pos += K_ID_LEN as u64;
    disk.write(pos, &[k as u8])?;
    pos += 1;

    let mut len2 = [0u8; 2];
    BigEndian::write_u16(&mut len2, FORMAT_DESCRIPTION.len() as u16);
    disk.write(pos, &len2)?;
    pos += 2;
    disk.write(pos, FORMAT_DESCRIPTION.as_bytes())?;
    pos += FORMAT_DESCRIPTION.len() as u64;

    BigEndian::write_u16(&mut len2, memo.len() as u16);
    disk.write(pos, &len2)?;
    pos += 2;
    disk.write(pos, memo)?;
    pos += memo.len() as u64;

    disk.write(pos, &[0u8; 80])?;
    pos += 80;
    log::debug!("wrote {pos} header bytes");
    Ok(pos as u32)
}

/// Overwrites the 10 pointer slots at the tail of the header.
pub fn patch_pointers(disk: &mut FileDisk, header_size: u32, pointers: &[u64; 11]) -> Result<()> {
    let mut buf = [0u8; 80];
    for (i, slot) in buf.chunks_exact_mut(8).enumerate() {
        BigEndian::write_u64(slot, pointers[i + 1]);
    }
    disk.write(header_size as u64 - 80, &buf)?;
    disk.flush()
}

/// Parses and validates the header of an existing plot file.
pub fn parse_header(disk: &mut FileDisk) -> Result<PlotHeader> {
    let mut fixed = [0u8; 19 + 32 + 1 + 2];
    disk.read(0, &mut fixed)?;
    let mut cursor = Cursor::new(&fixed[..]);

    let mut magic = [0u8; 19];
    cursor.read_exact(&mut magic)?;
    if &magic != HEADER_MAGIC {
        return Err(PosError::InvalidValue("not a plot file".into()));
    }
    let mut id = [0u8; K_ID_LEN];
    cursor.read_exact(&mut id)?;
    let k = cursor.read_u8()? as u32;
    if !(K_MIN_PLOT_SIZE..=K_MAX_PLOT_SIZE).contains(&k) {
        return Err(PosError::InvalidValue(format!("invalid k in header: {k}")));
    }
    let fd_len = cursor.read_u16::<BigEndian>()? as usize;

    let mut fd = vec![0u8; fd_len];
    disk.read(fixed.len() as u64, &mut fd)?;
    if fd != FORMAT_DESCRIPTION.as_bytes() {
        return Err(PosError::InvalidValue(format!(
            "unsupported plot format: {}",
            String::from_utf8_lossy(&fd)
        )));
    }
    let mut pos = fixed.len() as u64 + fd_len as u64;

    let mut len2 = [0u8; 2];
    disk.read(pos, &mut len2)?;
    pos += 2;
    let memo_len = BigEndian::read_u16(&len2) as usize;
    let mut memo = vec![0u8; memo_len];
    disk.read(pos, &mut memo)?;
    pos += memo_len as u64;

    let mut slots = [0u8; 80];
    disk.read(pos, &mut slots)?;
    pos += 80;
    let mut table_begin = [0u64; 11];
    for (i, slot) in slots.chunks_exact(8).enumerate() {
        table_begin[i + 1] = BigEndian::read_u64(slot);
    }

    Ok(PlotHeader {
        k,
        id,
        memo,
        table_begin,
        header_size: pos as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_header_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h.plot");
        let id = [0xAB; 32];
        let memo = vec![0xCA, 0xFE];
        let mut disk = FileDisk::create(&path).unwrap();
        let size = write_header(&mut disk, 20, &id, &memo).unwrap();
        assert_eq!(size, 19 + 32 + 1 + 2 + 4 + 2 + 2 + 80);

        let mut pointers = [0u64; 11];
        for (i, p) in pointers.iter_mut().enumerate().skip(1) {
            *p = size as u64 + i as u64 * 1000;
        }
        patch_pointers(&mut disk, size, &pointers).unwrap();

        let header = parse_header(&mut disk).unwrap();
        assert_eq!(header.k, 20);
        assert_eq!(header.id, id);
        assert_eq!(header.memo, memo);
        assert_eq!(header.header_size, size);
        assert_eq!(header.table_begin, pointers);
    }

    #[test]
    fn test_header_first_bytes_literal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h.plot");
        let id: [u8; 32] = core::array::from_fn(|i| i as u8 + 1);
        let mut disk = FileDisk::create(&path).unwrap();
        write_header(&mut disk, 18, &id, &[]).unwrap();
        let mut head = [0u8; 51];
        disk.read(0, &mut head).unwrap();
        assert_eq!(&head[..19], b"Proof of Space Plot");
        assert_eq!(&head[19..51], &id);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h.plot");
        let mut disk = FileDisk::create(&path).unwrap();
        disk.write(0, &[0u8; 200]).unwrap();
        assert!(matches!(
            parse_header(&mut disk),
            Err(PosError::InvalidValue(_))
        ));
    }
}
