//! Bounded reads of fixed-width little-endian integers and GUIDs from a
//! seekable stream. Every read that comes up short raises
//! [`VhdxError::ShortRead`] rather than silently returning a partial buffer.

use std::io::Read;

use crate::error::{Result, VhdxError};

/// Reads exactly `buf.len()` bytes, or fails with [`VhdxError::ShortRead`].
///
/// `offset` is only used to build the error message; callers that know
/// their current stream position (most do, since they just seeked there)
/// should pass it along so a damaged-file report names a useful byte
/// offset.
pub fn read_exact_at<R: Read>(reader: &mut R, offset: u64, buf: &mut [u8]) -> Result<()> {
    let wanted = buf.len();
    let mut got = 0usize;
    while got < wanted {
        match reader.read(&mut buf[got..]) {
            Ok(0) => {
                return Err(VhdxError::ShortRead {
                    offset,
                    wanted,
                    got,
                })
            }
            Ok(n) => got += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Reads a fixed-size buffer of `N` bytes at the stream's current position.
pub fn read_buf<R: Read, const N: usize>(reader: &mut R, offset: u64) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    read_exact_at(reader, offset, &mut buf)?;
    Ok(buf)
}

/// Reads a `len`-byte buffer at the stream's current position. The
/// variable-length counterpart to [`read_buf`], for block and entry-table
/// reads whose size isn't known until runtime (a 64 KiB slot constant, an
/// `entry_count * ENTRY_SIZE` table, a metadata item's declared length).
pub fn read_vec<R: Read>(reader: &mut R, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    read_exact_at(reader, offset, &mut buf)?;
    Ok(buf)
}

pub fn read_u16<R: Read>(reader: &mut R, offset: u64) -> Result<u16> {
    Ok(u16::from_le_bytes(read_buf::<R, 2>(reader, offset)?))
}

pub fn read_u32<R: Read>(reader: &mut R, offset: u64) -> Result<u32> {
    Ok(u32::from_le_bytes(read_buf::<R, 4>(reader, offset)?))
}

pub fn read_u64<R: Read>(reader: &mut R, offset: u64) -> Result<u64> {
    Ok(u64::from_le_bytes(read_buf::<R, 8>(reader, offset)?))
}

/// Reads the raw 16-byte mixed-endian GUID blob, unconverted.
pub fn read_guid_blob<R: Read>(reader: &mut R, offset: u64) -> Result<[u8; 16]> {
    read_buf::<R, 16>(reader, offset)
}
