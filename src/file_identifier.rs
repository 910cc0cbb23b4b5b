//! C3 — the 64 KiB file-identifier block at the start of every VHDX file.

use std::io::{Read, Seek, SeekFrom};

use nom::bytes::complete::take;
use nom::combinator::map;
use nom::sequence::tuple;
use nom::IResult;

use crate::byte_reader::read_vec;
use crate::context::ParseContext;
use crate::error::{parse_err, Result, VhdxError};
use crate::signatures::FILE_IDENTIFIER_MAGIC;

pub const FILE_IDENTIFIER_SIZE: u64 = 1024 * 64;
const CREATOR_LEN: usize = 512;

/// Creator string and magic from `[0, 64 KiB)`.
#[derive(Debug, Clone)]
pub struct FileIdentifier {
    pub creator: String,
}

fn t_creator(buffer: &[u8]) -> IResult<&[u8], String> {
    map(take(CREATOR_LEN), |bytes: &[u8]| {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect();
        String::from_utf16_lossy(&units)
            .trim_end_matches('\0')
            .to_string()
    })(buffer)
}

fn parse(buffer: &[u8]) -> IResult<&[u8], (&[u8], String)> {
    tuple((take(8usize), t_creator))(buffer)
}

impl FileIdentifier {
    /// Reads the magic and creator string, then seeks the reader forward to
    /// the next 64 KiB boundary regardless of whether the magic validated.
    pub fn read<R: Read + Seek>(reader: &mut R, ctx: &mut ParseContext) -> Result<Self> {
        let start = reader.stream_position()?;
        let buffer = read_vec(reader, start, FILE_IDENTIFIER_SIZE as usize)?;

        let (_, (magic, creator)) = parse(&buffer).map_err(parse_err("file identifier"))?;
        if magic != FILE_IDENTIFIER_MAGIC.as_slice() {
            ctx.fault(
                format!(
                    "file identifier magic mismatch: expected {FILE_IDENTIFIER_MAGIC:?}, got {magic:?}"
                ),
                || VhdxError::BadMagic {
                    section: "file identifier",
                    expected: FILE_IDENTIFIER_MAGIC.as_slice(),
                    got: magic.to_vec(),
                },
            )?;
        }

        // We already consumed the full 64 KiB block above, so the stream is
        // correctly positioned; nothing further to seek.
        let _ = SeekFrom::Current(0);

        Ok(FileIdentifier { creator })
    }
}
