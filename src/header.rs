//! C4 — one of the two 64 KiB header slots at file offsets 64 KiB and 128 KiB.

use std::io::{Read, Seek};

use crc::{Crc, CRC_32_ISCSI};
use nom::combinator::map;
use nom::number::complete::{le_u16, le_u32, le_u64};
use nom::sequence::tuple;
use nom::IResult;
use uuid::Uuid;

use crate::byte_reader::read_vec;
use crate::checksum::Crc32Check;
use crate::context::ParseContext;
use crate::error::{parse_err, Result, VhdxError};
use crate::guid::uuid_from_blob;
use crate::signatures::{HEADER_MAGIC, VHDX_FORMAT_VERSION};

pub const HEADER_SLOT_SIZE: u64 = 1024 * 64;
const HEADER_PAYLOAD_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct Header {
    pub checksum: u32,
    pub sequence_number: u64,
    pub file_write_guid: Uuid,
    pub data_write_guid: Uuid,
    /// All-zero means no log to replay.
    pub log_guid: Uuid,
    pub log_version: u16,
    pub format_version: u16,
    pub log_length: u32,
    pub log_offset: u64,
}

impl Header {
    pub fn has_log(&self) -> bool {
        !self.log_guid.is_nil()
    }

    pub fn read<R: Read + Seek>(reader: &mut R, ctx: &mut ParseContext) -> Result<Self> {
        let start = reader.stream_position()?;
        let buffer = read_vec(reader, start, HEADER_PAYLOAD_SIZE)?;
        reader.seek(std::io::SeekFrom::Start(start + HEADER_SLOT_SIZE))?;

        let (_, header) = parse_header(&buffer).map_err(parse_err("header"))?;

        if header.magic != *HEADER_MAGIC {
            ctx.fault(
                format!(
                    "header magic mismatch at {start}: expected {HEADER_MAGIC:?}, got {:?}",
                    header.magic
                ),
                || VhdxError::BadMagic {
                    section: "header",
                    expected: HEADER_MAGIC.as_slice(),
                    got: header.magic.to_vec(),
                },
            )?;
        }
        if header.format_version != VHDX_FORMAT_VERSION {
            ctx.fault(
                format!(
                    "unsupported header version at {start}: expected {VHDX_FORMAT_VERSION}, got {}",
                    header.format_version
                ),
                || VhdxError::UnsupportedVersion {
                    section: "header",
                    expected: VHDX_FORMAT_VERSION,
                    got: header.format_version,
                },
            )?;
        }

        Ok(Header {
            checksum: header.checksum,
            sequence_number: header.sequence_number,
            file_write_guid: header.file_write_guid,
            data_write_guid: header.data_write_guid,
            log_guid: header.log_guid,
            log_version: header.log_version,
            format_version: header.format_version,
            log_length: header.log_length,
            log_offset: header.log_offset,
        })
    }
}

impl Crc32Check for Header {
    /// CRC-32C over the 4 KiB payload with `checksum` zeroed, padded out to
    /// the full 64 KiB slot with zero bytes the way the on-disk checksum is
    /// computed. Not called anywhere in `Container::open` — a future,
    /// opt-in validation hook (spec §9 open question 2).
    fn compute_crc32c(&self) -> u32 {
        let crc = Crc::<u32>::new(&CRC_32_ISCSI);
        let mut hasher = crc.digest();
        hasher.update(HEADER_MAGIC.as_slice());
        hasher.update(&[0u8; 4]); // checksum field, zeroed during computation
        hasher.update(&self.sequence_number.to_le_bytes());
        hasher.update(&self.file_write_guid.to_bytes_le());
        hasher.update(&self.data_write_guid.to_bytes_le());
        hasher.update(&self.log_guid.to_bytes_le());
        hasher.update(&self.log_version.to_le_bytes());
        hasher.update(&self.format_version.to_le_bytes());
        hasher.update(&self.log_length.to_le_bytes());
        hasher.update(&self.log_offset.to_le_bytes());
        hasher.update(&[0u8; HEADER_SLOT_SIZE as usize - HEADER_PAYLOAD_SIZE]);
        hasher.finalize()
    }
}

/// Picks the current header out of the two on-disk copies: the greater
/// sequence number wins; a tie is broken toward the second (`b`).
pub fn pick_current<'a>(a: &'a Header, b: &'a Header) -> (&'a Header, bool) {
    if a.sequence_number > b.sequence_number {
        (a, false)
    } else {
        (b, true)
    }
}

struct RawHeader {
    magic: [u8; 4],
    checksum: u32,
    sequence_number: u64,
    file_write_guid: Uuid,
    data_write_guid: Uuid,
    log_guid: Uuid,
    log_version: u16,
    format_version: u16,
    log_length: u32,
    log_offset: u64,
}

fn t_guid(buffer: &[u8]) -> IResult<&[u8], Uuid> {
    map(nom::bytes::complete::take(16usize), |bytes: &[u8]| {
        let array: [u8; 16] = bytes.try_into().expect("take(16) guarantees length");
        uuid_from_blob(&array)
    })(buffer)
}

fn parse_header(buffer: &[u8]) -> IResult<&[u8], RawHeader> {
    map(
        tuple((
            nom::bytes::complete::take(4usize),
            le_u32,
            le_u64,
            t_guid,
            t_guid,
            t_guid,
            le_u16,
            le_u16,
            le_u32,
            le_u64,
        )),
        |(
            magic,
            checksum,
            sequence_number,
            file_write_guid,
            data_write_guid,
            log_guid,
            log_version,
            format_version,
            log_length,
            log_offset,
        )| RawHeader {
            magic: magic.try_into().expect("take(4) guarantees length"),
            checksum,
            sequence_number,
            file_write_guid,
            data_write_guid,
            log_guid,
            log_version,
            format_version,
            log_length,
            log_offset,
        },
    )(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Mode;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn sample_bytes(sequence_number: u64) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"head");
        bytes.extend_from_slice(&0u32.to_le_bytes()); // checksum, unvalidated
        bytes.extend_from_slice(&sequence_number.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 16]); // file_write_guid
        bytes.extend_from_slice(&[0u8; 16]); // data_write_guid
        bytes.extend_from_slice(&[0u8; 16]); // log_guid, nil = no log
        bytes.extend_from_slice(&0u16.to_le_bytes()); // log_version
        bytes.extend_from_slice(&1u16.to_le_bytes()); // format version
        bytes.extend_from_slice(&(1u32 << 20).to_le_bytes()); // log_length = 1 MiB
        bytes.extend_from_slice(&(1u64 << 20).to_le_bytes()); // log_offset = 1 MiB
        bytes.resize(HEADER_SLOT_SIZE as usize, 0);
        bytes
    }

    #[test]
    fn parses_fields_and_seeks_past_the_slot() {
        let mut cursor = Cursor::new(sample_bytes(4));
        let mut ctx = ParseContext::new(Mode::Strict);
        let header = Header::read(&mut cursor, &mut ctx).unwrap();
        assert_eq!(header.sequence_number, 4);
        assert_eq!(header.format_version, 1);
        assert_eq!(header.log_length, 1 << 20);
        assert_eq!(header.log_offset, 1 << 20);
        assert!(!header.has_log());
        assert_eq!(cursor.stream_position().unwrap(), HEADER_SLOT_SIZE);
    }

    #[test]
    fn compute_crc32c_matches_a_known_good_checksum_from_the_raw_bytes() {
        // Independently compute CRC-32C over the same 64 KiB slot laid out by
        // `sample_bytes`, checksum field zeroed, and check it against what
        // `Header::compute_crc32c` derives from the parsed fields.
        let mut raw = sample_bytes(7);
        raw[4..8].copy_from_slice(&0u32.to_le_bytes());
        let crc = Crc::<u32>::new(&CRC_32_ISCSI);
        let expected = crc.checksum(&raw);

        let mut cursor = Cursor::new(sample_bytes(7));
        let mut ctx = ParseContext::new(Mode::Strict);
        let header = Header::read(&mut cursor, &mut ctx).unwrap();
        assert_eq!(header.compute_crc32c(), expected);
    }

    #[test]
    fn higher_sequence_number_wins_and_ties_favor_the_second() {
        let mut a = Cursor::new(sample_bytes(1));
        let mut b = Cursor::new(sample_bytes(2));
        let mut ctx = ParseContext::new(Mode::Strict);
        let header_a = Header::read(&mut a, &mut ctx).unwrap();
        let header_b = Header::read(&mut b, &mut ctx).unwrap();
        let (current, is_b) = pick_current(&header_a, &header_b);
        assert_eq!(current.sequence_number, 2);
        assert!(is_b);

        let mut c = Cursor::new(sample_bytes(5));
        let mut d = Cursor::new(sample_bytes(5));
        let header_c = Header::read(&mut c, &mut ctx).unwrap();
        let header_d = Header::read(&mut d, &mut ctx).unwrap();
        let (current, is_b) = pick_current(&header_c, &header_d);
        assert_eq!(current.sequence_number, 5);
        assert!(is_b, "ties must favor the second header");
    }
}
