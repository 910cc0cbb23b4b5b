//! C5 — one of the two 64 KiB region tables, at file offsets 192 KiB and 256 KiB.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

use nom::combinator::map;
use nom::number::complete::{le_u32, le_u64};
use nom::sequence::tuple;
use nom::IResult;
use uuid::Uuid;

use crc::{Crc, CRC_32_ISCSI};

use crate::byte_reader::read_vec;
use crate::checksum::Crc32Check;
use crate::context::ParseContext;
use crate::error::{parse_err, Result, VhdxError};
use crate::guid::uuid_from_blob;
use crate::signatures::REGION_TABLE_MAGIC;

pub const REGION_TABLE_SLOT_SIZE: u64 = 1024 * 64;
const TABLE_HEADER_SIZE: usize = 16;
const ENTRY_SIZE: usize = 32;
const MAX_ENTRY_COUNT: u32 = 2047;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionTableEntry {
    pub file_offset: u64,
    pub length: u32,
    pub required: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RegionTable {
    pub entries: HashMap<Uuid, RegionTableEntry>,
}

impl RegionTable {
    pub fn get(&self, guid: &Uuid) -> Option<&RegionTableEntry> {
        self.entries.get(guid)
    }

    /// Compares two parsed copies entry-by-entry for equal keys, offsets
    /// and lengths. `RegionTableEntry` omits the `required` flag from the
    /// comparison the same way the original Python `__eq__` does.
    pub fn matches(&self, other: &RegionTable) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        self.entries.iter().all(|(guid, entry)| {
            other
                .entries
                .get(guid)
                .map(|o| o.file_offset == entry.file_offset && o.length == entry.length)
                .unwrap_or(false)
        })
    }

    pub fn read<R: Read + Seek>(reader: &mut R, ctx: &mut ParseContext) -> Result<Self> {
        let start = reader.stream_position()?;
        let header_buf = read_vec(reader, start, TABLE_HEADER_SIZE)?;

        let (_, (magic, _checksum, mut entry_count, _reserved)) =
            parse_table_header(&header_buf).map_err(parse_err("region table"))?;

        if magic != *REGION_TABLE_MAGIC {
            ctx.fault(
                format!(
                    "region table magic mismatch at {start}: expected {REGION_TABLE_MAGIC:?}, got {magic:?}"
                ),
                || VhdxError::BadMagic {
                    section: "region table",
                    expected: REGION_TABLE_MAGIC.as_slice(),
                    got: magic.to_vec(),
                },
            )?;
        }

        if entry_count > MAX_ENTRY_COUNT {
            ctx.fault(
                format!("region table entry count {entry_count} exceeds {MAX_ENTRY_COUNT}, clamping"),
                || VhdxError::RegionTableOverflow { count: entry_count },
            )?;
            entry_count = MAX_ENTRY_COUNT;
        }

        let mut entries = HashMap::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let entry_start = reader.stream_position()?;
            let entry_buf = read_vec(reader, entry_start, ENTRY_SIZE)?;
            let (_, (guid_bytes, file_offset, length, required)) =
                parse_entry(&entry_buf).map_err(parse_err("region table entry"))?;
            let guid = uuid_from_blob(&guid_bytes);
            if entries.contains_key(&guid) {
                ctx.fault(
                    format!("duplicate region table key {guid}"),
                    || VhdxError::DuplicateRegionKey(guid),
                )?;
                continue;
            }
            entries.insert(
                guid,
                RegionTableEntry {
                    file_offset,
                    length,
                    required,
                },
            );
        }

        reader.seek(SeekFrom::Start(start + REGION_TABLE_SLOT_SIZE))?;
        Ok(RegionTable { entries })
    }
}

impl Crc32Check for RegionTable {
    /// CRC-32C over the table header and entries with the checksum field
    /// zeroed. Entries are hashed in a fixed (GUID-sorted) order rather than
    /// on-disk order, since that order isn't retained once entries land in
    /// the lookup map — good for noticing an entry was tampered with, not
    /// for reproducing the file's own on-disk checksum bit for bit.
    fn compute_crc32c(&self) -> u32 {
        let crc = Crc::<u32>::new(&CRC_32_ISCSI);
        let mut hasher = crc.digest();
        hasher.update(REGION_TABLE_MAGIC.as_slice());
        hasher.update(&[0u8; 4]); // checksum field, zeroed during computation
        hasher.update(&(self.entries.len() as u32).to_le_bytes());
        hasher.update(&[0u8; 4]); // reserved

        let mut keys: Vec<&Uuid> = self.entries.keys().collect();
        keys.sort();
        for guid in keys {
            let entry = &self.entries[guid];
            hasher.update(&guid.to_bytes_le());
            hasher.update(&entry.file_offset.to_le_bytes());
            hasher.update(&entry.length.to_le_bytes());
            hasher.update(&(entry.required as u32).to_le_bytes());
        }
        hasher.finalize()
    }
}

fn parse_table_header(buffer: &[u8]) -> IResult<&[u8], ([u8; 4], u32, u32, u32)> {
    map(
        tuple((nom::bytes::complete::take(4usize), le_u32, le_u32, le_u32)),
        |(magic, checksum, entry_count, reserved): (&[u8], u32, u32, u32)| {
            (
                magic.try_into().expect("take(4) guarantees length"),
                checksum,
                entry_count,
                reserved,
            )
        },
    )(buffer)
}

fn parse_entry(buffer: &[u8]) -> IResult<&[u8], ([u8; 16], u64, u32, bool)> {
    map(
        tuple((nom::bytes::complete::take(16usize), le_u64, le_u32, le_u32)),
        |(guid, file_offset, length, flags): (&[u8], u64, u32, u32)| {
            (
                guid.try_into().expect("take(16) guarantees length"),
                file_offset,
                length,
                (flags & 1) != 0,
            )
        },
    )(buffer)
}
