//! C6 — the metadata table: a handful of GUID-keyed items, each dispatched
//! to a small typed parser. Mirrors the original tool's
//! `Metadata.parse_metadata_entry` dispatch table, one function per item ID.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

use nom::combinator::map;
use nom::number::complete::{le_u16, le_u32, le_u64};
use nom::sequence::tuple;
use nom::IResult;
use uuid::Uuid;

use crate::byte_reader::read_vec;
use crate::context::ParseContext;
use crate::error::{parse_err, Result, VhdxError};
use crate::guid::uuid_from_blob;
use crate::signatures::{
    known_guid_blob, METADATA_FILE_PARAMETERS, METADATA_LOGICAL_SECTOR_SIZE, METADATA_MAGIC,
    METADATA_PAGE_83_DATA, METADATA_PARENT_LOCATOR, METADATA_PHYSICAL_SECTOR_SIZE,
    METADATA_VIRTUAL_DISK_SIZE, PARENT_LOCATOR_TYPE_VHDX,
};

const TABLE_HEADER_SIZE: usize = 32;
const ENTRY_SIZE: usize = 32;
const MAX_ENTRY_COUNT: u16 = 2047;

/// A differencing disk's `ParentLocator`: free-form key/value strings used
/// to find the parent (relative path, absolute path, volume ID...).
pub type ParentLocator = HashMap<String, String>;

/// One parsed metadata item, typed the way [`Metadata::get`] returns it.
#[derive(Debug, Clone)]
pub enum MetadataValue {
    U32(u32),
    U64(u64),
    Bool(bool),
    Guid(Uuid),
    ParentLocator(ParentLocator),
}

/// Raw bytes behind an item ID this crate doesn't recognize, kept around in
/// tolerant mode for forensic inspection instead of being discarded.
#[derive(Debug, Clone)]
pub struct UnknownMetadataItem {
    pub item_id: Uuid,
    pub bytes: Vec<u8>,
}

/// The decoded contents of a VHDX metadata region, or a caller-supplied
/// stand-in when the region is absent entirely.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub block_size: Option<u32>,
    pub leave_blocks_allocated: Option<bool>,
    pub has_parent: Option<bool>,
    pub virtual_disk_size: Option<u64>,
    pub page_83_data: Option<Uuid>,
    pub logical_sector_size: Option<u32>,
    pub physical_sector_size: Option<u32>,
    pub parent_locator: Option<ParentLocator>,
    pub unknown: Vec<UnknownMetadataItem>,
}

impl Metadata {
    /// `LogicalSectorSize: 512, PhysicalSectorSize: 4096, BlockSize: 1 MiB`
    /// — the fallback metadata the original tooling hands to
    /// `VhdxFile(..., fallback_metas=...)` when a caller has no metadata
    /// region to fall back on. `VirtualDiskSize` and `HasParent` are left
    /// for the caller to fill in per file.
    pub fn sensible_fallback() -> Self {
        Metadata {
            logical_sector_size: Some(512),
            physical_sector_size: Some(4096),
            block_size: Some(1 << 20),
            ..Default::default()
        }
    }

    /// Looks a field up by the same key names the on-disk item carries,
    /// mirroring the original `get_meta_entry(key)` accessor.
    pub fn get(&self, key: &str) -> Option<MetadataValue> {
        match key {
            "BlockSize" => self.block_size.map(MetadataValue::U32),
            "LeaveBlocksAllocated" => self.leave_blocks_allocated.map(MetadataValue::Bool),
            "HasParent" => self.has_parent.map(MetadataValue::Bool),
            "VirtualDiskSize" => self.virtual_disk_size.map(MetadataValue::U64),
            "Page83Data" => self.page_83_data.map(MetadataValue::Guid),
            "LogicalSectorSize" => self.logical_sector_size.map(MetadataValue::U32),
            "PhysicalSectorSize" => self.physical_sector_size.map(MetadataValue::U32),
            "ParentLocator" => self.parent_locator.clone().map(MetadataValue::ParentLocator),
            _ => None,
        }
    }

    pub fn read<R: Read + Seek>(reader: &mut R, ctx: &mut ParseContext) -> Result<Self> {
        let origin = reader.stream_position()?;
        let header_buf = read_vec(reader, origin, TABLE_HEADER_SIZE)?;

        let (_, (magic, mut entry_count)) =
            parse_table_header(&header_buf).map_err(parse_err("metadata table"))?;

        if magic != *METADATA_MAGIC {
            ctx.fault(
                format!("metadata table magic mismatch at {origin}: expected {METADATA_MAGIC:?}, got {magic:?}"),
                || VhdxError::BadMagic {
                    section: "metadata table",
                    expected: METADATA_MAGIC.as_slice(),
                    got: magic.to_vec(),
                },
            )?;
        }

        if entry_count > MAX_ENTRY_COUNT {
            ctx.fault(
                format!("metadata table entry count {entry_count} exceeds {MAX_ENTRY_COUNT}, clamping"),
                || VhdxError::BadMetadata(format!("entry count {entry_count} over the {MAX_ENTRY_COUNT} limit")),
            )?;
            entry_count = MAX_ENTRY_COUNT;
        }

        let mut raw_entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let entry_start = reader.stream_position()?;
            let entry_buf = read_vec(reader, entry_start, ENTRY_SIZE)?;
            let (_, (guid_bytes, offset, length)) =
                parse_entry(&entry_buf).map_err(parse_err("metadata entry"))?;
            raw_entries.push((uuid_from_blob(&guid_bytes), offset, length));
        }

        let mut meta = Metadata::default();
        for (item_id, offset, length) in raw_entries {
            let data_offset = origin + offset as u64;
            reader.seek(SeekFrom::Start(data_offset))?;
            let data = read_vec(reader, data_offset, length as usize)?;
            apply_entry(&mut meta, ctx, item_id, &data)?;
        }

        Ok(meta)
    }
}

fn known_item(guid: &str) -> Uuid {
    uuid_from_blob(&known_guid_blob(guid))
}

/// Records `key` as already populated the first time it's seen; a repeat
/// is a duplicate parsed key, downgraded to a warning in tolerant mode
/// (first occurrence kept, matching the region table's own
/// drop-duplicates-keep-first policy) and fatal in strict mode.
fn reject_duplicate(already_set: bool, key: &'static str, ctx: &mut ParseContext) -> Result<bool> {
    if already_set {
        ctx.fault(format!("duplicate metadata key {key}"), || VhdxError::DuplicateMetadataKey(key))?;
        Ok(true)
    } else {
        Ok(false)
    }
}

fn apply_entry(meta: &mut Metadata, ctx: &mut ParseContext, item_id: Uuid, data: &[u8]) -> Result<()> {
    if item_id == known_item(METADATA_FILE_PARAMETERS) {
        let (_, (block_size, leave_blocks_allocated, has_parent)) =
            parse_file_parameters(data).map_err(parse_err("metadata: file parameters"))?;
        if !reject_duplicate(meta.block_size.is_some(), "BlockSize", ctx)? {
            meta.block_size = Some(block_size);
        }
        if !reject_duplicate(meta.leave_blocks_allocated.is_some(), "LeaveBlocksAllocated", ctx)? {
            meta.leave_blocks_allocated = Some(leave_blocks_allocated);
        }
        if !reject_duplicate(meta.has_parent.is_some(), "HasParent", ctx)? {
            meta.has_parent = Some(has_parent);
        }
    } else if item_id == known_item(METADATA_VIRTUAL_DISK_SIZE) {
        let (_, value) = le_u64(data).map_err(parse_err("metadata: virtual disk size"))?;
        if !reject_duplicate(meta.virtual_disk_size.is_some(), "VirtualDiskSize", ctx)? {
            meta.virtual_disk_size = Some(value);
        }
    } else if item_id == known_item(METADATA_PAGE_83_DATA) {
        let bytes: [u8; 16] = data
            .get(..16)
            .ok_or_else(|| VhdxError::BadMetadata("Page83Data item shorter than 16 bytes".into()))?
            .try_into()
            .expect("slice is 16 bytes");
        if !reject_duplicate(meta.page_83_data.is_some(), "Page83Data", ctx)? {
            meta.page_83_data = Some(uuid_from_blob(&bytes));
        }
    } else if item_id == known_item(METADATA_LOGICAL_SECTOR_SIZE) {
        let (_, value) = le_u32(data).map_err(parse_err("metadata: logical sector size"))?;
        if !reject_duplicate(meta.logical_sector_size.is_some(), "LogicalSectorSize", ctx)? {
            meta.logical_sector_size = Some(value);
        }
    } else if item_id == known_item(METADATA_PHYSICAL_SECTOR_SIZE) {
        let (_, value) = le_u32(data).map_err(parse_err("metadata: physical sector size"))?;
        if !reject_duplicate(meta.physical_sector_size.is_some(), "PhysicalSectorSize", ctx)? {
            meta.physical_sector_size = Some(value);
        }
    } else if item_id == known_item(METADATA_PARENT_LOCATOR) {
        let locator = parse_parent_locator(ctx, data)?;
        if !reject_duplicate(meta.parent_locator.is_some(), "ParentLocator", ctx)? {
            meta.parent_locator = Some(locator);
        }
    } else {
        ctx.fault(
            format!("unrecognized metadata item id {item_id}"),
            || VhdxError::BadMetadata(format!("unrecognized metadata item id {item_id}")),
        )?;
        meta.unknown.push(UnknownMetadataItem {
            item_id,
            bytes: data.to_vec(),
        });
    }
    Ok(())
}

fn parse_file_parameters(data: &[u8]) -> IResult<&[u8], (u32, bool, bool)> {
    map(tuple((le_u32, le_u32)), |(block_size, flags): (u32, u32)| {
        (block_size, (flags & 1) != 0, (flags & 2) != 0)
    })(data)
}

fn parse_parent_locator(ctx: &mut ParseContext, data: &[u8]) -> Result<ParentLocator> {
    if data.len() < 20 {
        return Err(VhdxError::BadMetadata("parent locator shorter than its fixed header".into()));
    }
    let locator_type = uuid_from_blob(data[0..16].try_into().expect("checked length"));
    if locator_type != known_item(PARENT_LOCATOR_TYPE_VHDX) {
        ctx.note(format!("unexpected parent locator type {locator_type}"));
    }
    let key_value_count = u16::from_le_bytes([data[18], data[19]]) as usize;

    let mut table = Vec::with_capacity(key_value_count);
    let mut cursor = 20usize;
    for _ in 0..key_value_count {
        let row = data
            .get(cursor..cursor + 12)
            .ok_or_else(|| VhdxError::BadMetadata("parent locator entry table truncated".into()))?;
        let key_offset = u32::from_le_bytes(row[0..4].try_into().unwrap()) as usize;
        let value_offset = u32::from_le_bytes(row[4..8].try_into().unwrap()) as usize;
        let key_len = u16::from_le_bytes(row[8..10].try_into().unwrap()) as usize;
        let value_len = u16::from_le_bytes(row[10..12].try_into().unwrap()) as usize;
        table.push((key_offset, value_offset, key_len, value_len));
        cursor += 12;
    }

    let mut fields = HashMap::with_capacity(table.len());
    for (key_offset, value_offset, key_len, value_len) in table {
        let key = utf16le_string(data, key_offset, key_len)?;
        let value = utf16le_string(data, value_offset, value_len)?;
        fields.insert(key, value);
    }
    Ok(fields)
}

fn utf16le_string(data: &[u8], offset: usize, len: usize) -> Result<String> {
    let bytes = data
        .get(offset..offset + len)
        .ok_or_else(|| VhdxError::BadMetadata(format!("parent locator string out of range: offset {offset}, len {len}")))?;
    let units: Vec<u16> = bytes.chunks_exact(2).map(|b| u16::from_le_bytes([b[0], b[1]])).collect();
    Ok(String::from_utf16_lossy(&units))
}

fn parse_table_header(buffer: &[u8]) -> IResult<&[u8], ([u8; 8], u16)> {
    map(
        tuple((
            nom::bytes::complete::take(8usize),
            le_u16, // reserved
            le_u16, // entry count
            nom::bytes::complete::take(20usize),
        )),
        |(magic, _reserved, entry_count, _reserved2): (&[u8], u16, u16, &[u8])| {
            (magic.try_into().expect("take(8) guarantees length"), entry_count)
        },
    )(buffer)
}

fn parse_entry(buffer: &[u8]) -> IResult<&[u8], ([u8; 16], u32, u32)> {
    map(
        tuple((nom::bytes::complete::take(16usize), le_u32, le_u32, le_u32, le_u32)),
        |(guid, offset, length, _flags, _reserved): (&[u8], u32, u32, u32, u32)| {
            (guid.try_into().expect("take(16) guarantees length"), offset, length)
        },
    )(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Mode;
    use crate::guid::guid_to_blob;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn entry_header(item_id: &str, offset: u32, length: u32) -> Vec<u8> {
        let mut bytes = guid_to_blob(item_id).unwrap().to_vec();
        bytes.extend_from_slice(&offset.to_le_bytes());
        bytes.extend_from_slice(&length.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes()); // flags
        bytes.extend_from_slice(&0u32.to_le_bytes()); // reserved
        bytes
    }

    fn table_bytes(entries: &[Vec<u8>], payloads: &[Vec<u8>]) -> Vec<u8> {
        let mut bytes = b"metadata".to_vec();
        bytes.extend_from_slice(&0u16.to_le_bytes()); // reserved
        bytes.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&[0u8; 20]);
        for entry in entries {
            bytes.extend_from_slice(entry);
        }
        bytes.resize(TABLE_HEADER_SIZE + entries.len() * ENTRY_SIZE + 256, 0);
        for (entry, payload) in entries.iter().zip(payloads) {
            let offset = u32::from_le_bytes(entry[16..20].try_into().unwrap()) as usize;
            bytes[offset..offset + payload.len()].copy_from_slice(payload);
        }
        bytes
    }

    #[test]
    fn parses_scalar_items() {
        let region_start = (TABLE_HEADER_SIZE + 4 * ENTRY_SIZE) as u32;
        let entries = vec![
            entry_header(METADATA_FILE_PARAMETERS, region_start, 8),
            entry_header(METADATA_VIRTUAL_DISK_SIZE, region_start + 8, 8),
            entry_header(METADATA_LOGICAL_SECTOR_SIZE, region_start + 16, 4),
            entry_header(METADATA_PHYSICAL_SECTOR_SIZE, region_start + 20, 4),
        ];
        let mut fp = 1048576u32.to_le_bytes().to_vec();
        fp.extend_from_slice(&3u32.to_le_bytes()); // LeaveBlocksAllocated | HasParent
        let payloads = vec![
            fp,
            (8u64 << 30).to_le_bytes().to_vec(),
            512u32.to_le_bytes().to_vec(),
            4096u32.to_le_bytes().to_vec(),
        ];
        let mut cursor = Cursor::new(table_bytes(&entries, &payloads));
        let mut ctx = ParseContext::new(Mode::Strict);
        let meta = Metadata::read(&mut cursor, &mut ctx).unwrap();

        assert_eq!(meta.block_size, Some(1 << 20));
        assert_eq!(meta.leave_blocks_allocated, Some(true));
        assert_eq!(meta.has_parent, Some(true));
        assert_eq!(meta.virtual_disk_size, Some(8 << 30));
        assert_eq!(meta.logical_sector_size, Some(512));
        assert_eq!(meta.physical_sector_size, Some(4096));
    }

    #[test]
    fn duplicate_key_is_fatal_in_strict_mode_and_a_warning_in_tolerant_mode() {
        let region_start = (TABLE_HEADER_SIZE + 2 * ENTRY_SIZE) as u32;
        let entries = vec![
            entry_header(METADATA_LOGICAL_SECTOR_SIZE, region_start, 4),
            entry_header(METADATA_LOGICAL_SECTOR_SIZE, region_start + 4, 4),
        ];
        let payloads = vec![512u32.to_le_bytes().to_vec(), 4096u32.to_le_bytes().to_vec()];

        let mut strict_cursor = Cursor::new(table_bytes(&entries, &payloads));
        let mut strict_ctx = ParseContext::new(Mode::Strict);
        let result = Metadata::read(&mut strict_cursor, &mut strict_ctx);
        assert!(matches!(result, Err(VhdxError::DuplicateMetadataKey("LogicalSectorSize"))));

        let mut tolerant_cursor = Cursor::new(table_bytes(&entries, &payloads));
        let mut tolerant_ctx = ParseContext::new(Mode::Tolerant);
        let meta = Metadata::read(&mut tolerant_cursor, &mut tolerant_ctx).unwrap();
        assert_eq!(meta.logical_sector_size, Some(512), "first occurrence wins");
        assert_eq!(tolerant_ctx.warnings().len(), 1);
    }

    #[test]
    fn unknown_item_id_is_an_error_in_strict_mode_and_retained_in_tolerant_mode() {
        let region_start = (TABLE_HEADER_SIZE + ENTRY_SIZE) as u32;
        let bogus_id = "11111111-2222-3333-4444-555555555555";
        let entries = vec![entry_header(bogus_id, region_start, 4)];
        let payloads = vec![vec![1, 2, 3, 4]];

        let mut strict_cursor = Cursor::new(table_bytes(&entries, &payloads));
        let mut strict_ctx = ParseContext::new(Mode::Strict);
        assert!(matches!(
            Metadata::read(&mut strict_cursor, &mut strict_ctx),
            Err(VhdxError::BadMetadata(_))
        ));

        let mut tolerant_cursor = Cursor::new(table_bytes(&entries, &payloads));
        let mut tolerant_ctx = ParseContext::new(Mode::Tolerant);
        let meta = Metadata::read(&mut tolerant_cursor, &mut tolerant_ctx).unwrap();
        assert_eq!(meta.unknown.len(), 1);
        assert_eq!(meta.unknown[0].bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn parent_locator_key_value_pairs_round_trip() {
        let mut payload = guid_to_blob(PARENT_LOCATOR_TYPE_VHDX).unwrap().to_vec();
        payload.extend_from_slice(&0u16.to_le_bytes()); // reserved
        payload.extend_from_slice(&1u16.to_le_bytes()); // key_value_count

        let key = "relative_path".encode_utf16().flat_map(|u| u.to_le_bytes()).collect::<Vec<u8>>();
        let value = "..\\parent.vhdx".encode_utf16().flat_map(|u| u.to_le_bytes()).collect::<Vec<u8>>();
        let table_end = 20 + 12;
        let key_offset = table_end as u32;
        let value_offset = key_offset + key.len() as u32;
        payload.extend_from_slice(&key_offset.to_le_bytes());
        payload.extend_from_slice(&value_offset.to_le_bytes());
        payload.extend_from_slice(&(key.len() as u16).to_le_bytes());
        payload.extend_from_slice(&(value.len() as u16).to_le_bytes());
        payload.extend_from_slice(&key);
        payload.extend_from_slice(&value);

        let region_start = (TABLE_HEADER_SIZE + ENTRY_SIZE) as u32;
        let entries = vec![entry_header(METADATA_PARENT_LOCATOR, region_start, payload.len() as u32)];
        let payloads = vec![payload];
        let mut cursor = Cursor::new(table_bytes(&entries, &payloads));
        let mut ctx = ParseContext::new(Mode::Strict);
        let meta = Metadata::read(&mut cursor, &mut ctx).unwrap();
        let locator = meta.parent_locator.unwrap();
        assert_eq!(locator.get("relative_path").unwrap(), "..\\parent.vhdx");
    }
}
