//! C9 — `Container`: opens one VHDX file end to end (file identifier, both
//! header copies, both region table copies, metadata) and exposes the
//! decoded structure plus sector-level reads.

use std::cell::RefCell;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;

use uuid::Uuid;

use crate::bat::{chunk_ratio, BatEntry, PayloadEntries, BAT_ENTRY_SIZE};
use crate::context::{Mode, ParseContext};
use crate::error::{Result, VhdxError};
use crate::file_identifier::FileIdentifier;
use crate::guid::uuid_from_blob;
use crate::header::{pick_current, Header};
use crate::metadata::{Metadata, MetadataValue};
use crate::region_table::{RegionTable, RegionTableEntry};
use crate::resolver::{self, ResolverParams, SectorBitmapCache};
use crate::signatures::{known_guid_blob, DEFAULT_MAX_INFERRED_SIZE, REGION_GUID_BAT, REGION_GUID_METADATA};

fn known_region(guid: &str) -> Uuid {
    uuid_from_blob(&known_guid_blob(guid))
}

/// Builder for opening a VHDX file, mirroring `std::fs::OpenOptions`.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    mode: Mode,
    fallback_metas: Option<Metadata>,
    max_inferred_size: u64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Strict,
            fallback_metas: None,
            max_inferred_size: DEFAULT_MAX_INFERRED_SIZE,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Shorthand for `.mode(Mode::Tolerant)`.
    pub fn tolerant(self) -> Self {
        self.mode(Mode::Tolerant)
    }

    /// Metadata to fall back on when a file has no metadata region at all,
    /// or is missing one of the three fields required to make sense of the
    /// BAT (`LogicalSectorSize`, `PhysicalSectorSize`, `BlockSize`). Only
    /// consulted in [`Mode::Tolerant`]. See [`Metadata::sensible_fallback`].
    pub fn fallback_metas(mut self, metas: Metadata) -> Self {
        self.fallback_metas = Some(metas);
        self
    }

    /// Ceiling on a `VirtualDiskSize` inferred from the BAT region's
    /// length. Defaults to [`DEFAULT_MAX_INFERRED_SIZE`].
    pub fn max_inferred_size(mut self, ceiling: u64) -> Self {
        self.max_inferred_size = ceiling;
        self
    }

    pub fn open(self, path: impl AsRef<Path>) -> Result<Container> {
        Container::open_with(path, self)
    }
}

/// A single open VHDX file: fixed, dynamically-expanding, or one link in a
/// differencing chain. See [`crate::chain::ChainReader`] for resolving
/// sectors across a whole chain.
#[derive(Debug)]
pub struct Container {
    file: RefCell<File>,
    file_identifier: FileIdentifier,
    header: Header,
    region_table: RegionTable,
    metas: Metadata,
    used_fallback_metas: bool,
    chunk_ratio: u64,
    sector_count: u64,
    bat_region: RegionTableEntry,
    cache: SectorBitmapCache,
    empty_block: Vec<u8>,
    empty_sector: Vec<u8>,
    warnings: Vec<String>,
}

impl Container {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        OpenOptions::new().open(path)
    }

    fn open_with(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut ctx = ParseContext::new(options.mode);

        let file_identifier = FileIdentifier::read(&mut file, &mut ctx)?;

        let header_a = Header::read(&mut file, &mut ctx)?;
        let header_b = Header::read(&mut file, &mut ctx)?;
        let (current, _is_b) = pick_current(&header_a, &header_b);
        let header = current.clone();

        let region_table_a = RegionTable::read(&mut file, &mut ctx)?;
        let region_table_b = RegionTable::read(&mut file, &mut ctx)?;
        if !region_table_a.matches(&region_table_b) {
            ctx.fault("region table copies do not match", || VhdxError::RegionTableMismatch)?;
        }
        let region_table = region_table_a;

        let metadata_region = region_table.get(&known_region(REGION_GUID_METADATA)).copied();
        let bat_region = region_table
            .get(&known_region(REGION_GUID_BAT))
            .copied()
            .ok_or(VhdxError::MissingRegion("BAT"))?;

        let mut used_fallback_metas = false;
        let mut metas = if let Some(entry) = metadata_region {
            file.seek(SeekFrom::Start(entry.file_offset))?;
            Metadata::read(&mut file, &mut ctx)?
        } else if options.mode == Mode::Tolerant && options.fallback_metas.is_some() {
            ctx.note("no metadata region defined, falling back to provided metadata");
            used_fallback_metas = true;
            options.fallback_metas.clone().unwrap()
        } else {
            return Err(VhdxError::NoMetadata);
        };

        if let Some(fallback) = &options.fallback_metas {
            if metas.logical_sector_size.is_none()
                || metas.physical_sector_size.is_none()
                || metas.block_size.is_none()
            {
                ctx.note("metadata region missing required fields, merging in fallback metadata");
                metas.logical_sector_size = metas.logical_sector_size.or(fallback.logical_sector_size);
                metas.physical_sector_size = metas.physical_sector_size.or(fallback.physical_sector_size);
                metas.block_size = metas.block_size.or(fallback.block_size);
                metas.has_parent = metas.has_parent.or(fallback.has_parent);
                used_fallback_metas = true;
            }
        }

        let logical_sector_size = metas
            .logical_sector_size
            .ok_or(VhdxError::MissingFallbackFields("LogicalSectorSize"))?;
        let physical_sector_size = metas
            .physical_sector_size
            .ok_or(VhdxError::MissingFallbackFields("PhysicalSectorSize"))?;
        let block_size = metas.block_size.ok_or(VhdxError::MissingFallbackFields("BlockSize"))?;
        let _ = physical_sector_size;

        if metas.virtual_disk_size.is_none() {
            ctx.note("inferring VirtualDiskSize from the BAT region's length");
            let raw_entry_count = bat_region.length as u64 / BAT_ENTRY_SIZE;
            let ratio = chunk_ratio(logical_sector_size, block_size);
            let payload_blocks = raw_entry_count - (raw_entry_count / ratio);
            let inferred = payload_blocks * block_size as u64;
            if inferred > options.max_inferred_size {
                return Err(VhdxError::InferredSizeTooLarge {
                    inferred,
                    ceiling: options.max_inferred_size,
                });
            }
            metas.virtual_disk_size = Some(inferred);
            used_fallback_metas = true;
        }
        let virtual_disk_size = metas.virtual_disk_size.expect("just populated");

        let chunk_ratio_value = chunk_ratio(logical_sector_size, block_size);
        let sector_count = virtual_disk_size / logical_sector_size as u64;
        let empty_block = vec![0u8; block_size as usize];
        let empty_sector = vec![0u8; logical_sector_size as usize];

        Ok(Container {
            file: RefCell::new(file),
            file_identifier,
            header,
            region_table,
            metas,
            used_fallback_metas,
            chunk_ratio: chunk_ratio_value,
            sector_count,
            bat_region,
            cache: SectorBitmapCache::new(),
            empty_block,
            empty_sector,
            warnings: ctx.warnings().to_vec(),
        })
    }

    pub fn file_identifier(&self) -> &FileIdentifier {
        &self.file_identifier
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn region_table(&self) -> &RegionTable {
        &self.region_table
    }

    pub fn metas(&self) -> &Metadata {
        &self.metas
    }

    pub fn get_meta_entry(&self, key: &str) -> Option<MetadataValue> {
        self.metas.get(key)
    }

    pub fn logical_sector_size(&self) -> u32 {
        self.metas.logical_sector_size.expect("validated at open")
    }

    pub fn physical_sector_size(&self) -> u32 {
        self.metas.physical_sector_size.expect("validated at open")
    }

    pub fn block_size(&self) -> u32 {
        self.metas.block_size.expect("validated at open")
    }

    pub fn virtual_disk_size(&self) -> u64 {
        self.metas.virtual_disk_size.expect("validated at open")
    }

    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    pub fn is_differencing(&self) -> bool {
        self.metas.has_parent.unwrap_or(false)
    }

    pub fn used_fallback_metas(&self) -> bool {
        self.used_fallback_metas
    }

    /// Warnings accumulated while opening, in [`Mode::Tolerant`]. Always
    /// empty in [`Mode::Strict`], since a fault there returns `Err` instead.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn params(&self) -> ResolverParams {
        ResolverParams {
            bat_offset: self.bat_region.file_offset,
            logical_sector_size: self.logical_sector_size(),
            block_size: self.block_size(),
            chunk_ratio: self.chunk_ratio,
            is_differencing: self.is_differencing(),
        }
    }

    pub fn bat_entry_for_logical_sector(&self, sector_number: u64) -> Result<BatEntry> {
        let mut file = self.file.borrow_mut();
        resolver::bat_entry_for_logical_sector(&mut *file, self.params(), self.sector_count, sector_number)
    }

    pub fn is_sector_allocated(&self, sector_number: u64) -> Result<bool> {
        let mut file = self.file.borrow_mut();
        resolver::is_sector_allocated(&mut *file, &self.cache, self.params(), self.sector_count, sector_number)
    }

    pub fn get_block(&self, entry: BatEntry) -> Result<Vec<u8>> {
        let mut file = self.file.borrow_mut();
        resolver::get_block(&mut *file, entry, self.block_size(), &self.empty_block)
    }

    pub fn get_sector(&self, sector_number: u64) -> Result<Vec<u8>> {
        let mut file = self.file.borrow_mut();
        resolver::get_sector(
            &mut *file,
            &self.cache,
            self.params(),
            self.sector_count,
            sector_number,
            &self.empty_block,
            &self.empty_sector,
        )
    }

    /// Every payload BAT entry in file order, skipping the sector-bitmap
    /// entries woven in among them for a differencing disk. Collected
    /// eagerly: the file handle lives behind a `RefCell` so callers can use
    /// `&self` elsewhere, which rules out handing back a borrowing iterator.
    pub fn iter_bat_payload_entries(&self) -> Result<Vec<BatEntry>> {
        let raw_entry_count = self.bat_region.length as u64 / BAT_ENTRY_SIZE;
        let mut file = self.file.borrow_mut();
        PayloadEntries::new(&mut *file, self.bat_region.file_offset, raw_entry_count, self.chunk_ratio)?
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::guid_to_blob;
    use crate::signatures::{FILE_IDENTIFIER_MAGIC, HEADER_MAGIC, METADATA_MAGIC, REGION_TABLE_MAGIC};
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn guid_blob(s: &str) -> Vec<u8> {
        guid_to_blob(s).unwrap().to_vec()
    }

    /// Builds a minimal, well-formed single-file (non-differencing) VHDX
    /// with one fully-present payload block, sized exactly `virtual_disk_size`.
    fn build_fixed_disk(virtual_disk_size: u64, block_size: u32, logical_sector_size: u32) -> Vec<u8> {
        let mut bytes = vec![0u8; 0];

        // File identifier (64 KiB)
        bytes.extend_from_slice(FILE_IDENTIFIER_MAGIC.as_slice());
        bytes.resize(1 << 16, 0);

        // Two header copies (64 KiB each)
        for sequence_number in [1u64, 2u64] {
            let start = bytes.len();
            bytes.extend_from_slice(HEADER_MAGIC.as_slice());
            bytes.extend_from_slice(&0u32.to_le_bytes()); // checksum
            bytes.extend_from_slice(&sequence_number.to_le_bytes());
            bytes.extend_from_slice(&[0u8; 16]); // file_write_guid
            bytes.extend_from_slice(&[0u8; 16]); // data_write_guid
            bytes.extend_from_slice(&[0u8; 16]); // log_guid, nil
            bytes.extend_from_slice(&0u16.to_le_bytes()); // log_version
            bytes.extend_from_slice(&1u16.to_le_bytes()); // format_version
            bytes.extend_from_slice(&0u32.to_le_bytes()); // log_length
            bytes.extend_from_slice(&0u64.to_le_bytes()); // log_offset
            bytes.resize(start + (1 << 16), 0);
        }

        let region_table_entries_offset = bytes.len() + 16; // past both region table slots
        let metadata_offset = (1 << 20) as u64; // 1 MiB
        let bat_offset = (2 << 20) as u64; // 2 MiB
        let _ = region_table_entries_offset;

        for _ in 0..2 {
            let start = bytes.len();
            bytes.extend_from_slice(REGION_TABLE_MAGIC.as_slice());
            bytes.extend_from_slice(&0u32.to_le_bytes()); // checksum
            bytes.extend_from_slice(&2u32.to_le_bytes()); // entry_count
            bytes.extend_from_slice(&0u32.to_le_bytes()); // reserved
            // BAT entry
            bytes.extend_from_slice(&guid_blob(crate::signatures::REGION_GUID_BAT));
            bytes.extend_from_slice(&bat_offset.to_le_bytes());
            bytes.extend_from_slice(&8u32.to_le_bytes()); // length: one BAT entry
            bytes.extend_from_slice(&1u32.to_le_bytes()); // required
            // Metadata entry
            bytes.extend_from_slice(&guid_blob(crate::signatures::REGION_GUID_METADATA));
            bytes.extend_from_slice(&metadata_offset.to_le_bytes());
            bytes.extend_from_slice(&(1 << 16u32).to_le_bytes()); // length
            bytes.extend_from_slice(&1u32.to_le_bytes()); // required
            bytes.resize(start + (1 << 16), 0);
        }

        bytes.resize(metadata_offset as usize, 0);
        let meta_start = bytes.len();
        bytes.extend_from_slice(METADATA_MAGIC.as_slice());
        bytes.extend_from_slice(&0u16.to_le_bytes()); // reserved
        bytes.extend_from_slice(&4u16.to_le_bytes()); // entry_count
        bytes.extend_from_slice(&[0u8; 20]); // reserved

        let region_start = meta_start + 32 + 4 * 32;
        let file_params_off = (region_start - meta_start) as u32;
        let vds_off = file_params_off + 8;
        let lss_off = vds_off + 8;
        let pss_off = lss_off + 4;

        let mut entry = |item_id: &str, off: u32, len: u32| {
            bytes.extend_from_slice(&guid_blob(item_id));
            bytes.extend_from_slice(&off.to_le_bytes());
            bytes.extend_from_slice(&len.to_le_bytes());
            bytes.extend_from_slice(&0u32.to_le_bytes()); // flags
            bytes.extend_from_slice(&0u32.to_le_bytes()); // reserved
        };
        entry(crate::signatures::METADATA_FILE_PARAMETERS, file_params_off, 8);
        entry(crate::signatures::METADATA_VIRTUAL_DISK_SIZE, vds_off, 8);
        entry(crate::signatures::METADATA_LOGICAL_SECTOR_SIZE, lss_off, 4);
        entry(crate::signatures::METADATA_PHYSICAL_SECTOR_SIZE, pss_off, 4);

        bytes.resize(meta_start + file_params_off as usize, 0);
        bytes.extend_from_slice(&block_size.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes()); // flags: not differencing
        bytes.extend_from_slice(&virtual_disk_size.to_le_bytes());
        bytes.extend_from_slice(&logical_sector_size.to_le_bytes());
        bytes.extend_from_slice(&4096u32.to_le_bytes());

        bytes.resize(bat_offset as usize, 0);
        let packed: u64 = {
            use bitvec::prelude::*;
            let mut raw = 0u64;
            let bits = raw.view_bits_mut::<Lsb0>();
            bits[0..3].store(6u8); // FullyPresent
            bits[20..64].store(3u64); // offset 3 MiB
            raw
        };
        bytes.extend_from_slice(&packed.to_le_bytes());

        bytes.resize((3 << 20) as usize, 0xAB); // payload block at 3 MiB, filled with 0xAB
        bytes.resize((3 << 20) as usize + block_size as usize, 0xAB);
        bytes
    }

    #[test]
    fn opens_a_fixed_disk_and_reads_a_sector() {
        let virtual_disk_size = 8 * (1 << 20); // 8 MiB
        let block_size = 1 << 20;
        let logical_sector_size = 512;
        let bytes = build_fixed_disk(virtual_disk_size, block_size, logical_sector_size);

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();

        let container = Container::open(file.path()).unwrap();
        assert_eq!(container.virtual_disk_size(), virtual_disk_size);
        assert_eq!(container.logical_sector_size(), logical_sector_size);
        assert_eq!(container.block_size(), block_size);
        assert!(!container.is_differencing());
        assert!(!container.used_fallback_metas());

        let sector = container.get_sector(0).unwrap();
        assert_eq!(sector.len(), logical_sector_size as usize);
        assert!(sector.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn out_of_range_sector_is_an_error() {
        let bytes = build_fixed_disk(1 << 20, 1 << 20, 512);
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        let container = Container::open(file.path()).unwrap();
        let sector_count = container.sector_count();
        assert!(matches!(
            container.get_sector(sector_count),
            Err(VhdxError::OutOfRange { .. })
        ));
    }

    #[test]
    fn tolerant_mode_survives_a_corrupted_metadata_table_magic() {
        let mut bytes = build_fixed_disk(1 << 20, 1 << 20, 512);
        // Corrupt the metadata table magic.
        let meta_offset = (1 << 20) as usize;
        bytes[meta_offset] = b'X';

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();

        let mut fallback = Metadata::sensible_fallback();
        fallback.has_parent = Some(false);
        let container = OpenOptions::new()
            .tolerant()
            .fallback_metas(fallback)
            .open(file.path());
        assert!(container.is_ok());
    }
}
