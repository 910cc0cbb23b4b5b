//! C8 — resolving a logical sector to bytes: BAT lookup, the sector-bitmap
//! lookup a differencing disk needs to tell "present in this file" from
//! "fall through to the parent", and the cache that keeps the latter from
//! re-reading a 1 MiB bitmap block on every sector.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

use crate::bat::{BatEntry, BatEntryState, BAT_ENTRY_SIZE};
use crate::error::{Result, VhdxError};
use crate::signatures::SECTORS_PER_BITMAP;

#[derive(Debug, Clone)]
enum CacheEntry {
    Missing,
    Bitmap(Vec<u8>),
}

/// One sector-bitmap block per chunk index, keyed by chunk index. Built
/// around a `RefCell` for single-threaded use from `&self` container
/// methods; sharing a `Container` across threads needs external
/// synchronization around this cache.
#[derive(Debug, Default)]
pub struct SectorBitmapCache {
    entries: RefCell<HashMap<u64, CacheEntry>>,
}

impl SectorBitmapCache {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The handful of metadata-derived values the resolver needs, gathered so
/// the lookup functions don't take half a dozen loose arguments.
#[derive(Debug, Clone, Copy)]
pub struct ResolverParams {
    pub bat_offset: u64,
    pub logical_sector_size: u32,
    pub block_size: u32,
    pub chunk_ratio: u64,
    pub is_differencing: bool,
}

fn check_range(sector_number: u64, sector_count: u64) -> Result<()> {
    if sector_number >= sector_count {
        return Err(VhdxError::OutOfRange {
            sector: sector_number as i64,
            sector_count,
        });
    }
    Ok(())
}

fn bat_index_for_logical_sector(params: ResolverParams, sector_number: u64) -> u64 {
    let raw_index = (sector_number * params.logical_sector_size as u64) / params.block_size as u64;
    raw_index + (raw_index / params.chunk_ratio)
}

pub fn bat_entry_for_logical_sector<R: Read + Seek>(
    reader: &mut R,
    params: ResolverParams,
    sector_count: u64,
    sector_number: u64,
) -> Result<BatEntry> {
    check_range(sector_number, sector_count)?;
    let index = bat_index_for_logical_sector(params, sector_number);
    reader.seek(SeekFrom::Start(params.bat_offset + index * BAT_ENTRY_SIZE))?;
    BatEntry::read(reader)
}

pub fn get_block<R: Read + Seek>(
    reader: &mut R,
    entry: BatEntry,
    block_size: u32,
    empty_block: &[u8],
) -> Result<Vec<u8>> {
    let unallocated_and_unset = matches!(
        entry.state,
        BatEntryState::NotPresent | BatEntryState::Undefined | BatEntryState::Unmapped
    ) && entry.file_offset == 0;

    if entry.state == BatEntryState::Zero || unallocated_and_unset {
        return Ok(empty_block.to_vec());
    }
    reader.seek(SeekFrom::Start(entry.file_offset))?;
    let mut buffer = vec![0u8; block_size as usize];
    reader.read_exact(&mut buffer)?;
    Ok(buffer)
}

/// Whether `sector_number` is live data in this file (not in a parent).
/// Fixed and dynamic disks have no sector bitmap and are always fully
/// allocated; only differencing disks consult one.
pub fn is_sector_allocated<R: Read + Seek>(
    reader: &mut R,
    cache: &SectorBitmapCache,
    params: ResolverParams,
    sector_count: u64,
    sector_number: u64,
) -> Result<bool> {
    check_range(sector_number, sector_count)?;
    if !params.is_differencing {
        return Ok(true);
    }

    let bat_index = (sector_number * params.logical_sector_size as u64) / params.block_size as u64;
    let chunk_index = bat_index / params.chunk_ratio;
    // This is the formula the original tooling actually uses, not the
    // "obviously symmetric" `chunk_index * (chunk_ratio + 1) + chunk_ratio`
    // one might expect — reproduced verbatim rather than corrected.
    let bitmap_bat_index = chunk_index + (1 + chunk_index) * params.chunk_ratio;

    if let Some(entry) = cache.entries.borrow().get(&chunk_index) {
        return Ok(match entry {
            CacheEntry::Missing => false,
            CacheEntry::Bitmap(bytes) => bit_is_set(bytes, sector_number),
        });
    }

    reader.seek(SeekFrom::Start(params.bat_offset + bitmap_bat_index * BAT_ENTRY_SIZE))?;
    let entry = BatEntry::read(reader)?;
    match entry.state {
        BatEntryState::NotPresent => {
            cache.entries.borrow_mut().insert(chunk_index, CacheEntry::Missing);
            Ok(false)
        }
        BatEntryState::FullyPresent => {
            reader.seek(SeekFrom::Start(entry.file_offset))?;
            let mut bytes = vec![0u8; SECTORS_PER_BITMAP as usize / 8];
            reader.read_exact(&mut bytes)?;
            let allocated = bit_is_set(&bytes, sector_number);
            cache.entries.borrow_mut().insert(chunk_index, CacheEntry::Bitmap(bytes));
            Ok(allocated)
        }
        other => Err(VhdxError::InvalidBitmapState(other as u8)),
    }
}

fn bit_is_set(bitmap: &[u8], sector_number: u64) -> bool {
    let index_in_bitmap = sector_number % SECTORS_PER_BITMAP;
    let byte_offset = (index_in_bitmap / 8) as usize;
    let bit_offset = index_in_bitmap % 8;
    (bitmap[byte_offset] >> bit_offset) & 1 != 0
}

/// Reads one logical sector, returning `empty_sector` for a sector that's
/// valid but not allocated in this file (a differencing disk's parent
/// carries the data instead).
#[allow(clippy::too_many_arguments)]
pub fn get_sector<R: Read + Seek>(
    reader: &mut R,
    cache: &SectorBitmapCache,
    params: ResolverParams,
    sector_count: u64,
    sector_number: u64,
    empty_block: &[u8],
    empty_sector: &[u8],
) -> Result<Vec<u8>> {
    check_range(sector_number, sector_count)?;
    if !is_sector_allocated(reader, cache, params, sector_count, sector_number)? {
        return Ok(empty_sector.to_vec());
    }

    let entry = bat_entry_for_logical_sector(reader, params, sector_count, sector_number)?;
    let block = get_block(reader, entry, params.block_size, empty_block)?;

    let sectors_per_block = params.block_size as u64 / params.logical_sector_size as u64;
    let index_in_block = sector_number % sectors_per_block;
    let start = (index_in_block * params.logical_sector_size as u64) as usize;
    let end = start + params.logical_sector_size as usize;
    block
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or(VhdxError::TruncatedBlock {
            offset: start,
            wanted: params.logical_sector_size as usize,
            got: block.len().saturating_sub(start),
        })
}
