//! C7 — the block allocation table: one 8-byte packed entry per payload
//! block (plus, for differencing disks, one sector-bitmap entry woven in
//! every `ChunkRatio + 1` slots), and the chunk-ratio arithmetic that
//! indexes them.

use std::io::{Read, Seek, SeekFrom};

use bitvec::prelude::*;

use crate::error::{Result, VhdxError};
use crate::signatures::{mib, SECTORS_PER_BITMAP};

pub const BAT_ENTRY_SIZE: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatEntryState {
    NotPresent = 0,
    Undefined = 1,
    Zero = 2,
    Unmapped = 3,
    FullyPresent = 6,
    PartiallyPresent = 7,
}

impl BatEntryState {
    fn from_bits(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::NotPresent),
            1 => Ok(Self::Undefined),
            2 => Ok(Self::Zero),
            3 => Ok(Self::Unmapped),
            6 => Ok(Self::FullyPresent),
            7 => Ok(Self::PartiallyPresent),
            other => Err(VhdxError::InvalidBatEntryState(other)),
        }
    }
}

/// A decoded 64-bit BAT entry: 3-bit state in the low bits, 44-bit offset
/// (in 1 MiB units) in the high bits, with 17 reserved bits between them.
#[derive(Debug, Clone, Copy)]
pub struct BatEntry {
    pub state: BatEntryState,
    pub file_offset: u64,
}

impl BatEntry {
    pub fn decode(raw: u64) -> Result<Self> {
        let bytes = raw.to_le_bytes();
        let bits = bytes.view_bits::<Lsb0>();
        let state = BatEntryState::from_bits(bits[0..3].load::<u8>())?;
        let offset_mb: u64 = bits[20..64].load();
        Ok(BatEntry {
            state,
            file_offset: offset_mb * mib(1),
        })
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buffer = [0u8; BAT_ENTRY_SIZE as usize];
        reader.read_exact(&mut buffer)?;
        Self::decode(u64::from_le_bytes(buffer))
    }
}

/// `ChunkRatio = (2^23 * LogicalSectorSize) / BlockSize` — how many payload
/// BAT entries one sector bitmap entry covers.
pub fn chunk_ratio(logical_sector_size: u32, block_size: u32) -> u64 {
    (SECTORS_PER_BITMAP * logical_sector_size as u64) / block_size as u64
}

/// Number of payload blocks needed to cover `virtual_disk_size`, rounded up.
pub fn payload_block_count(virtual_disk_size: u64, block_size: u32) -> u64 {
    let block_size = block_size as u64;
    (virtual_disk_size + block_size - 1) / block_size
}

/// Walks the payload BAT entries in file order, skipping over (without
/// yielding) the sector-bitmap entry woven in every `chunk_ratio + 1`
/// slots. `raw_entry_count` is the total entry count implied by the BAT
/// region's length (`length / 8`), not the payload-only count.
///
/// The skip has to fire on the true raw stream position, not on how many
/// entries have been yielded so far: once a skip-read has happened, those
/// two counts diverge, and gating on the yield count misaligns every chunk
/// boundary after the first.
pub struct PayloadEntries<'a, R> {
    reader: &'a mut R,
    chunk_ratio: u64,
    raw_remaining: u64,
    position_in_chunk: u64,
}

impl<'a, R: Read + Seek> PayloadEntries<'a, R> {
    pub fn new(reader: &'a mut R, bat_offset: u64, raw_entry_count: u64, chunk_ratio: u64) -> Result<Self> {
        reader.seek(SeekFrom::Start(bat_offset))?;
        Ok(Self {
            reader,
            chunk_ratio,
            raw_remaining: raw_entry_count,
            position_in_chunk: 0,
        })
    }
}

impl<'a, R: Read + Seek> Iterator for PayloadEntries<'a, R> {
    type Item = Result<BatEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.raw_remaining == 0 {
            return None;
        }
        if self.position_in_chunk == self.chunk_ratio {
            if let Err(e) = BatEntry::read(self.reader) {
                return Some(Err(e));
            }
            self.raw_remaining -= 1;
            self.position_in_chunk = 0;
            if self.raw_remaining == 0 {
                return None;
            }
        }
        self.position_in_chunk += 1;
        self.raw_remaining -= 1;
        Some(BatEntry::read(self.reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn packed(state: u8, offset_mb: u64) -> u64 {
        let mut raw = 0u64;
        let bits = raw.view_bits_mut::<Lsb0>();
        bits[0..3].store(state);
        bits[20..64].store(offset_mb);
        raw
    }

    #[test]
    fn decodes_state_and_offset() {
        let entry = BatEntry::decode(packed(6, 42)).unwrap();
        assert_eq!(entry.state, BatEntryState::FullyPresent);
        assert_eq!(entry.file_offset, 42 * (1 << 20));
    }

    #[test]
    fn rejects_invalid_state() {
        assert!(matches!(BatEntry::decode(packed(4, 0)), Err(VhdxError::InvalidBatEntryState(4))));
    }

    #[test]
    fn chunk_ratio_matches_the_documented_formula() {
        assert_eq!(chunk_ratio(512, 1 << 20), (1 << 23) * 512 / (1 << 20));
    }

    #[test]
    fn payload_block_count_rounds_up() {
        assert_eq!(payload_block_count(10, 3), 4);
        assert_eq!(payload_block_count(9, 3), 3);
    }

    #[test]
    fn payload_iterator_skips_the_woven_in_sector_bitmap_entries() {
        // chunk_ratio = 2: each chunk is 2 payload entries followed by 1
        // sector-bitmap entry, a fixed 3-raw-slot group repeated throughout.
        // Two full chunks plus a trailing partial chunk (no room left for
        // its own bitmap slot) exercises the chunk-boundary skip more than
        // once, which is exactly where a yield-count-based skip misfires.
        let sector_bitmap = packed(0, 0); // NotPresent, must never be yielded
        let slots = [
            packed(6, 1),
            packed(6, 2),
            sector_bitmap,
            packed(6, 3),
            packed(6, 4),
            sector_bitmap,
            packed(6, 5),
            packed(6, 6),
        ];
        let mut raw = Vec::new();
        for slot in slots {
            raw.extend_from_slice(&slot.to_le_bytes());
        }
        let mut cursor = Cursor::new(raw);
        // The true raw slot count, as `Container::iter_bat_payload_entries`
        // derives it from the BAT region's length — not a payload-only count.
        let entries: Vec<BatEntry> = PayloadEntries::new(&mut cursor, 0, slots.len() as u64, 2)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let offsets: Vec<u64> = entries.iter().map(|e| e.file_offset / (1 << 20)).collect();
        assert_eq!(offsets, vec![1, 2, 3, 4, 5, 6]);
    }
}
