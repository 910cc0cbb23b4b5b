//! C13 — the CRC-32C checksum hook. Spec §9 open question 2 leaves checksum
//! validation out of the decode path entirely; this just gives a caller (or
//! a test) a way to ask "does this structure's on-disk checksum still
//! match?" without the crate deciding that for them.

pub trait Crc32Check {
    /// Recomputes CRC-32C over the structure's own byte layout with the
    /// checksum field zeroed, the way the on-disk value was computed.
    fn compute_crc32c(&self) -> u32;
}
