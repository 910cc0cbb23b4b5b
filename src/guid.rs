//! Conversion between canonical dashed GUID strings and the 16-byte
//! mixed-endian blob form VHDX uses as an on-disk lookup key.
//!
//! The mixed-endian transform — first 4 bytes reversed, next 2 reversed,
//! next 2 reversed, final 8 bytes verbatim — is exactly what
//! [`uuid::Uuid::to_bytes_le`]/[`uuid::Uuid::from_slice_le`] already do, so
//! this module is a thin, type-safe wrapper rather than a hand-rolled byte
//! shuffle.

use uuid::Uuid;

use crate::error::{Result, VhdxError};

/// Parses a 32-hex-digit GUID string (dashes optional) into its on-disk
/// mixed-endian blob form.
pub fn guid_to_blob(text: &str) -> Result<[u8; 16]> {
    let stripped: String = text.chars().filter(|c| *c != '-').collect();
    if stripped.len() != 32 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(VhdxError::InvalidGuid(text.to_string()));
    }
    let uuid = Uuid::parse_str(&stripped).map_err(|_| VhdxError::InvalidGuid(text.to_string()))?;
    Ok(uuid.to_bytes_le())
}

/// Converts a 16-byte mixed-endian blob into its canonical dashed string.
pub fn blob_to_guid(bytes: &[u8]) -> Result<String> {
    let array: [u8; 16] = bytes
        .try_into()
        .map_err(|_| VhdxError::InvalidGuid(format!("{} bytes, want 16", bytes.len())))?;
    Ok(Uuid::from_bytes_le(array).to_string())
}

/// Parses a GUID blob straight into a [`Uuid`], used internally wherever a
/// typed key (rather than a display string) is wanted.
pub(crate) fn uuid_from_blob(bytes: &[u8; 16]) -> Uuid {
    Uuid::from_bytes_le(*bytes)
}
