//! RKAF binary format types and constants.
//!
//! Defines the fixed 2048-byte header, the 112-byte part entry and the field
//! offset tables used to encode/decode them. All multi-byte fields are little-endian.
//!
//! ```text
//! offset  field          size
//! 0       magic "RKAF"   4
//! 4       length         4     end of the last part == start of the CRC trailer
//! 8       model          34
//! 42      id             30
//! 72      manufacturer   56
//! 128     unknown1       4
//! 132     version        4
//! 136     num_parts      4
//! 140     parts[16]      16 * 112
//! 1932    reserved       116
//! ```

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use log::warn;
use thiserror::Error;

/// Magic bytes at the start of every image: "RKAF".
pub const RKAF_MAGIC: [u8; 4] = *b"RKAF";

/// Size of the on-disk header, including the reserved tail.
pub const HEADER_LEN: usize = 2048;

/// Capacity of the part table.
pub const MAX_PARTS: usize = 16;

/// Size of one part entry in the header.
pub const PART_ENTRY_LEN: usize = 112;

/// Width of the CRC-32 trailer that follows `length`.
pub const TRAILER_LEN: u32 = 4;

pub const MODEL_LEN: usize = 34;
pub const ID_LEN: usize = 30;
pub const MANUFACTURER_LEN: usize = 56;
pub const PART_NAME_LEN: usize = 32;
pub const PART_FILENAME_LEN: usize = 60;

/// Filename marking the pseudo-part that stands for the image itself.
pub const SELF_FILENAME: &str = "SELF";

/// Part name that carries the device parameter manifest in a `PARM` block.
pub const PARAMETER_NAME: &str = "parameter";

/// `nand_addr` of a part whose name is not in the partition table.
pub const UNRESOLVED_NAND_ADDR: u32 = u32::MAX;

mod header_off {
    pub const MAGIC: usize = 0;
    pub const LENGTH: usize = 4;
    pub const MODEL: usize = 8;
    pub const ID: usize = 42;
    pub const MANUFACTURER: usize = 72;
    pub const UNKNOWN1: usize = 128;
    pub const VERSION: usize = 132;
    pub const NUM_PARTS: usize = 136;
    pub const PARTS: usize = 140;
    pub const RESERVED: usize = 1932;
}

mod part_off {
    pub const NAME: usize = 0;
    pub const FILENAME: usize = 32;
    pub const NAND_SIZE: usize = 92;
    pub const POS: usize = 96;
    pub const NAND_ADDR: usize = 100;
    pub const PADDED_SIZE: usize = 104;
    pub const SIZE: usize = 108;
}

const _: () = assert!(header_off::PARTS + MAX_PARTS * PART_ENTRY_LEN == header_off::RESERVED);
const _: () = assert!(header_off::RESERVED + 0x74 == HEADER_LEN);
const _: () = assert!(part_off::SIZE + 4 == PART_ENTRY_LEN);

/// Errors produced while encoding or decoding the header.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("invalid magic: expected RKAF, found {0:02X?}")]
    InvalidMagic([u8; 4]),
    #[error("truncated header: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("too many parts: {0} (max 16)")]
    TooManyParts(usize),
    #[error("{field} too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

fn write_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

/// Text up to the first NUL inside the field (or the whole field if there is none).
/// Invalid UTF-8 becomes U+FFFD.
fn read_text(buf: &[u8], off: usize, width: usize) -> String {
    let field = &buf[off..off + width];
    let end = field.iter().position(|&b| b == 0).unwrap_or(width);
    let text = String::from_utf8_lossy(&field[..end]);
    if let Cow::Owned(_) = text {
        warn!("header text at {off:#x} is not valid UTF-8: {:02X?}", &field[..end]);
    }
    text.into_owned()
}

/// Copy `value` into a NUL-terminated field. The value must leave room for the terminator.
fn write_text(
    buf: &mut [u8],
    off: usize,
    width: usize,
    value: &str,
    field: &'static str,
) -> Result<(), FormatError> {
    check_text(value, width, field)?;
    let dst = &mut buf[off..off + width];
    dst.fill(0);
    dst[..value.len()].copy_from_slice(value.as_bytes());
    Ok(())
}

/// Fails if `value` would not fit in a `width`-byte field with its NUL terminator.
pub fn check_text(value: &str, width: usize, field: &'static str) -> Result<(), FormatError> {
    if value.len() >= width {
        return Err(FormatError::FieldTooLong {
            field,
            len: value.len(),
            max: width - 1,
        });
    }
    Ok(())
}

/// Firmware version as stored in the header: `major << 24 | minor << 16 | patch`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u16,
}

impl FirmwareVersion {
    #[must_use]
    pub fn from_packed(packed: u32) -> Self {
        Self {
            major: (packed >> 24) as u8,
            minor: (packed >> 16) as u8,
            patch: packed as u16,
        }
    }

    #[must_use]
    pub fn packed(&self) -> u32 {
        (u32::from(self.major) << 24) | (u32::from(self.minor) << 16) | u32::from(self.patch)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for FirmwareVersion {
    type Err = String;

    /// Parse `major.minor.patch` (decimal). Text after the patch digits is ignored,
    /// so `4.4.2 beta` reads as 4.4.2.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut it = s.trim().splitn(3, '.');
        let mut next = |what: &str| {
            it.next()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| format!("missing {what} in firmware version {s:?}"))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let rest = next("patch")?;
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let patch = &rest[..digits];
        Ok(Self {
            major: major.parse().map_err(|e| format!("major {major:?}: {e}"))?,
            minor: minor.parse().map_err(|e| format!("minor {minor:?}: {e}"))?,
            patch: patch.parse().map_err(|e| format!("patch {rest:?}: {e}"))?,
        })
    }
}

/// One entry of the part table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PartEntry {
    /// Logical partition name (e.g. "boot", "parameter").
    pub name: String,
    /// Path relative to the pack directory; also the extraction path. "SELF" for the image itself.
    pub filename: String,
    /// Target flash size, 0 if unresolved.
    pub nand_size: u32,
    /// Offset of the part's data in the image.
    pub pos: u32,
    /// Target flash address, `UNRESOLVED_NAND_ADDR` if unresolved.
    pub nand_addr: u32,
    /// Bytes occupied in the image, padding included.
    pub padded_size: u32,
    /// Meaningful bytes at `pos`.
    pub size: u32,
}

impl PartEntry {
    #[must_use]
    pub fn is_self(&self) -> bool {
        self.filename == SELF_FILENAME
    }

    #[must_use]
    pub fn is_parameter(&self) -> bool {
        self.name == PARAMETER_NAME
    }

    #[must_use]
    pub fn is_nand_resolved(&self) -> bool {
        self.nand_addr != UNRESOLVED_NAND_ADDR
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            name: read_text(buf, part_off::NAME, PART_NAME_LEN),
            filename: read_text(buf, part_off::FILENAME, PART_FILENAME_LEN),
            nand_size: read_u32(buf, part_off::NAND_SIZE),
            pos: read_u32(buf, part_off::POS),
            nand_addr: read_u32(buf, part_off::NAND_ADDR),
            padded_size: read_u32(buf, part_off::PADDED_SIZE),
            size: read_u32(buf, part_off::SIZE),
        }
    }

    fn encode(&self, buf: &mut [u8]) -> Result<(), FormatError> {
        write_text(buf, part_off::NAME, PART_NAME_LEN, &self.name, "part name")?;
        write_text(buf, part_off::FILENAME, PART_FILENAME_LEN, &self.filename, "part filename")?;
        write_u32(buf, part_off::NAND_SIZE, self.nand_size);
        write_u32(buf, part_off::POS, self.pos);
        write_u32(buf, part_off::NAND_ADDR, self.nand_addr);
        write_u32(buf, part_off::PADDED_SIZE, self.padded_size);
        write_u32(buf, part_off::SIZE, self.size);
        Ok(())
    }
}

/// Decoded RKAF header. `parts` holds only the `num_parts` valid entries, in table order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RkafHeader {
    /// Length of the region covered by the trailing CRC.
    pub length: u32,
    pub model: String,
    pub id: String,
    pub manufacturer: String,
    pub unknown1: u32,
    /// Packed firmware version; see [`FirmwareVersion`].
    pub version: u32,
    pub parts: Vec<PartEntry>,
}

impl RkafHeader {
    #[must_use]
    pub fn firmware_version(&self) -> FirmwareVersion {
        FirmwareVersion::from_packed(self.version)
    }

    /// Look up a part by name (first match in table order).
    #[must_use]
    pub fn part(&self, name: &str) -> Option<&PartEntry> {
        self.parts.iter().find(|p| p.name == name)
    }

    /// Decode from the first `HEADER_LEN` bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_LEN {
            return Err(FormatError::Truncated {
                need: HEADER_LEN,
                have: buf.len(),
            });
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[header_off::MAGIC..header_off::MAGIC + 4]);
        if magic != RKAF_MAGIC {
            return Err(FormatError::InvalidMagic(magic));
        }

        let num_parts = read_u32(buf, header_off::NUM_PARTS) as usize;
        if num_parts > MAX_PARTS {
            return Err(FormatError::TooManyParts(num_parts));
        }
        let parts = (0..num_parts)
            .map(|i| {
                let off = header_off::PARTS + i * PART_ENTRY_LEN;
                PartEntry::decode(&buf[off..off + PART_ENTRY_LEN])
            })
            .collect();

        Ok(Self {
            length: read_u32(buf, header_off::LENGTH),
            model: read_text(buf, header_off::MODEL, MODEL_LEN),
            id: read_text(buf, header_off::ID, ID_LEN),
            manufacturer: read_text(buf, header_off::MANUFACTURER, MANUFACTURER_LEN),
            unknown1: read_u32(buf, header_off::UNKNOWN1),
            version: read_u32(buf, header_off::VERSION),
            parts,
        })
    }

    /// Encode into a full `HEADER_LEN` block. Unused part slots and the reserved tail are zero.
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        if self.parts.len() > MAX_PARTS {
            return Err(FormatError::TooManyParts(self.parts.len()));
        }
        let mut buf = vec![0u8; HEADER_LEN];
        buf[header_off::MAGIC..header_off::MAGIC + 4].copy_from_slice(&RKAF_MAGIC);
        write_u32(&mut buf, header_off::LENGTH, self.length);
        write_text(&mut buf, header_off::MODEL, MODEL_LEN, &self.model, "model")?;
        write_text(&mut buf, header_off::ID, ID_LEN, &self.id, "id")?;
        write_text(
            &mut buf,
            header_off::MANUFACTURER,
            MANUFACTURER_LEN,
            &self.manufacturer,
            "manufacturer",
        )?;
        write_u32(&mut buf, header_off::UNKNOWN1, self.unknown1);
        write_u32(&mut buf, header_off::VERSION, self.version);
        write_u32(&mut buf, header_off::NUM_PARTS, self.parts.len() as u32);
        for (i, part) in self.parts.iter().enumerate() {
            let off = header_off::PARTS + i * PART_ENTRY_LEN;
            part.encode(&mut buf[off..off + PART_ENTRY_LEN])?;
        }
        Ok(buf)
    }
}
