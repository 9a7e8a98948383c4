//! `PARM` block: the wrapper stored around the device parameter manifest.
//!
//! ```text
//! "PARM" | length (u32 LE) | manifest bytes | crc32(manifest) (u32 LE) | zero padding to block size
//! ```

use thiserror::Error;

use crate::crc::crc32;

/// Magic bytes at the start of a parameter block: "PARM".
pub const PARM_MAGIC: [u8; 4] = *b"PARM";

/// Magic + length.
pub const PARM_HEADER_LEN: usize = 8;

/// Header plus the trailing CRC.
pub const PARM_OVERHEAD: usize = PARM_HEADER_LEN + 4;

/// Block size written by default.
pub const DEFAULT_PARM_BLOCK: usize = 2048;

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("parameter block size {0} too small (must exceed 12)")]
    BlockTooSmall(usize),
    #[error("parameter manifest too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },
    #[error("parameter block too short: {0} bytes")]
    TooShort(usize),
    #[error("invalid parameter magic: expected PARM")]
    InvalidMagic,
    #[error("parameter length {length} exceeds block ({available} bytes available)")]
    LengthOutOfRange { length: usize, available: usize },
    #[error("parameter checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
}

/// Largest manifest that fits in a block of `block_size` bytes.
#[must_use]
pub fn capacity(block_size: usize) -> usize {
    block_size.saturating_sub(PARM_OVERHEAD)
}

/// Wrap `manifest` into a zero-padded block of exactly `block_size` bytes.
/// The meaningful prefix of the block is `manifest.len() + PARM_OVERHEAD` bytes.
pub fn wrap_parameter(manifest: &[u8], block_size: usize) -> Result<Vec<u8>, ParamError> {
    if block_size <= PARM_OVERHEAD {
        return Err(ParamError::BlockTooSmall(block_size));
    }
    let max = capacity(block_size);
    if manifest.len() > max {
        return Err(ParamError::TooLarge {
            len: manifest.len(),
            max,
        });
    }

    let mut block = Vec::with_capacity(block_size);
    block.extend_from_slice(&PARM_MAGIC);
    block.extend_from_slice(&(manifest.len() as u32).to_le_bytes());
    block.extend_from_slice(manifest);
    block.extend_from_slice(&crc32(0, manifest).to_le_bytes());
    block.resize(block_size, 0);
    Ok(block)
}

/// Return the manifest inside a `PARM` block after checking magic, length and CRC.
/// Trailing padding after the CRC is ignored.
pub fn unwrap_parameter(block: &[u8]) -> Result<&[u8], ParamError> {
    if block.len() < PARM_OVERHEAD {
        return Err(ParamError::TooShort(block.len()));
    }
    if block[..4] != PARM_MAGIC {
        return Err(ParamError::InvalidMagic);
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&block[4..8]);
    let length = u32::from_le_bytes(len) as usize;
    let available = block.len() - PARM_OVERHEAD;
    if length > available {
        return Err(ParamError::LengthOutOfRange { length, available });
    }

    let manifest = &block[PARM_HEADER_LEN..PARM_HEADER_LEN + length];
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&block[PARM_HEADER_LEN + length..PARM_OVERHEAD + length]);
    let stored = u32::from_le_bytes(crc);
    let computed = crc32(0, manifest);
    if stored != computed {
        return Err(ParamError::ChecksumMismatch { stored, computed });
    }
    Ok(manifest)
}
