//! Rockchip CRC-32: MSB-first, polynomial 0x04C10DB7, no reflection, no final XOR.
//!
//! Used for the 4-byte trailer of every RKAF image and for the CRC inside a `PARM` block.

use std::io::{self, Read};

/// Chunk size used when checksumming a stream.
pub const STREAM_CHUNK: usize = 1024;

/// Incremental CRC state. Starts at 0 for every checksum in the RKAF format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RkCrc(u32);

impl RkCrc {
    pub const POLYNOMIAL: u32 = 0x04C1_0DB7;

    pub const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        table[1] = Self::POLYNOMIAL;
        let mut pos = 2;
        while pos < 256 {
            let prev = table[pos >> 1];
            let curr = (prev << 1) ^ if (prev >> (u32::BITS - 1)) & 1 != 0 { Self::POLYNOMIAL } else { 0 };
            table[pos] = curr;
            table[pos + 1] = curr ^ Self::POLYNOMIAL;
            pos += 2;
        }
        table
    };

    /// Resume from a previously returned value.
    #[must_use]
    pub const fn with_initial(initial: u32) -> Self {
        Self(initial)
    }

    pub fn update(&mut self, buf: &[u8]) {
        for &b in buf {
            self.0 = (self.0 << 8) ^ Self::TABLE[((self.0 >> 24) as u8 ^ b) as usize];
        }
    }

    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Update `initial` with `buf`. Chaining calls gives the same result as one call over the concatenation.
#[must_use]
pub fn crc32(initial: u32, buf: &[u8]) -> u32 {
    let mut crc = RkCrc::with_initial(initial);
    crc.update(buf);
    crc.value()
}

/// Checksum up to `length` bytes from the current position of `source`.
///
/// Stops early on EOF and returns the checksum of what was actually read; a short
/// stream is not an error here. Read errors other than `Interrupted` are propagated.
pub fn stream_crc32<R: Read>(source: &mut R, length: u64) -> io::Result<u32> {
    let mut crc = RkCrc::default();
    let mut remaining = length;
    let mut buf = [0u8; STREAM_CHUNK];
    while remaining > 0 {
        let n = remaining.min(buf.len() as u64) as usize;
        let got = match source.read(&mut buf[..n]) {
            Ok(0) => break,
            Ok(got) => got,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        crc.update(&buf[..got]);
        remaining -= got as u64;
    }
    Ok(crc.value())
}
