//! RKAF reader: open an image, check its CRC trailer, extract parts.
//!
//! Verification is all-or-nothing: `unpack_image` extracts nothing unless the
//! trailer matches. After that each part is extracted independently; a bad part
//! is reported in the [`UnpackReport`] and the rest still extract.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;

use crate::crc::stream_crc32;
use crate::format::{FormatError, PartEntry, RkafHeader, HEADER_LEN};
use crate::param::{PARM_HEADER_LEN, PARM_OVERHEAD};

/// Errors produced by the reader.
#[derive(Debug, Error)]
pub enum RkafError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("truncated image: no CRC trailer at offset {0:#x}")]
    TruncatedChecksum(u32),
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("part {name}: range {pos:#x}+{size:#x} exceeds image length {length:#x}")]
    PartOutOfRange {
        name: String,
        pos: u64,
        size: u64,
        length: u32,
    },
    #[error("part {name}: range {pos:#x}+{size:#x} runs past end of file ({file_len:#x} bytes)")]
    PartTruncated {
        name: String,
        pos: u64,
        size: u64,
        file_len: u64,
    },
    #[error("part {name}: parameter part too short ({size} bytes)")]
    ParameterTooShort { name: String, size: u32 },
    #[error("part {name}: refusing to extract to {filename:?}")]
    UnsafePath { name: String, filename: String },
    #[error("part {name}: filename {filename:?} is not valid UTF-8")]
    NonUtf8Filename { name: String, filename: String },
    #[error("no extractable part named {0:?}")]
    PartNotFound(String),
}

/// Fill `buf` from `src` until it is full or the source is exhausted.
pub(crate) fn read_full<R: Read>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Byte range holding a part's extractable content. The `parameter` part loses its
/// 8-byte `PARM` header and 4-byte CRC.
fn content_range(part: &PartEntry, length: u32) -> Result<(u64, u64), RkafError> {
    let (mut pos, mut size) = (u64::from(part.pos), u64::from(part.size));
    if part.is_parameter() {
        if part.size < PARM_OVERHEAD as u32 {
            return Err(RkafError::ParameterTooShort {
                name: part.name.clone(),
                size: part.size,
            });
        }
        pos += PARM_HEADER_LEN as u64;
        size -= PARM_OVERHEAD as u64;
    }
    if pos + size > u64::from(length) {
        return Err(RkafError::PartOutOfRange {
            name: part.name.clone(),
            pos,
            size,
            length,
        });
    }
    Ok((pos, size))
}

/// `dst_dir/filename`, refusing absolute paths, `..` and names that did not decode as UTF-8.
fn destination(dst_dir: &Path, part: &PartEntry) -> Result<PathBuf, RkafError> {
    if part.filename.contains(char::REPLACEMENT_CHARACTER) {
        return Err(RkafError::NonUtf8Filename {
            name: part.name.clone(),
            filename: part.filename.clone(),
        });
    }
    let rel = Path::new(&part.filename);
    let safe = !part.filename.is_empty()
        && rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe {
        return Err(RkafError::UnsafePath {
            name: part.name.clone(),
            filename: part.filename.clone(),
        });
    }
    Ok(dst_dir.join(rel))
}

fn create_parent_dirs(path: &Path) -> io::Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(parent)
}

/// RKAF reader: parses the header, verifies the trailer, reads parts.
pub struct RkafReader {
    /// Parsed header.
    pub header: RkafHeader,
    path: PathBuf,
    reader: BufReader<File>,
    file_len: u64,
    checksum_verified: bool,
}

impl RkafReader {
    /// Open an image and parse its header. Does not verify the checksum.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RkafError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| RkafError::Io {
            path: path.clone(),
            source,
        })?;
        let file_len = file
            .metadata()
            .map_err(|source| RkafError::Io {
                path: path.clone(),
                source,
            })?
            .len();
        let mut reader = BufReader::new(file);

        let mut buf = vec![0u8; HEADER_LEN];
        let got = read_full(&mut reader, &mut buf).map_err(|source| RkafError::Io {
            path: path.clone(),
            source,
        })?;
        let header = RkafHeader::decode(&buf[..got])?;
        debug!(
            "{}: model {:?}, {} parts, length {:#x}",
            path.display(),
            header.model,
            header.parts.len(),
            header.length
        );

        Ok(RkafReader {
            header,
            path,
            reader,
            file_len,
            checksum_verified: false,
        })
    }

    fn io_err(&self) -> impl Fn(io::Error) -> RkafError + '_ {
        move |source| RkafError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// The CRC-32 stored after `header.length`.
    pub fn stored_checksum(&mut self) -> Result<u32, RkafError> {
        let length = self.header.length;
        self.reader
            .seek(SeekFrom::Start(u64::from(length)))
            .map_err(self.io_err())?;
        let mut crc = [0u8; 4];
        let got = read_full(&mut self.reader, &mut crc).map_err(self.io_err())?;
        if got < crc.len() {
            return Err(RkafError::TruncatedChecksum(length));
        }
        Ok(u32::from_le_bytes(crc))
    }

    /// Recompute the CRC-32 over `[0, length)` and compare it with the trailer.
    pub fn verify_checksum(&mut self) -> Result<u32, RkafError> {
        let stored = self.stored_checksum()?;
        self.reader.seek(SeekFrom::Start(0)).map_err(self.io_err())?;
        let computed =
            stream_crc32(&mut self.reader, u64::from(self.header.length)).map_err(self.io_err())?;
        if stored != computed {
            return Err(RkafError::ChecksumMismatch { stored, computed });
        }
        self.checksum_verified = true;
        Ok(stored)
    }

    /// Whether verify_checksum() was called and succeeded.
    #[must_use]
    pub fn checksum_verified(&self) -> bool {
        self.checksum_verified
    }

    /// Valid part entries in table order.
    #[must_use]
    pub fn parts(&self) -> &[PartEntry] {
        &self.header.parts
    }

    fn find_part(&self, name: &str) -> Result<PartEntry, RkafError> {
        self.header
            .parts
            .iter()
            .find(|p| p.name == name && !p.is_self())
            .cloned()
            .ok_or_else(|| RkafError::PartNotFound(name.to_string()))
    }

    /// The header's `length` is unchecked until verify_checksum(), so ranges are
    /// also bounded by the real file size.
    fn check_in_file(&self, name: &str, pos: u64, size: u64) -> Result<(), RkafError> {
        if pos + size > self.file_len {
            return Err(RkafError::PartTruncated {
                name: name.to_string(),
                pos,
                size,
                file_len: self.file_len,
            });
        }
        Ok(())
    }

    fn read_range(&mut self, name: &str, pos: u64, size: u64) -> Result<Vec<u8>, RkafError> {
        self.check_in_file(name, pos, size)?;
        self.reader.seek(SeekFrom::Start(pos)).map_err(self.io_err())?;
        let mut data = vec![0u8; size as usize];
        let got = self.reader.read_exact(&mut data);
        got.map_err(self.io_err())?;
        Ok(data)
    }

    /// Content of the named part as `unpack_image` would write it.
    pub fn read_part(&mut self, name: &str) -> Result<Vec<u8>, RkafError> {
        let part = self.find_part(name)?;
        let (pos, size) = content_range(&part, self.header.length)?;
        self.read_range(&part.name, pos, size)
    }

    /// The named part's stored bytes (`pos..pos + size`), wrapper included.
    pub fn read_part_raw(&mut self, name: &str) -> Result<Vec<u8>, RkafError> {
        let part = self.find_part(name)?;
        let (pos, size) = (u64::from(part.pos), u64::from(part.size));
        if pos + size > u64::from(self.header.length) {
            return Err(RkafError::PartOutOfRange {
                name: part.name,
                pos,
                size,
                length: self.header.length,
            });
        }
        self.read_range(&part.name, pos, size)
    }

    /// Stream one part's content to `dest`, creating missing parent directories and
    /// replacing any existing file. Returns the number of bytes written.
    pub fn extract_part(&mut self, part: &PartEntry, dest: &Path) -> Result<u64, RkafError> {
        let (pos, size) = content_range(part, self.header.length)?;
        self.check_in_file(&part.name, pos, size)?;
        let dest_err = |source| RkafError::Io {
            path: dest.to_path_buf(),
            source,
        };
        create_parent_dirs(dest).map_err(dest_err)?;
        let mut out = File::create(dest).map_err(dest_err)?;

        self.reader.seek(SeekFrom::Start(pos)).map_err(self.io_err())?;
        let written = io::copy(&mut (&mut self.reader).take(size), &mut out).map_err(dest_err)?;
        Ok(written)
    }
}

/// A part written by `unpack_image`.
#[derive(Debug)]
pub struct ExtractedPart {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// A part `unpack_image` could not extract.
#[derive(Debug)]
pub struct SkippedPart {
    pub name: String,
    pub error: RkafError,
}

/// Outcome of `unpack_image` once the checksum has passed.
#[derive(Debug, Default)]
pub struct UnpackReport {
    pub extracted: Vec<ExtractedPart>,
    pub skipped: Vec<SkippedPart>,
}

impl UnpackReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Verify `src` and extract every part (except `SELF`) under `dst_dir`.
///
/// Header, trailer and checksum failures abort before anything is written. Per-part
/// failures are logged and collected in the report.
pub fn unpack_image<P: AsRef<Path>, Q: AsRef<Path>>(
    src: P,
    dst_dir: Q,
) -> Result<UnpackReport, RkafError> {
    let dst_dir = dst_dir.as_ref();
    let mut reader = RkafReader::open(src)?;

    let crc = reader.verify_checksum()?;
    info!("Check file... OK ({crc:#010x})");

    let mut report = UnpackReport::default();
    for part in reader.header.parts.clone() {
        info!("{}\t{:#010x}\t{:#010x}", part.filename, part.pos, part.size);
        if part.is_self() {
            info!("Skip SELF file.");
            continue;
        }

        let result = destination(dst_dir, &part)
            .and_then(|dest| reader.extract_part(&part, &dest).map(|size| (dest, size)));
        match result {
            Ok((path, size)) => report.extracted.push(ExtractedPart {
                name: part.name,
                path,
                size,
            }),
            Err(error) => {
                warn!("skipping part {}: {error}", part.name);
                report.skipped.push(SkippedPart {
                    name: part.name,
                    error,
                });
            }
        }
    }
    Ok(report)
}
