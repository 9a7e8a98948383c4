//! RKAF packer: build an image from a directory holding `parameter`, `package-file`
//! and the files the package list names.
//!
//! Writes a zeroed placeholder header, streams every part, rewrites the header with
//! the final layout, then appends the CRC-32 of everything before it.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;

use crate::crc::stream_crc32;
use crate::format::{FormatError, PartEntry, RkafHeader, HEADER_LEN, TRAILER_LEN};
use crate::manifest::{ManifestError, PackageImage};
use crate::param::{self, wrap_parameter, ParamError, DEFAULT_PARM_BLOCK, PARM_OVERHEAD};
use crate::reader::read_full;

/// Errors produced by the packer.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("write to image failed: {0}")]
    Output(#[source] io::Error),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Param(#[from] ParamError),
    #[error("invalid pack options: {0}")]
    InvalidOptions(String),
    #[error("image too large: offset {0} does not fit in 32 bits")]
    TooLarge(u64),
    #[cfg(feature = "serde")]
    #[error("{}: {source}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl From<io::Error> for PackError {
    fn from(e: io::Error) -> Self {
        PackError::Output(e)
    }
}

impl PackError {
    /// Attach the destination path to errors raised while writing the image.
    fn at_output(self, path: &Path) -> Self {
        match self {
            PackError::Output(source) => PackError::Io {
                path: path.to_path_buf(),
                source,
            },
            e => e,
        }
    }
}

/// Options for building an image.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct PackOptions {
    /// Ordinary parts are written in chunks of this size, the last one zero-padded.
    pub chunk_size: usize,
    /// Size of the `PARM` block written for the `parameter` part.
    pub parameter_block_size: usize,
    /// The `SELF` entry's `padded_size` is rounded up to this.
    pub self_alignment: u32,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            chunk_size: 2048,
            parameter_block_size: DEFAULT_PARM_BLOCK,
            self_alignment: 512,
        }
    }
}

impl PackOptions {
    pub fn validate(&self) -> Result<(), PackError> {
        if self.chunk_size == 0 {
            return Err(PackError::InvalidOptions("chunk_size must be non-zero".into()));
        }
        if self.parameter_block_size <= PARM_OVERHEAD {
            return Err(PackError::InvalidOptions(format!(
                "parameter_block_size must exceed {PARM_OVERHEAD}"
            )));
        }
        if self.self_alignment == 0 {
            return Err(PackError::InvalidOptions("self_alignment must be non-zero".into()));
        }
        Ok(())
    }

    /// Load options from a TOML file; missing keys keep their defaults.
    #[cfg(feature = "serde")]
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, PackError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| PackError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let options: Self = toml::from_str(&text).map_err(|source| PackError::Config {
            path: path.to_path_buf(),
            source,
        })?;
        options.validate()?;
        Ok(options)
    }
}

fn offset32(offset: u64) -> Result<u32, PackError> {
    u32::try_from(offset).map_err(|_| PackError::TooLarge(offset))
}

/// Stream `src` in zero-padded chunks. Sets `size` to the bytes read and `padded_size`
/// to the bytes written (a multiple of the chunk size).
fn import_chunks<R: Read, W: Write>(
    out: &mut W,
    src: &mut R,
    src_path: &Path,
    part: &mut PartEntry,
    chunk_size: usize,
) -> Result<(), PackError> {
    let mut buf = vec![0u8; chunk_size];
    let mut size = 0u64;
    let mut padded = 0u64;
    loop {
        let n = read_full(src, &mut buf).map_err(|source| PackError::Io {
            path: src_path.to_path_buf(),
            source,
        })?;
        if n == 0 {
            break;
        }
        buf[n..].fill(0);
        out.write_all(&buf)?;
        size += n as u64;
        padded += chunk_size as u64;
        if n < chunk_size {
            break;
        }
    }
    part.size = offset32(size)?;
    part.padded_size = offset32(padded)?;
    Ok(())
}

/// Wrap the parameter manifest in a `PARM` block. Content beyond the block's capacity is dropped.
fn import_parameter<R: Read, W: Write>(
    out: &mut W,
    src: &mut R,
    src_path: &Path,
    part: &mut PartEntry,
    block_size: usize,
) -> Result<(), PackError> {
    let cap = param::capacity(block_size);
    let mut content = Vec::with_capacity(cap);
    src.take(cap as u64 + 1)
        .read_to_end(&mut content)
        .map_err(|source| PackError::Io {
            path: src_path.to_path_buf(),
            source,
        })?;
    if content.len() > cap {
        warn!(
            "{}: parameter larger than {cap} bytes, truncating",
            src_path.display()
        );
        content.truncate(cap);
    }

    let block = wrap_parameter(&content, block_size)?;
    out.write_all(&block)?;
    part.size = offset32((content.len() + PARM_OVERHEAD) as u64)?;
    part.padded_size = offset32(block.len() as u64)?;
    Ok(())
}

/// Write the CRC-32 of the first `length` bytes at offset `length`.
fn append_crc<W: Read + Write + Seek>(out: &mut W, length: u32) -> Result<u32, PackError> {
    out.seek(SeekFrom::Start(0))?;
    let crc = stream_crc32(out, u64::from(length))?;
    out.seek(SeekFrom::Start(u64::from(length)))?;
    out.write_all(&crc.to_le_bytes())?;
    Ok(crc)
}

/// Write a complete image for `image` to `out`, reading part files relative to `src_dir`.
/// The image occupies `0..length + 4`; bytes a pre-filled `out` holds past that are
/// left in place, so callers reusing a buffer or file should truncate it.
/// Returns the header as written (without the trailer).
pub fn write_image<W: Read + Write + Seek>(
    out: &mut W,
    image: &PackageImage,
    src_dir: &Path,
    options: &PackOptions,
) -> Result<RkafHeader, PackError> {
    options.validate()?;

    out.seek(SeekFrom::Start(0))?;
    out.write_all(&[0u8; HEADER_LEN])?;

    let param = &image.parameter;
    let mut header = RkafHeader {
        model: param.model.clone(),
        id: param.id.clone(),
        manufacturer: param.manufacturer.clone(),
        version: param.version.packed(),
        ..RkafHeader::default()
    };

    for pkg in &image.packages {
        let mut part = PartEntry {
            name: pkg.name.clone(),
            filename: pkg.filename.clone(),
            nand_addr: pkg.nand_addr,
            nand_size: pkg.nand_size,
            ..PartEntry::default()
        };
        if part.is_self() {
            header.parts.push(part);
            continue;
        }

        info!("Add file: {}", part.filename);
        let src_path = src_dir.join(&part.filename);
        let mut src = File::open(&src_path).map_err(|source| PackError::Io {
            path: src_path.clone(),
            source,
        })?;
        part.pos = offset32(out.stream_position()?)?;
        if part.is_parameter() {
            import_parameter(out, &mut src, &src_path, &mut part, options.parameter_block_size)?;
        } else {
            import_chunks(out, &mut src, &src_path, &mut part, options.chunk_size)?;
        }
        debug!(
            "{}: pos {:#010x} size {:#x} padded {:#x}",
            part.name, part.pos, part.size, part.padded_size
        );
        header.parts.push(part);
    }

    header.length = offset32(out.stream_position()?)?;
    for part in header.parts.iter_mut().filter(|p| p.is_self()) {
        let size = u64::from(header.length) + u64::from(TRAILER_LEN);
        let align = u64::from(options.self_alignment);
        part.size = offset32(size)?;
        part.padded_size = offset32(size.div_ceil(align) * align)?;
    }

    out.seek(SeekFrom::Start(0))?;
    out.write_all(&header.encode()?)?;

    let crc = append_crc(out, header.length)?;
    info!("Add CRC {crc:#010x} over {} bytes", header.length);
    Ok(header)
}

/// Pack `src_dir` into a new image at `dst`. Manifests are parsed before the
/// destination is created, so a bad manifest leaves no output behind.
pub fn pack_dir<P: AsRef<Path>, Q: AsRef<Path>>(
    src_dir: P,
    dst: Q,
    options: &PackOptions,
) -> Result<RkafHeader, PackError> {
    let src_dir = src_dir.as_ref();
    let dst = dst.as_ref();
    options.validate()?;

    let image = PackageImage::load(src_dir)?;
    info!(
        "packing {} parts from {} (firmware {})",
        image.packages.len(),
        src_dir.display(),
        image.parameter.version
    );

    let mut out = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)
        .map_err(|source| PackError::Io {
            path: dst.to_path_buf(),
            source,
        })?;
    let header = write_image(&mut out, &image, src_dir, options).map_err(|e| e.at_output(dst))?;
    out.sync_all().map_err(|source| PackError::Io {
        path: dst.to_path_buf(),
        source,
    })?;
    Ok(header)
}
