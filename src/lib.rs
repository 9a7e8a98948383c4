//! RKAF: packer and unpacker for Rockchip firmware update images (`update.img`).
//!
//! This crate provides:
//! - **Format types** (`format`): header, part entry, field offsets, constants (RKAF_MAGIC, etc.).
//! - **Checksum** (`crc`): the Rockchip CRC-32 used for the file trailer and the parameter block.
//! - **Partition table** (`partition`): `mtdparts=` parser and name lookup.
//! - **Manifests** (`manifest`): `parameter` and `package-file` parsers building a `PackageImage`.
//! - **Parameter block** (`param`): `PARM` wrap/unwrap for the parameter partition.
//! - **Packer** (`packer`): `pack_dir(src_dir, dst)` builds an image from a directory.
//! - **Reader** (`reader`): `RkafReader::open(path)` and `unpack_image(src, dst_dir)`.

pub mod crc;
pub mod format;
pub mod logger;
pub mod manifest;
pub mod packer;
pub mod param;
pub mod partition;
pub mod reader;

pub use crc::{crc32, stream_crc32, RkCrc};
pub use format::{
    FirmwareVersion, FormatError, PartEntry, RkafHeader, HEADER_LEN, MAX_PARTS, RKAF_MAGIC,
    SELF_FILENAME, UNRESOLVED_NAND_ADDR,
};
pub use manifest::{ManifestError, PackEntry, PackageImage, ParameterFile};
pub use packer::{pack_dir, write_image, PackError, PackOptions};
pub use param::{unwrap_parameter, wrap_parameter, ParamError, PARM_MAGIC};
pub use partition::{Partition, PartitionError, PartitionTable};
pub use reader::{unpack_image, RkafError, RkafReader, SkippedPart, UnpackReport};
