//! Pack-side manifests: the device `parameter` file and the `package-file` list.
//!
//! Both are line-oriented text. Lines are trimmed; blank lines and lines starting
//! with `#` are skipped. Together they build a [`PackageImage`], the in-memory
//! description of an image that the packer streams to disk.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

use crate::format::{
    check_text, FirmwareVersion, FormatError, ID_LEN, MANUFACTURER_LEN, MAX_PARTS, MODEL_LEN,
    PART_FILENAME_LEN, PART_NAME_LEN, UNRESOLVED_NAND_ADDR,
};
use crate::partition::{PartitionError, PartitionTable};

/// Name of the parameter manifest inside a pack directory.
pub const PARAMETER_FILE: &str = "parameter";

/// Name of the package list inside a pack directory.
pub const PACKAGE_FILE: &str = "package-file";

const UTF8_BOM: char = '\u{feff}';

/// Errors produced while reading or parsing a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}: {source}", path.display())]
    InFile {
        path: PathBuf,
        #[source]
        source: Box<ManifestError>,
    },
    #[error("not valid UTF-8")]
    InvalidUtf8,
    #[error("line {line}: missing {delimiter}")]
    MissingDelimiter { line: usize, delimiter: &'static str },
    #[error("line {line}: {source}")]
    Field {
        line: usize,
        #[source]
        source: FormatError,
    },
    #[error("line {line}: invalid FIRMWARE_VER: {reason}")]
    InvalidVersion { line: usize, reason: String },
    #[error("line {line}: {source}")]
    Partition {
        line: usize,
        #[source]
        source: PartitionError,
    },
    #[error("too many packages: more than 16 entries")]
    TooManyPackages,
}

impl ManifestError {
    fn in_file(self, path: &Path) -> Self {
        match self {
            e @ (Self::Io { .. } | Self::InFile { .. }) => e,
            e => Self::InFile {
                path: path.to_path_buf(),
                source: Box::new(e),
            },
        }
    }
}

fn read_text(path: &Path) -> Result<String, ManifestError> {
    let bytes = fs::read(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    String::from_utf8(bytes).map_err(|_| ManifestError::InvalidUtf8.in_file(path))
}

/// Significant lines with their 1-based line numbers. Accepts `\n`, `\r\n` and bare `\r`.
fn significant_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.split('\n')
        .enumerate()
        .flat_map(|(i, raw)| raw.split('\r').map(move |l| (i + 1, l.trim())))
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'))
}

/// Parsed device `parameter` file: the header metadata and the partition table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterFile {
    pub version: FirmwareVersion,
    pub model: String,
    pub id: String,
    pub manufacturer: String,
    pub partitions: PartitionTable,
}

impl ParameterFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let text = read_text(path)?;
        Self::parse(&text).map_err(|e| e.in_file(path))
    }

    /// Parse `KEY:value` lines. Unknown keys are ignored.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut param = Self::default();
        for (line, content) in significant_lines(text) {
            let (key, value) = content
                .split_once(':')
                .ok_or(ManifestError::MissingDelimiter { line, delimiter: "':'" })?;
            param.apply(line, key, value)?;
        }
        Ok(param)
    }

    fn apply(&mut self, line: usize, key: &str, value: &str) -> Result<(), ManifestError> {
        let field = |source| ManifestError::Field { line, source };
        match key {
            "FIRMWARE_VER" => {
                self.version = value
                    .parse()
                    .map_err(|reason| ManifestError::InvalidVersion { line, reason })?;
            }
            "MACHINE_MODEL" => {
                check_text(value, MODEL_LEN, "MACHINE_MODEL").map_err(field)?;
                self.model = value.to_string();
            }
            "MACHINE_ID" => {
                check_text(value, ID_LEN, "MACHINE_ID").map_err(field)?;
                self.id = value.to_string();
            }
            "MANUFACTURER" => {
                check_text(value, MANUFACTURER_LEN, "MANUFACTURER").map_err(field)?;
                self.manufacturer = value.to_string();
            }
            "CMDLINE" => {
                for param in value.split(' ').filter(|p| !p.is_empty()) {
                    if let Some(("mtdparts", parts)) = param.split_once('=') {
                        self.partitions
                            .extend_from_mtdparts(parts)
                            .map_err(|source| ManifestError::Partition { line, source })?;
                    }
                }
            }
            _ => debug!("ignoring parameter key {key:?}"),
        }
        Ok(())
    }
}

/// One `name path` line of the package list, with its flash target resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackEntry {
    pub name: String,
    pub filename: String,
    /// `UNRESOLVED_NAND_ADDR` when the name is not in the partition table.
    pub nand_addr: u32,
    pub nand_size: u32,
}

impl PackEntry {
    /// Build an entry, resolving its flash target from `partitions`.
    #[must_use]
    pub fn resolve(name: &str, filename: &str, partitions: &PartitionTable) -> Self {
        let (nand_addr, nand_size) = partitions
            .find(name)
            .map_or((UNRESOLVED_NAND_ADDR, 0), |p| (p.start, p.size));
        Self {
            name: name.to_string(),
            filename: filename.to_string(),
            nand_addr,
            nand_size,
        }
    }
}

/// Parse a package list. Each line is `name<space|tab>path`; the path runs to the end of the line.
pub fn parse_package_list(
    text: &str,
    partitions: &PartitionTable,
) -> Result<Vec<PackEntry>, ManifestError> {
    let mut entries = Vec::new();
    for (line, content) in significant_lines(text) {
        let content = content.trim_start_matches(UTF8_BOM);
        if content.is_empty() || content.starts_with('#') {
            continue;
        }
        let (name, filename) = content
            .split_once([' ', '\t'])
            .map(|(n, f)| (n, f.trim_start_matches([' ', '\t'])))
            .filter(|(_, f)| !f.is_empty())
            .ok_or(ManifestError::MissingDelimiter { line, delimiter: "path" })?;

        let field = |source| ManifestError::Field { line, source };
        check_text(name, PART_NAME_LEN, "part name").map_err(field)?;
        check_text(filename, PART_FILENAME_LEN, "part filename").map_err(field)?;
        if entries.len() >= MAX_PARTS {
            return Err(ManifestError::TooManyPackages);
        }

        let entry = PackEntry::resolve(name, filename, partitions);
        debug!(
            "package {} -> {} (nand {:#010x}+{:#x})",
            entry.name, entry.filename, entry.nand_addr, entry.nand_size
        );
        entries.push(entry);
    }
    Ok(entries)
}

/// Everything needed to write an image, built before any byte is streamed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageImage {
    pub parameter: ParameterFile,
    pub packages: Vec<PackEntry>,
}

impl PackageImage {
    /// Read `parameter` and `package-file` from `dir`.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self, ManifestError> {
        let dir = dir.as_ref();
        let parameter = ParameterFile::load(dir.join(PARAMETER_FILE))?;
        let list_path = dir.join(PACKAGE_FILE);
        let text = read_text(&list_path)?;
        let packages =
            parse_package_list(&text, &parameter.partitions).map_err(|e| e.in_file(&list_path))?;
        Ok(Self {
            parameter,
            packages,
        })
    }
}
