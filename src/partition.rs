//! Partition table parsed from a boot command line `mtdparts=` value.
//!
//! Grammar: `<prefix>:<size>@<offset>(<name>)[,<size>@<offset>(<name>)...]`, where
//! size and offset are hexadecimal (optional `0x`). Used by the packer to resolve
//! each part's flash address and size by name.

use thiserror::Error;

use crate::format::PARAMETER_NAME;

/// Capacity of the partition table.
pub const MAX_PARTITIONS: usize = 16;

/// Longest partition name kept; longer names are truncated.
pub const MAX_PARTITION_NAME: usize = 31;

/// Errors produced while parsing an mtdparts value.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("partition table full: more than 16 partitions in mtdparts")]
    TableFull,
    #[error("partition {field} out of range: {text:?}")]
    OutOfRange { field: &'static str, text: String },
}

/// One named flash region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub start: u32,
    pub size: u32,
}

impl Partition {
    /// Implicit partition consulted when no explicit `parameter` entry is declared.
    #[must_use]
    pub fn default_parameter() -> Self {
        Self {
            name: PARAMETER_NAME.to_string(),
            start: 0,
            size: 0x2000,
        }
    }
}

/// Ordered, bounded partition table (declaration order).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionTable {
    partitions: Vec<Partition>,
}

impl PartitionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a whole mtdparts value into a fresh table.
    pub fn parse(mtdparts: &str) -> Result<Self, PartitionError> {
        let mut table = Self::new();
        table.extend_from_mtdparts(mtdparts)?;
        Ok(table)
    }

    /// Append every partition in `mtdparts`, in token order. Tokens without `@` are skipped.
    /// A value without `:` declares nothing.
    pub fn extend_from_mtdparts(&mut self, mtdparts: &str) -> Result<(), PartitionError> {
        let Some((_, list)) = mtdparts.split_once(':') else {
            return Ok(());
        };
        for token in list.split(',').filter(|t| !t.is_empty()) {
            if let Some(partition) = parse_token(token)? {
                self.push(partition)?;
            }
        }
        Ok(())
    }

    pub fn push(&mut self, partition: Partition) -> Result<(), PartitionError> {
        if self.partitions.len() >= MAX_PARTITIONS {
            return Err(PartitionError::TableFull);
        }
        self.partitions.push(partition);
        Ok(())
    }

    /// Look up by name. The last declared entry wins; `parameter` falls back to the
    /// implicit default when not declared.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Partition> {
        self.partitions
            .iter()
            .rev()
            .find(|p| p.name == name)
            .cloned()
            .or_else(|| (name == PARAMETER_NAME).then(Partition::default_parameter))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter()
    }
}

/// `<size>@<offset>(<name>)`; `None` when the token has no `@`.
fn parse_token(token: &str) -> Result<Option<Partition>, PartitionError> {
    let (size, rest) = parse_hex(token, "size")?;
    let Some(at) = rest.find('@') else {
        return Ok(None);
    };
    let (start, rest) = parse_hex(&rest[at + 1..], "offset")?;

    let name = match rest.find('(') {
        Some(open) => {
            let inner = &rest[open + 1..];
            let inner = inner.find(')').map_or(inner, |close| &inner[..close]);
            truncate_name(inner)
        }
        None => String::new(),
    };

    Ok(Some(Partition { name, start, size }))
}

/// Hex number in the manner of `strtol(s, &end, 16)`: leading whitespace, optional
/// `0x`, digits up to the first non-hex character. No digits parses as 0 and consumes nothing.
fn parse_hex<'a>(s: &'a str, field: &'static str) -> Result<(u32, &'a str), PartitionError> {
    let trimmed = s.trim_start();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .filter(|b| b.starts_with(|c: char| c.is_ascii_hexdigit()))
        .unwrap_or(trimmed);
    let digits = body.find(|c: char| !c.is_ascii_hexdigit()).unwrap_or(body.len());
    if digits == 0 {
        return Ok((0, s));
    }
    let value = u32::from_str_radix(&body[..digits], 16).map_err(|_| PartitionError::OutOfRange {
        field,
        text: body[..digits].to_string(),
    })?;
    Ok((value, &body[digits..]))
}

fn truncate_name(name: &str) -> String {
    if name.len() <= MAX_PARTITION_NAME {
        return name.to_string();
    }
    let mut end = MAX_PARTITION_NAME;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
