//! # Table Metadata (`_meta`)
//!
//! Every table directory carries a `_meta` file describing its columns and
//! on-disk format revision. The fixed header is 28 bytes; the engine's
//! upgrade machinery touches exactly two words of it, the format version and
//! the table id, which sit adjacent at [`META_OFFSET_VERSION`].
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Field
//! 0       4     Column count
//! 4       4     Partition-by code
//! 8       4     Designated timestamp index (u32::MAX = none)
//! 12      4     Format version
//! 16      4     Table id
//! 20      8     Reserved
//! 28      ...   Per column: type code (u32), name length (u32), name bytes
//! ```
//!
//! All multi-byte fields are little-endian; the header struct uses zerocopy
//! `U32` wrappers so reads off unaligned buffers are safe.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use smallvec::SmallVec;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const META_FILE_NAME: &str = "_meta";
pub const META_HEADER_SIZE: usize = 28;
/// Byte offset of the adjacent (version, table id) words.
pub const META_OFFSET_VERSION: u64 = 12;

/// Format revision written by this build.
pub const META_FORMAT_VERSION: u32 = 419;
/// Metadata below this revision predates table ids; the boot upgrade
/// assigns one.
pub const VERSION_THAT_ADDED_TABLE_ID: u32 = 417;
/// Metadata below this revision predates the symbol has-null flag.
pub const VERSION_THAT_ADDED_SYMBOL_NULL_FLAG: u32 = 416;

/// Sentinel for "no designated timestamp".
pub const TIMESTAMP_NONE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    Int,
    Long,
    Double,
    Timestamp,
    Symbol,
}

impl ColumnType {
    pub fn code(self) -> u32 {
        match self {
            ColumnType::Bool => 1,
            ColumnType::Int => 2,
            ColumnType::Long => 3,
            ColumnType::Double => 4,
            ColumnType::Timestamp => 5,
            ColumnType::Symbol => 6,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(ColumnType::Bool),
            2 => Some(ColumnType::Int),
            3 => Some(ColumnType::Long),
            4 => Some(ColumnType::Double),
            5 => Some(ColumnType::Timestamp),
            6 => Some(ColumnType::Symbol),
            _ => None,
        }
    }

    /// Width of one value in the column data file. Symbol columns store
    /// i32 dictionary keys (-1 encodes null).
    pub fn value_width(self) -> usize {
        match self {
            ColumnType::Bool => 1,
            ColumnType::Int => 4,
            ColumnType::Long => 8,
            ColumnType::Double => 8,
            ColumnType::Timestamp => 8,
            ColumnType::Symbol => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

/// Shape of a table to be created.
#[derive(Debug, Clone)]
pub struct TableStructure {
    pub name: String,
    pub columns: SmallVec<[ColumnDef; 8]>,
    pub timestamp_index: Option<u32>,
    pub partition_by: u32,
}

impl TableStructure {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: SmallVec::new(),
            timestamp_index: None,
            partition_by: 0,
        }
    }

    pub fn column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            ty,
        });
        self
    }

    pub fn timestamp(mut self, index: u32) -> Self {
        self.timestamp_index = Some(index);
        self
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct MetaHeader {
    column_count: U32,
    partition_by: U32,
    timestamp_index: U32,
    version: U32,
    table_id: U32,
    reserved: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<MetaHeader>() == META_HEADER_SIZE);

/// Decoded contents of a `_meta` file.
#[derive(Debug, Clone)]
pub struct TableMeta {
    pub version: u32,
    pub table_id: u32,
    pub timestamp_index: Option<u32>,
    pub partition_by: u32,
    pub columns: SmallVec<[ColumnDef; 8]>,
}

impl TableMeta {
    pub fn read(path: &Path) -> Result<Self> {
        let mut bytes = Vec::new();
        File::open(path)
            .wrap_err_with(|| format!("failed to open metadata file '{}'", path.display()))?
            .read_to_end(&mut bytes)
            .wrap_err_with(|| format!("failed to read metadata file '{}'", path.display()))?;
        Self::decode(&bytes)
            .wrap_err_with(|| format!("corrupt metadata file '{}'", path.display()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= META_HEADER_SIZE,
            "metadata too short: {} < {}",
            bytes.len(),
            META_HEADER_SIZE
        );
        let header = MetaHeader::ref_from_bytes(&bytes[..META_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse metadata header: {:?}", e))?;

        let column_count = header.column_count.get() as usize;
        let mut columns = SmallVec::new();
        let mut cursor = META_HEADER_SIZE;
        for i in 0..column_count {
            ensure!(
                bytes.len() >= cursor + 8,
                "metadata truncated in column {} entry",
                i
            );
            let code = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
            let name_len =
                u32::from_le_bytes(bytes[cursor + 4..cursor + 8].try_into().unwrap()) as usize;
            cursor += 8;
            ensure!(
                bytes.len() >= cursor + name_len,
                "metadata truncated in column {} name",
                i
            );
            let name = std::str::from_utf8(&bytes[cursor..cursor + name_len])
                .wrap_err_with(|| format!("column {} name is not UTF-8", i))?
                .to_string();
            cursor += name_len;

            let ty = ColumnType::from_code(code)
                .ok_or_else(|| eyre::eyre!("unknown column type code {} for '{}'", code, name))?;
            columns.push(ColumnDef { name, ty });
        }

        let timestamp_index = match header.timestamp_index.get() {
            TIMESTAMP_NONE => None,
            i => Some(i),
        };

        Ok(Self {
            version: header.version.get(),
            table_id: header.table_id.get(),
            timestamp_index,
            partition_by: header.partition_by.get(),
            columns,
        })
    }

    pub fn encode(
        structure: &TableStructure,
        version: u32,
        table_id: u32,
    ) -> Vec<u8> {
        let header = MetaHeader {
            column_count: U32::new(structure.columns.len() as u32),
            partition_by: U32::new(structure.partition_by),
            timestamp_index: U32::new(structure.timestamp_index.unwrap_or(TIMESTAMP_NONE)),
            version: U32::new(version),
            table_id: U32::new(table_id),
            reserved: [0u8; 8],
        };

        let mut bytes = Vec::with_capacity(META_HEADER_SIZE + structure.columns.len() * 24);
        bytes.extend_from_slice(header.as_bytes());
        for column in &structure.columns {
            bytes.extend_from_slice(&column.ty.code().to_le_bytes());
            bytes.extend_from_slice(&(column.name.len() as u32).to_le_bytes());
            bytes.extend_from_slice(column.name.as_bytes());
        }
        bytes
    }

    pub fn write(path: &Path, structure: &TableStructure, version: u32, table_id: u32) -> Result<()> {
        let bytes = Self::encode(structure, version, table_id);
        std::fs::write(path, bytes)
            .wrap_err_with(|| format!("failed to write metadata file '{}'", path.display()))
    }
}

/// Rewrites the format version word in place, leaving the rest of the file
/// untouched.
pub fn bump_meta_version(path: &Path, version: u32) -> Result<()> {
    let mut file = File::options()
        .read(true)
        .write(true)
        .open(path)
        .wrap_err_with(|| format!("failed to open metadata file '{}'", path.display()))?;
    file.seek(SeekFrom::Start(META_OFFSET_VERSION))
        .wrap_err("failed to seek to version word")?;
    file.write_all(&version.to_le_bytes())
        .wrap_err_with(|| format!("failed to update version in '{}'", path.display()))?;
    Ok(())
}
