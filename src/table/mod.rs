//! # Table Surface
//!
//! Minimal columnar table handles the coordinator leases out: a writer that
//! appends fixed-width values to per-column files and a reader that maps the
//! same files for scanning. The single-writer / many-readers discipline is
//! enforced by the pools, not by file locks; these handles assume the caller
//! obtained them through the engine.
//!
//! On disk a table is a directory under the data root:
//!
//! ```text
//! <root>/<table>/
//! ├── _meta        # column layout, format version, table id
//! ├── <col>.d      # fixed-width LE values, one file per column
//! └── <col>.sym    # dictionary sidecar for symbol columns
//! ```

mod meta;
mod reader;
mod symbol;
mod utils;
mod writer;

pub use meta::{
    bump_meta_version, ColumnDef, ColumnType, TableMeta, TableStructure, META_FILE_NAME,
    META_FORMAT_VERSION, META_HEADER_SIZE, META_OFFSET_VERSION, TIMESTAMP_NONE,
    VERSION_THAT_ADDED_SYMBOL_NULL_FLAG, VERSION_THAT_ADDED_TABLE_ID,
};
pub use reader::TableReader;
pub use symbol::{SYMBOL_FILE_SUFFIX, SYMBOL_NULL_KEY};
pub use utils::{
    column_data_path, create_table, meta_path, symbol_map_path, table_path, table_status,
    TableStatus,
};
pub use writer::{SymbolMapWriter, TableWriter};

/// A single cell value handed to the writer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Timestamp(i64),
    Symbol(&'a str),
    /// Only symbol columns accept null.
    Null,
}
