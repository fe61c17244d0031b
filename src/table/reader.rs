//! # Table Reader
//!
//! Maps a table's column files read-only and serves typed point reads. A
//! reader is a snapshot: rows committed after it was opened are not visible
//! until the table is reopened. Readers never block the writer; the engine
//! level lock is the only cross-handle coordination.

use std::fs::File;
use std::path::Path;

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::Mmap;

use super::meta::{TableMeta, META_FILE_NAME};
use super::symbol::{self, SYMBOL_NULL_KEY};
use super::utils::{column_data_path, symbol_map_path, table_path};
use super::ColumnType;

struct ColumnSlice {
    ty: ColumnType,
    /// `None` for a column with no committed data.
    map: Option<Mmap>,
}

impl ColumnSlice {
    fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    fn value(&self, row: u64) -> &[u8] {
        let width = self.ty.value_width();
        let start = row as usize * width;
        &self.bytes()[start..start + width]
    }

    fn row_count(&self) -> u64 {
        (self.bytes().len() / self.ty.value_width()) as u64
    }
}

struct SymbolDictionary {
    entries: Vec<String>,
    has_null_flag: bool,
}

pub struct TableReader {
    table_name: String,
    meta: TableMeta,
    columns: Vec<ColumnSlice>,
    symbols: Vec<Option<SymbolDictionary>>,
    row_count: u64,
}

impl TableReader {
    pub fn open(root: &Path, name: &str) -> Result<Self> {
        let dir = table_path(root, name);
        let meta = TableMeta::read(&dir.join(META_FILE_NAME))?;

        let mut columns = Vec::with_capacity(meta.columns.len());
        let mut symbols = Vec::with_capacity(meta.columns.len());
        for column in &meta.columns {
            columns.push(ColumnSlice {
                ty: column.ty,
                map: map_column(&column_data_path(&dir, &column.name))?,
            });
            if column.ty == ColumnType::Symbol {
                let (entries, has_null_flag) =
                    symbol::read_symbols(&symbol_map_path(&dir, &column.name))?;
                symbols.push(Some(SymbolDictionary {
                    entries,
                    has_null_flag,
                }));
            } else {
                symbols.push(None);
            }
        }

        let row_count = columns.iter().map(ColumnSlice::row_count).min().unwrap_or(0);

        Ok(Self {
            table_name: name.to_string(),
            meta,
            columns,
            symbols,
            row_count,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn version(&self) -> u32 {
        self.meta.version
    }

    pub fn table_id(&self) -> u32 {
        self.meta.table_id
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_name(&self, i: usize) -> &str {
        &self.meta.columns[i].name
    }

    pub fn column_type(&self, i: usize) -> ColumnType {
        self.columns[i].ty
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    fn check_cell(&self, column: usize, row: u64, expected: ColumnType) -> Result<()> {
        ensure!(
            column < self.columns.len(),
            "column {} out of bounds for table '{}'",
            column,
            self.table_name
        );
        ensure!(
            row < self.row_count,
            "row {} out of bounds for table '{}' ({} rows)",
            row,
            self.table_name,
            self.row_count
        );
        let actual = self.columns[column].ty;
        ensure!(
            actual == expected,
            "column {} of table '{}' is {:?}, not {:?}",
            column,
            self.table_name,
            actual,
            expected
        );
        Ok(())
    }

    pub fn bool_at(&self, column: usize, row: u64) -> Result<bool> {
        self.check_cell(column, row, ColumnType::Bool)?;
        Ok(self.columns[column].value(row)[0] != 0)
    }

    pub fn int_at(&self, column: usize, row: u64) -> Result<i32> {
        self.check_cell(column, row, ColumnType::Int)?;
        Ok(i32::from_le_bytes(
            self.columns[column].value(row).try_into().unwrap(),
        ))
    }

    pub fn long_at(&self, column: usize, row: u64) -> Result<i64> {
        self.check_cell(column, row, ColumnType::Long)?;
        Ok(i64::from_le_bytes(
            self.columns[column].value(row).try_into().unwrap(),
        ))
    }

    pub fn double_at(&self, column: usize, row: u64) -> Result<f64> {
        self.check_cell(column, row, ColumnType::Double)?;
        Ok(f64::from_le_bytes(
            self.columns[column].value(row).try_into().unwrap(),
        ))
    }

    pub fn timestamp_at(&self, column: usize, row: u64) -> Result<i64> {
        self.check_cell(column, row, ColumnType::Timestamp)?;
        Ok(i64::from_le_bytes(
            self.columns[column].value(row).try_into().unwrap(),
        ))
    }

    /// Resolves a symbol cell through the dictionary; `None` is null.
    pub fn symbol_at(&self, column: usize, row: u64) -> Result<Option<&str>> {
        self.check_cell(column, row, ColumnType::Symbol)?;
        let key = i32::from_le_bytes(self.columns[column].value(row).try_into().unwrap());
        if key == SYMBOL_NULL_KEY {
            return Ok(None);
        }
        let dict = self.symbols[column].as_ref().expect("symbol dictionary");
        match dict.entries.get(key as usize) {
            Some(value) => Ok(Some(value)),
            None => bail!(
                "symbol key {} out of dictionary range for column {} of '{}'",
                key,
                column,
                self.table_name
            ),
        }
    }

    /// True when the column contains at least one null. Scans the committed
    /// keys rather than trusting the sidecar flag, which is exactly what
    /// the null-flag migration backfills.
    pub fn has_null(&self, column: usize) -> Result<bool> {
        ensure!(
            column < self.columns.len(),
            "column {} out of bounds for table '{}'",
            column,
            self.table_name
        );
        ensure!(
            self.columns[column].ty == ColumnType::Symbol,
            "column {} of table '{}' is not a symbol column",
            column,
            self.table_name
        );
        let slice = &self.columns[column];
        for row in 0..slice.row_count() {
            let key = i32::from_le_bytes(slice.value(row).try_into().unwrap());
            if key == SYMBOL_NULL_KEY {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The persisted sidecar flag, as last written.
    pub fn symbol_null_flag(&self, column: usize) -> Result<bool> {
        ensure!(
            column < self.columns.len() && self.columns[column].ty == ColumnType::Symbol,
            "column {} of table '{}' is not a symbol column",
            column,
            self.table_name
        );
        Ok(self.symbols[column]
            .as_ref()
            .expect("symbol dictionary")
            .has_null_flag)
    }
}

fn map_column(path: &Path) -> Result<Option<Mmap>> {
    let file = File::open(path)
        .wrap_err_with(|| format!("failed to open column file '{}'", path.display()))?;
    let len = file
        .metadata()
        .wrap_err_with(|| format!("failed to stat column file '{}'", path.display()))?
        .len();
    if len == 0 {
        return Ok(None);
    }
    // SAFETY: the file is mapped read-only and the mapping's lifetime is tied
    // to the ColumnSlice that owns it. A concurrent writer only ever appends;
    // the mapped prefix is immutable for the life of this reader.
    let map = unsafe {
        Mmap::map(&file)
            .wrap_err_with(|| format!("failed to memory-map column file '{}'", path.display()))?
    };
    Ok(Some(map))
}
