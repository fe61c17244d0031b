//! # Table Writer
//!
//! Appends rows to a table's per-column files. Values are staged in memory
//! and hit disk on `commit`; dropping a writer with staged rows discards
//! them. A writer constructed through the pool carries the message bus and
//! announces every commit on it.
//!
//! The writer does not lock files. Exclusivity comes from the writer pool's
//! one-lease-per-name discipline.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;

use crate::bus::{MessageBus, WriterEvent};

use super::meta::{TableMeta, META_FILE_NAME, META_FORMAT_VERSION};
use super::symbol::{self, SYMBOL_NULL_KEY};
use super::utils::{column_data_path, symbol_map_path, table_path};
use super::{bump_meta_version, ColumnType, Value};

struct ColumnAppender {
    path: PathBuf,
    ty: ColumnType,
    pending: Vec<u8>,
}

struct SymbolState {
    path: PathBuf,
    keys: HashMap<String, i32>,
    entries: Vec<String>,
    has_null: bool,
    dirty: bool,
}

impl SymbolState {
    fn load(path: PathBuf) -> Result<Self> {
        let (entries, has_null) = symbol::read_symbols(&path)?;
        let keys = entries
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as i32))
            .collect();
        Ok(Self {
            path,
            keys,
            entries,
            has_null,
            dirty: false,
        })
    }

    fn intern(&mut self, value: &str) -> i32 {
        if let Some(&key) = self.keys.get(value) {
            return key;
        }
        let key = self.entries.len() as i32;
        self.entries.push(value.to_string());
        self.keys.insert(value.to_string(), key);
        self.dirty = true;
        key
    }
}

/// Updates the persisted state of one symbol column's dictionary sidecar.
pub struct SymbolMapWriter<'a> {
    state: &'a mut SymbolState,
}

impl SymbolMapWriter<'_> {
    pub fn update_null_flag(&mut self, has_null: bool) -> Result<()> {
        symbol::update_null_flag(&self.state.path, has_null)?;
        self.state.has_null = has_null;
        Ok(())
    }

    pub fn has_null(&self) -> bool {
        self.state.has_null
    }
}

pub struct TableWriter {
    dir: PathBuf,
    table_name: String,
    meta: TableMeta,
    columns: Vec<ColumnAppender>,
    symbols: HashMap<usize, SymbolState>,
    row_count: u64,
    pending_rows: u64,
    bus: Option<Arc<MessageBus>>,
}

impl std::fmt::Debug for TableWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableWriter")
            .field("table_name", &self.table_name)
            .field("row_count", &self.row_count)
            .field("pending_rows", &self.pending_rows)
            .finish_non_exhaustive()
    }
}

impl TableWriter {
    /// Opens a pooled writer; commits are announced on `bus`.
    pub fn open(root: &Path, name: &str, bus: Arc<MessageBus>) -> Result<Self> {
        Self::open_at(table_path(root, name), name, Some(bus))
    }

    /// Opens a writer with no message bus attached.
    pub fn open_detached(root: &Path, name: &str) -> Result<Self> {
        Self::open_at(table_path(root, name), name, None)
    }

    /// Copies the table into `<backup_root>/<name>` and opens a detached
    /// writer over the copy. Backup writers are one-shot and never pooled.
    pub fn open_backup(
        root: &Path,
        backup_root: &Path,
        name: &str,
        mk_dir_mode: u32,
    ) -> Result<Self> {
        let src = table_path(root, name);
        ensure!(
            src.join(META_FILE_NAME).is_file(),
            "table '{}' does not exist under '{}'",
            name,
            root.display()
        );

        fs::create_dir_all(backup_root).wrap_err_with(|| {
            format!("failed to create backup root '{}'", backup_root.display())
        })?;
        let dst = table_path(backup_root, name);
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(mk_dir_mode);
        }
        #[cfg(not(unix))]
        let _ = mk_dir_mode;
        builder
            .create(&dst)
            .wrap_err_with(|| format!("failed to create backup directory '{}'", dst.display()))?;

        for entry in fs::read_dir(&src)
            .wrap_err_with(|| format!("failed to list table directory '{}'", src.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::copy(entry.path(), dst.join(entry.file_name())).wrap_err_with(|| {
                    format!("failed to copy '{}' into backup", entry.path().display())
                })?;
            }
        }

        Self::open_at(dst, name, None)
    }

    fn open_at(dir: PathBuf, name: &str, bus: Option<Arc<MessageBus>>) -> Result<Self> {
        let meta = TableMeta::read(&dir.join(META_FILE_NAME))?;

        let mut columns = Vec::with_capacity(meta.columns.len());
        let mut symbols = HashMap::new();
        for (i, column) in meta.columns.iter().enumerate() {
            columns.push(ColumnAppender {
                path: column_data_path(&dir, &column.name),
                ty: column.ty,
                pending: Vec::new(),
            });
            if column.ty == ColumnType::Symbol {
                symbols.insert(i, SymbolState::load(symbol_map_path(&dir, &column.name))?);
            }
        }

        let row_count = committed_row_count(&columns)?;

        Ok(Self {
            dir,
            table_name: name.to_string(),
            meta,
            columns,
            symbols,
            row_count,
            pending_rows: 0,
            bus,
        })
    }

    /// Stages one row. Values must match the column layout; only symbol
    /// columns accept [`Value::Null`].
    pub fn append_row(&mut self, values: &[Value<'_>]) -> Result<()> {
        ensure!(
            values.len() == self.columns.len(),
            "row has {} values, table '{}' has {} columns",
            values.len(),
            self.table_name,
            self.columns.len()
        );

        for (i, value) in values.iter().enumerate() {
            let ty = self.columns[i].ty;
            match (ty, value) {
                (ColumnType::Bool, Value::Bool(b)) => self.columns[i].pending.push(*b as u8),
                (ColumnType::Int, Value::Int(v)) => {
                    self.columns[i].pending.extend_from_slice(&v.to_le_bytes())
                }
                (ColumnType::Long, Value::Long(v)) => {
                    self.columns[i].pending.extend_from_slice(&v.to_le_bytes())
                }
                (ColumnType::Double, Value::Double(v)) => {
                    self.columns[i].pending.extend_from_slice(&v.to_le_bytes())
                }
                (ColumnType::Timestamp, Value::Timestamp(v)) => {
                    self.columns[i].pending.extend_from_slice(&v.to_le_bytes())
                }
                (ColumnType::Symbol, Value::Symbol(s)) => {
                    let state = self.symbols.get_mut(&i).expect("symbol state exists");
                    let key = state.intern(s);
                    self.columns[i].pending.extend_from_slice(&key.to_le_bytes());
                }
                (ColumnType::Symbol, Value::Null) => {
                    let state = self.symbols.get_mut(&i).expect("symbol state exists");
                    if !state.has_null {
                        state.has_null = true;
                        state.dirty = true;
                    }
                    self.columns[i]
                        .pending
                        .extend_from_slice(&SYMBOL_NULL_KEY.to_le_bytes());
                }
                (ty, value) => bail!(
                    "column {} of table '{}' is {:?}, got {:?}",
                    i,
                    self.table_name,
                    ty,
                    value
                ),
            }
        }

        self.pending_rows += 1;
        Ok(())
    }

    /// Flushes staged rows and dictionary changes to disk. Returns the
    /// number of rows committed.
    pub fn commit(&mut self) -> Result<u64> {
        if self.pending_rows == 0 {
            return Ok(0);
        }

        for column in &mut self.columns {
            let mut file = fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(&column.path)
                .wrap_err_with(|| {
                    format!("failed to open column file '{}'", column.path.display())
                })?;
            use std::io::Write;
            file.write_all(&column.pending).wrap_err_with(|| {
                format!("failed to append to column file '{}'", column.path.display())
            })?;
            column.pending.clear();
        }

        for state in self.symbols.values_mut() {
            if state.dirty {
                symbol::write_symbols(&state.path, &state.entries, state.has_null)?;
                state.dirty = false;
            }
        }

        let rows = self.pending_rows;
        self.pending_rows = 0;
        self.row_count += rows;

        if let Some(bus) = &self.bus {
            bus.publish(WriterEvent::Committed {
                table: self.table_name.clone(),
                rows,
            });
        }
        Ok(rows)
    }

    /// Discards staged rows.
    pub fn rollback(&mut self) {
        for column in &mut self.columns {
            column.pending.clear();
        }
        self.pending_rows = 0;
    }

    pub fn symbol_map_writer(&mut self, column_index: usize) -> Result<SymbolMapWriter<'_>> {
        ensure!(
            column_index < self.columns.len(),
            "column index {} out of bounds for table '{}'",
            column_index,
            self.table_name
        );
        match self.symbols.get_mut(&column_index) {
            Some(state) => Ok(SymbolMapWriter { state }),
            None => bail!(
                "column {} of table '{}' is not a symbol column",
                column_index,
                self.table_name
            ),
        }
    }

    /// Stamps the current format version into `_meta`.
    pub fn update_metadata_version(&mut self) -> Result<()> {
        bump_meta_version(&self.dir.join(META_FILE_NAME), META_FORMAT_VERSION)?;
        self.meta.version = META_FORMAT_VERSION;
        Ok(())
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

    pub fn uncommitted_row_count(&self) -> u64 {
        self.pending_rows
    }
}

fn committed_row_count(columns: &[ColumnAppender]) -> Result<u64> {
    let Some(first) = columns.first() else {
        return Ok(0);
    };
    let len = fs::metadata(&first.path).map(|m| m.len()).unwrap_or(0);
    Ok(len / first.ty.value_width() as u64)
}
