//! Table directory utilities: path construction, creation, existence checks.
//!
//! `create_table` is not safe against a simultaneous writer lease on the
//! same name; the engine takes the composite lock (or calls it before any
//! handle exists) as the lifecycle operations do.

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use tracing::debug;

use super::meta::{TableMeta, TableStructure, META_FILE_NAME, META_FORMAT_VERSION};
use super::symbol::{self, SYMBOL_FILE_SUFFIX};
use super::ColumnType;

/// Result of a table existence probe. No pool entry is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    DoesNotExist,
    Exists,
    /// The directory exists but carries no metadata; the name is taken but
    /// not usable as a table.
    Reserved,
}

pub fn table_path(root: &Path, name: &str) -> PathBuf {
    root.join(name)
}

pub fn meta_path(root: &Path, name: &str) -> PathBuf {
    root.join(name).join(META_FILE_NAME)
}

pub fn column_data_path(table_dir: &Path, column: &str) -> PathBuf {
    table_dir.join(format!("{}.d", column))
}

pub fn symbol_map_path(table_dir: &Path, column: &str) -> PathBuf {
    table_dir.join(format!("{}.{}", column, SYMBOL_FILE_SUFFIX))
}

/// Creates the table directory, its `_meta`, empty column files, and symbol
/// sidecars.
pub fn create_table(
    root: &Path,
    mk_dir_mode: u32,
    structure: &TableStructure,
    table_id: u32,
) -> Result<()> {
    ensure!(
        !structure.columns.is_empty(),
        "table '{}' must have at least one column",
        structure.name
    );
    let dir = table_path(root, &structure.name);
    ensure!(
        !dir.exists(),
        "table '{}' already exists",
        structure.name
    );

    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mk_dir_mode);
    }
    #[cfg(not(unix))]
    let _ = mk_dir_mode;
    builder
        .create(&dir)
        .wrap_err_with(|| format!("failed to create table directory '{}'", dir.display()))?;

    TableMeta::write(
        &dir.join(META_FILE_NAME),
        structure,
        META_FORMAT_VERSION,
        table_id,
    )?;

    for column in &structure.columns {
        let data = column_data_path(&dir, &column.name);
        fs::File::create(&data)
            .wrap_err_with(|| format!("failed to create column file '{}'", data.display()))?;
        if column.ty == ColumnType::Symbol {
            symbol::write_symbols(&symbol_map_path(&dir, &column.name), &[], false)?;
        }
    }

    debug!(table = %structure.name, table_id, "created table");
    Ok(())
}

pub fn table_status(root: &Path, name: &str) -> TableStatus {
    let dir = table_path(root, name);
    if !dir.is_dir() {
        return TableStatus::DoesNotExist;
    }
    if dir.join(META_FILE_NAME).is_file() {
        TableStatus::Exists
    } else {
        TableStatus::Reserved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn structure() -> TableStructure {
        TableStructure::new("trades")
            .column("ts", ColumnType::Timestamp)
            .column("sym", ColumnType::Symbol)
            .timestamp(0)
    }

    #[test]
    fn create_table_lays_out_directory() {
        let dir = tempdir().unwrap();
        create_table(dir.path(), 0o755, &structure(), 1).unwrap();

        let table_dir = dir.path().join("trades");
        assert!(table_dir.join(META_FILE_NAME).is_file());
        assert!(table_dir.join("ts.d").is_file());
        assert!(table_dir.join("sym.d").is_file());
        assert!(table_dir.join("sym.sym").is_file());

        let meta = TableMeta::read(&table_dir.join(META_FILE_NAME)).unwrap();
        assert_eq!(meta.table_id, 1);
        assert_eq!(meta.version, META_FORMAT_VERSION);
    }

    #[test]
    fn create_table_rejects_existing_directory() {
        let dir = tempdir().unwrap();
        create_table(dir.path(), 0o755, &structure(), 1).unwrap();
        assert!(create_table(dir.path(), 0o755, &structure(), 2).is_err());
    }

    #[test]
    fn status_distinguishes_reserved_from_exists() {
        let dir = tempdir().unwrap();
        assert_eq!(table_status(dir.path(), "trades"), TableStatus::DoesNotExist);

        fs::create_dir(dir.path().join("trades")).unwrap();
        assert_eq!(table_status(dir.path(), "trades"), TableStatus::Reserved);

        fs::remove_dir(dir.path().join("trades")).unwrap();
        create_table(dir.path(), 0o755, &structure(), 1).unwrap();
        assert_eq!(table_status(dir.path(), "trades"), TableStatus::Exists);
    }
}
