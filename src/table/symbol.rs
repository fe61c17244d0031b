//! Symbol dictionary sidecar (`<col>.sym`).
//!
//! Symbol columns store i32 dictionary keys in their data file;
//! [`SYMBOL_NULL_KEY`] encodes null. The sidecar holds the dictionary and a
//! has-null flag:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     Entry count (LE u32)
//! 4       1     Has-null flag (0 or 1)
//! 5       3     Reserved
//! 8       ...   Per entry: LE u32 length, UTF-8 bytes
//! ```

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};

pub const SYMBOL_FILE_SUFFIX: &str = "sym";
pub const SYMBOL_NULL_KEY: i32 = -1;

const SYMBOL_HEADER_SIZE: usize = 8;
const NULL_FLAG_OFFSET: u64 = 4;

pub(crate) fn write_symbols(path: &Path, entries: &[String], has_null: bool) -> Result<()> {
    let mut bytes = Vec::with_capacity(SYMBOL_HEADER_SIZE + entries.len() * 16);
    bytes.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    bytes.push(has_null as u8);
    bytes.extend_from_slice(&[0u8; 3]);
    for entry in entries {
        bytes.extend_from_slice(&(entry.len() as u32).to_le_bytes());
        bytes.extend_from_slice(entry.as_bytes());
    }
    std::fs::write(path, bytes)
        .wrap_err_with(|| format!("failed to write symbol file '{}'", path.display()))
}

pub(crate) fn read_symbols(path: &Path) -> Result<(Vec<String>, bool)> {
    let mut bytes = Vec::new();
    File::open(path)
        .wrap_err_with(|| format!("failed to open symbol file '{}'", path.display()))?
        .read_to_end(&mut bytes)
        .wrap_err_with(|| format!("failed to read symbol file '{}'", path.display()))?;

    ensure!(
        bytes.len() >= SYMBOL_HEADER_SIZE,
        "symbol file '{}' too short: {} bytes",
        path.display(),
        bytes.len()
    );
    let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let has_null = bytes[4] != 0;

    let mut entries = Vec::with_capacity(count);
    let mut cursor = SYMBOL_HEADER_SIZE;
    for i in 0..count {
        ensure!(
            bytes.len() >= cursor + 4,
            "symbol file '{}' truncated at entry {}",
            path.display(),
            i
        );
        let len = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;
        ensure!(
            bytes.len() >= cursor + len,
            "symbol file '{}' truncated in entry {}",
            path.display(),
            i
        );
        let value = std::str::from_utf8(&bytes[cursor..cursor + len])
            .wrap_err_with(|| format!("symbol entry {} is not UTF-8", i))?
            .to_string();
        cursor += len;
        entries.push(value);
    }
    Ok((entries, has_null))
}

/// Rewrites just the has-null flag byte, leaving the dictionary untouched.
pub(crate) fn update_null_flag(path: &Path, has_null: bool) -> Result<()> {
    let mut file = File::options()
        .read(true)
        .write(true)
        .open(path)
        .wrap_err_with(|| format!("failed to open symbol file '{}'", path.display()))?;
    file.seek(SeekFrom::Start(NULL_FLAG_OFFSET))
        .wrap_err("failed to seek to null flag")?;
    file.write_all(&[has_null as u8])
        .wrap_err_with(|| format!("failed to update null flag in '{}'", path.display()))?;
    Ok(())
}
