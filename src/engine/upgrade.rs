//! # Boot-Time Table-Id Upgrade
//!
//! Data directories written before table ids existed carry `_meta` files
//! with an older format version and no id. On construction the engine runs
//! this one-shot migration: every table directory still below
//! `VERSION_THAT_ADDED_TABLE_ID` gets a freshly allocated id and the
//! current format version written in place, after which the reached version
//! is recorded in the `_upgrade.d` marker so subsequent boots skip the
//! scan entirely.
//!
//! The procedure is idempotent and crash-safe: a re-run only touches tables
//! still below the threshold, and the allocator's monotonicity keeps
//! re-assigned ids distinct.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use eyre::Result;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::table::{META_FILE_NAME, META_FORMAT_VERSION, META_OFFSET_VERSION, VERSION_THAT_ADDED_TABLE_ID};

use super::table_id::TableIdAllocator;

pub const UPGRADE_FILE_NAME: &str = "_upgrade.d";

/// Runs the migration over `root`. Called once from the engine constructor,
/// after the id allocator is mapped.
pub fn upgrade_table_ids(root: &Path, allocator: &TableIdAllocator) -> Result<()> {
    let marker_path = root.join(UPGRADE_FILE_NAME);
    let existed = marker_path.exists();

    let mut marker = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&marker_path)
        .map_err(|e| EngineError::storage_io(&e, "could not open", &marker_path))?;
    debug!(path = %marker_path.display(), "opened upgrade marker");

    if existed {
        let mut word = [0u8; 4];
        marker
            .read_exact(&mut word)
            .map_err(|e| EngineError::storage_io(&e, "could not read", &marker_path))?;
        if u32::from_le_bytes(word) >= VERSION_THAT_ADDED_TABLE_ID {
            info!("table ids are up to date");
            return Ok(());
        }
    }

    info!(root = %root.display(), "upgrading table ids");
    let entries = std::fs::read_dir(root)
        .map_err(|e| EngineError::storage_io(&e, "could not iterate", root))?;
    for entry in entries {
        let entry = entry.map_err(|e| EngineError::storage_io(&e, "could not iterate", root))?;
        let is_dir = entry
            .file_type()
            .map_err(|e| EngineError::storage_io(&e, "could not stat", &entry.path()))?
            .is_dir();
        if !is_dir {
            continue;
        }
        let meta_path = entry.path().join(META_FILE_NAME);
        if meta_path.is_file() {
            assign_table_id(&meta_path, allocator)?;
        }
    }
    info!("upgraded table ids");

    marker
        .seek(SeekFrom::Start(0))
        .map_err(|e| EngineError::storage_io(&e, "could not seek", &marker_path))?;
    marker
        .write_all(&META_FORMAT_VERSION.to_le_bytes())
        .map_err(|e| EngineError::storage_io(&e, "could not write to", &marker_path))?;
    Ok(())
}

/// Reads the adjacent (version, id) words of one `_meta` file and, when the
/// version predates table ids, overwrites them with the current version and
/// a fresh id.
fn assign_table_id(meta_path: &Path, allocator: &TableIdAllocator) -> Result<()> {
    let mut file = File::options()
        .read(true)
        .write(true)
        .open(meta_path)
        .map_err(|e| EngineError::storage_io(&e, "could not open", meta_path))?;

    let mut words = [0u8; 8];
    file.seek(SeekFrom::Start(META_OFFSET_VERSION))
        .map_err(|e| EngineError::storage_io(&e, "could not seek", meta_path))?;
    file.read_exact(&mut words)
        .map_err(|e| EngineError::storage_io(&e, "could not update table id in", meta_path))?;

    let version = u32::from_le_bytes(words[0..4].try_into().unwrap());
    if version >= VERSION_THAT_ADDED_TABLE_ID {
        return Ok(());
    }

    info!(path = %meta_path.display(), "assigning table id");
    let id = allocator.next_id() as u32;
    words[0..4].copy_from_slice(&META_FORMAT_VERSION.to_le_bytes());
    words[4..8].copy_from_slice(&id.to_le_bytes());
    file.seek(SeekFrom::Start(META_OFFSET_VERSION))
        .map_err(|e| EngineError::storage_io(&e, "could not seek", meta_path))?;
    file.write_all(&words)
        .map_err(|e| EngineError::storage_io(&e, "could not update table id in", meta_path))?;
    Ok(())
}
