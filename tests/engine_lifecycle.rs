//! # Engine Lifecycle Tests
//!
//! End-to-end coverage of engine construction over fresh and legacy data
//! directories, table-id persistence across restarts, and the lifecycle
//! operations (create, rename, remove, backup, status) through the public
//! engine surface.

use std::sync::Arc;

use tempfile::tempdir;

use chrondb::engine::{TAB_INDEX_FILE_NAME, UPGRADE_FILE_NAME};
use chrondb::table::{
    bump_meta_version, TableMeta, META_FILE_NAME, META_FORMAT_VERSION,
};
use chrondb::{
    AllowAllSecurityContext, ColumnType, Engine, EngineConfig, EngineError,
    ReadOnlySecurityContext, TableStatus, TableStructure, Value, WriterEvent,
};

const SEC: AllowAllSecurityContext = AllowAllSecurityContext;

fn trades_structure() -> TableStructure {
    TableStructure::new("trades")
        .column("ts", ColumnType::Timestamp)
        .column("price", ColumnType::Double)
        .column("sym", ColumnType::Symbol)
        .timestamp(0)
}

fn read_counter(root: &std::path::Path) -> u64 {
    let bytes = std::fs::read(root.join(TAB_INDEX_FILE_NAME)).unwrap();
    u64::from_le_bytes(bytes[0..8].try_into().unwrap())
}

fn read_marker(root: &std::path::Path) -> u32 {
    let bytes = std::fs::read(root.join(UPGRADE_FILE_NAME)).unwrap();
    u32::from_le_bytes(bytes[0..4].try_into().unwrap())
}

mod construction {
    use super::*;

    #[test]
    fn fresh_directory_bootstraps_counter_and_marker() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(EngineConfig::new(dir.path())).unwrap();

        assert!(dir.path().join(TAB_INDEX_FILE_NAME).is_file());
        assert_eq!(read_marker(dir.path()), META_FORMAT_VERSION);
        assert_eq!(read_counter(dir.path()), 0);

        assert_eq!(engine.next_table_id(), 1);
        assert_eq!(engine.next_table_id(), 2);
        assert_eq!(engine.next_table_id(), 3);
    }

    #[test]
    fn legacy_directory_is_upgraded_once() {
        let dir = tempdir().unwrap();
        for name in ["t_a", "t_b"] {
            let table_dir = dir.path().join(name);
            std::fs::create_dir(&table_dir).unwrap();
            let structure = TableStructure::new(name).column("v", ColumnType::Long);
            TableMeta::write(&table_dir.join(META_FILE_NAME), &structure, 400, 0).unwrap();
        }

        let engine = Engine::new(EngineConfig::new(dir.path())).unwrap();

        let meta_a = TableMeta::read(&dir.path().join("t_a").join(META_FILE_NAME)).unwrap();
        let meta_b = TableMeta::read(&dir.path().join("t_b").join(META_FILE_NAME)).unwrap();
        assert_eq!(meta_a.version, META_FORMAT_VERSION);
        assert_eq!(meta_b.version, META_FORMAT_VERSION);
        assert!(meta_a.table_id >= 1 && meta_a.table_id <= 2);
        assert!(meta_b.table_id >= 1 && meta_b.table_id <= 2);
        assert_ne!(meta_a.table_id, meta_b.table_id);
        assert!(read_counter(dir.path()) >= 2);
        assert_eq!(read_marker(dir.path()), META_FORMAT_VERSION);

        // Reconstruction allocates nothing further.
        let counter_before = read_counter(dir.path());
        drop(engine);
        let engine = Engine::new(EngineConfig::new(dir.path())).unwrap();
        assert_eq!(read_counter(dir.path()), counter_before);
        drop(engine);
    }

    #[test]
    fn table_ids_survive_restart() {
        let dir = tempdir().unwrap();
        let max = {
            let engine = Engine::new(EngineConfig::new(dir.path())).unwrap();
            let mut max = 0;
            for _ in 0..5 {
                max = engine.next_table_id();
            }
            engine.close();
            max
        };

        let engine = Engine::new(EngineConfig::new(dir.path())).unwrap();
        assert_eq!(engine.next_table_id(), max + 1);
    }
}

mod lifecycle {
    use super::*;

    #[test]
    fn created_table_is_read_back_under_its_id() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(EngineConfig::new(dir.path())).unwrap();

        let id = engine.create_table(&SEC, &trades_structure()).unwrap();
        {
            let mut writer = engine.get_writer(&SEC, "trades").unwrap();
            writer
                .append_row(&[
                    Value::Timestamp(1),
                    Value::Double(101.5),
                    Value::Symbol("AAPL"),
                ])
                .unwrap();
            writer
                .append_row(&[Value::Timestamp(2), Value::Double(99.0), Value::Null])
                .unwrap();
            writer.commit().unwrap();
        }

        let reader = engine.get_reader(&SEC, "trades", None).unwrap();
        assert_eq!(reader.table_id() as u64, id);
        assert_eq!(reader.row_count(), 2);
        assert_eq!(reader.symbol_at(2, 0).unwrap(), Some("AAPL"));
        assert_eq!(reader.symbol_at(2, 1).unwrap(), None);
    }

    #[test]
    fn status_reports_all_three_states() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(EngineConfig::new(dir.path())).unwrap();

        assert_eq!(engine.status(&SEC, "trades"), TableStatus::DoesNotExist);

        std::fs::create_dir(dir.path().join("reserved_name")).unwrap();
        assert_eq!(engine.status(&SEC, "reserved_name"), TableStatus::Reserved);

        engine.create_table(&SEC, &trades_structure()).unwrap();
        assert_eq!(engine.status(&SEC, "trades"), TableStatus::Exists);
    }

    #[test]
    fn rename_moves_the_directory() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(EngineConfig::new(dir.path())).unwrap();
        engine.create_table(&SEC, &trades_structure()).unwrap();

        engine.rename(&SEC, "trades", "trades_old").unwrap();

        assert_eq!(engine.status(&SEC, "trades"), TableStatus::DoesNotExist);
        assert_eq!(engine.status(&SEC, "trades_old"), TableStatus::Exists);

        let reader = engine.get_reader(&SEC, "trades_old", None).unwrap();
        assert_eq!(reader.column_count(), 3);
    }

    #[test]
    fn rename_rejects_missing_source_and_existing_target() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(EngineConfig::new(dir.path())).unwrap();
        engine.create_table(&SEC, &trades_structure()).unwrap();
        engine
            .create_table(
                &SEC,
                &TableStructure::new("quotes").column("bid", ColumnType::Double),
            )
            .unwrap();

        let err = engine.rename(&SEC, "nope", "other").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Storage { .. })
        ));

        let err = engine.rename(&SEC, "trades", "quotes").unwrap_err();
        let kind = err.downcast_ref::<EngineError>().unwrap();
        assert!(kind.to_string().contains("quotes"));
    }

    #[test]
    fn remove_deletes_the_directory() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(EngineConfig::new(dir.path())).unwrap();
        engine.create_table(&SEC, &trades_structure()).unwrap();

        engine.remove(&SEC, "trades").unwrap();

        assert_eq!(engine.status(&SEC, "trades"), TableStatus::DoesNotExist);
        assert!(!dir.path().join("trades").exists());
        // The name is free for reuse under a new id.
        let id = engine.create_table(&SEC, &trades_structure()).unwrap();
        assert!(id >= 2);
    }

    #[test]
    fn backup_writer_is_unpooled_and_targets_the_backup_root() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(EngineConfig::new(dir.path())).unwrap();
        engine.create_table(&SEC, &trades_structure()).unwrap();
        {
            let mut writer = engine.get_writer(&SEC, "trades").unwrap();
            writer
                .append_row(&[
                    Value::Timestamp(1),
                    Value::Double(5.0),
                    Value::Symbol("MSFT"),
                ])
                .unwrap();
            writer.commit().unwrap();
        }

        let backup_root = dir.path().join("backups");
        let mut backup = engine
            .get_backup_writer(&SEC, "trades", &backup_root)
            .unwrap();
        assert_eq!(engine.busy_writer_count(), 0, "backup writers are not pooled");

        backup
            .append_row(&[
                Value::Timestamp(2),
                Value::Double(6.0),
                Value::Symbol("AAPL"),
            ])
            .unwrap();
        backup.commit().unwrap();
        assert_eq!(backup.row_count(), 2);
        drop(backup);

        // The live table did not grow.
        let reader = engine.get_reader(&SEC, "trades", None).unwrap();
        assert_eq!(reader.row_count(), 1);
        assert!(backup_root.join("trades").join(META_FILE_NAME).is_file());
    }

    #[test]
    fn commits_are_announced_on_the_message_bus() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(EngineConfig::new(dir.path())).unwrap();
        engine.create_table(&SEC, &trades_structure()).unwrap();

        let mut writer = engine.get_writer(&SEC, "trades").unwrap();
        writer
            .append_row(&[
                Value::Timestamp(1),
                Value::Double(1.0),
                Value::Symbol("AAPL"),
            ])
            .unwrap();
        writer.commit().unwrap();

        let event = engine.message_bus().events().try_recv().unwrap();
        assert_eq!(
            event,
            WriterEvent::Committed {
                table: "trades".into(),
                rows: 1
            }
        );
    }
}

mod security {
    use super::*;

    #[test]
    fn read_only_context_blocks_mutations() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(EngineConfig::new(dir.path())).unwrap();
        engine.create_table(&SEC, &trades_structure()).unwrap();

        let ro = ReadOnlySecurityContext;
        let is_violation = |err: eyre::Report| {
            matches!(
                err.downcast_ref::<EngineError>(),
                Some(EngineError::SecurityViolation)
            )
        };

        assert!(is_violation(
            engine.create_table(&ro, &trades_structure()).unwrap_err()
        ));
        assert!(is_violation(engine.get_writer(&ro, "trades").unwrap_err()));
        assert!(is_violation(
            engine
                .get_backup_writer(&ro, "trades", &dir.path().join("b"))
                .unwrap_err()
        ));
        assert!(is_violation(engine.lock(&ro, "trades").unwrap_err()));
        assert!(is_violation(engine.remove(&ro, "trades").unwrap_err()));
        assert!(is_violation(
            engine.rename(&ro, "trades", "t2").unwrap_err()
        ));

        // Reads stay open.
        assert!(engine.get_reader(&ro, "trades", None).is_ok());
        assert_eq!(engine.status(&ro, "trades"), TableStatus::Exists);
    }
}

mod migration {
    use super::*;

    #[test]
    fn null_flag_migration_backfills_symbol_columns() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(EngineConfig::new(dir.path())).unwrap();
        engine.create_table(&SEC, &trades_structure()).unwrap();
        {
            let mut writer = engine.get_writer(&SEC, "trades").unwrap();
            writer
                .append_row(&[Value::Timestamp(1), Value::Double(1.0), Value::Null])
                .unwrap();
            writer.commit().unwrap();
        }
        // Age the metadata below the null-flag revision, as a table written
        // by an older build would be.
        bump_meta_version(&dir.path().join("trades").join(META_FILE_NAME), 410).unwrap();
        engine.release_all_writers();
        engine.release_all_readers();

        assert!(engine.migrate_null_flag(&SEC, "trades").unwrap());

        // Evict the pre-migration snapshots before re-reading.
        engine.release_all_readers();
        engine.release_all_writers();

        let reader = engine.get_reader(&SEC, "trades", None).unwrap();
        assert_eq!(reader.version(), META_FORMAT_VERSION);
        assert!(reader.symbol_null_flag(2).unwrap());
        drop(reader);

        // Second run is a no-op.
        assert!(!engine.migrate_null_flag(&SEC, "trades").unwrap());
    }
}

mod listeners {
    use super::*;
    use chrondb::{PoolEvent, PoolEventKind, PoolKind};
    use parking_lot::Mutex;

    #[test]
    fn listener_covers_both_pools() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(EngineConfig::new(dir.path())).unwrap();
        engine.create_table(&SEC, &trades_structure()).unwrap();

        let seen: Arc<Mutex<Vec<(PoolKind, PoolEventKind)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.set_pool_listener(Some(Arc::new(move |event: &PoolEvent<'_>| {
            sink.lock().push((event.pool, event.kind));
        })));
        assert!(engine.pool_listener().is_some());

        drop(engine.get_writer(&SEC, "trades").unwrap());
        drop(engine.get_reader(&SEC, "trades", None).unwrap());

        let events = seen.lock().clone();
        assert!(events.contains(&(PoolKind::Writer, PoolEventKind::Acquired)));
        assert!(events.contains(&(PoolKind::Writer, PoolEventKind::Returned)));
        assert!(events.contains(&(PoolKind::Reader, PoolEventKind::Acquired)));
        assert!(events.contains(&(PoolKind::Reader, PoolEventKind::Returned)));
    }
}
