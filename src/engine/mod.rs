//! # Engine Coordinator
//!
//! The process-wide entry point for table lifecycle operations. The engine
//! owns the writer and reader pools, the persistent table-id allocator, the
//! message bus, and the telemetry ring; it mediates every create, lease,
//! rename, drop, and backup, and enforces the single-writer / many-readers
//! discipline the on-disk format requires.
//!
//! Destructive operations (remove, rename) take the *engine lock* on a
//! name: the writer pool is locked first, then the reader pool, and a
//! reader-pool failure rolls the writer-pool lock back immediately, so a
//! failed composite lock leaves no trace.
//!
//! Construction opens and maps the id counter and then runs the one-shot
//! table-id upgrade over the data root; if the upgrade fails, the partially
//! constructed engine is closed before the error propagates.

mod maintenance;
mod table_id;
mod upgrade;

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use eyre::Result;
use tracing::{error, info};

use crate::bus::{MessageBus, TableOp, TelemetryEvent, TelemetryRing};
use crate::clock::{MicrosecondClock, OsClock};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pool::{Pool, PoolKind, PoolListener, PooledHandle};
use crate::security::SecurityContext;
use crate::table::{
    self, table_path, table_status, ColumnType, TableReader, TableStatus, TableStructure,
    TableWriter, VERSION_THAT_ADDED_SYMBOL_NULL_FLAG,
};

pub use maintenance::MaintenanceJob;
pub use table_id::{TableIdAllocator, TAB_INDEX_FILE_NAME};
pub use upgrade::{upgrade_table_ids, UPGRADE_FILE_NAME};

pub type PooledWriter = PooledHandle<TableWriter>;
pub type PooledReader = PooledHandle<TableReader>;

pub(crate) struct EngineInner {
    config: EngineConfig,
    bus: Arc<MessageBus>,
    telemetry: TelemetryRing,
    writer_pool: Pool<TableWriter>,
    reader_pool: Pool<TableReader>,
    allocator: TableIdAllocator,
    closed: AtomicBool,
}

impl EngineInner {
    fn lock_name(&self, name: &str) -> bool {
        // Writer pool first; on reader-pool failure the writer lock is
        // rolled back so a failed composite lock is unobservable.
        if self.writer_pool.lock(name) {
            if self.reader_pool.lock(name) {
                info!(table = name, thread = ?thread::current().id(), "locked table");
                return true;
            }
            self.writer_pool.unlock(name, None);
        }
        false
    }

    fn unlock_name(&self, name: &str, writer: Option<TableWriter>) {
        self.reader_pool.unlock(name, None);
        self.writer_pool.unlock(name, writer);
        info!(table = name, "unlocked table");
    }

    pub(crate) fn release_inactive(&self) -> bool {
        let mut useful = self
            .writer_pool
            .release_inactive(self.config.inactive_writer_ttl_ms.saturating_mul(1000));
        useful |= self
            .reader_pool
            .release_inactive(self.config.inactive_reader_ttl_ms.saturating_mul(1000));
        useful
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.writer_pool.close();
        self.reader_pool.close();
        // The index mapping and its descriptor are released when the inner
        // value drops, mapping first.
    }
}

pub struct Engine {
    inner: Arc<EngineInner>,
    maintenance: Arc<MaintenanceJob>,
}

impl Engine {
    /// Constructs an engine over `config.root` using the OS clock.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(OsClock))
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn MicrosecondClock>) -> Result<Self> {
        fs::create_dir_all(&config.root)
            .map_err(|e| EngineError::storage_io(&e, "could not create data root", &config.root))?;

        let bus = Arc::new(MessageBus::new());
        let telemetry = TelemetryRing::new(config.telemetry_queue_capacity);

        let writer_root = config.root.clone();
        let writer_bus = Arc::clone(&bus);
        let writer_pool = Pool::new(PoolKind::Writer, Arc::clone(&clock), move |name| {
            TableWriter::open(&writer_root, name, Arc::clone(&writer_bus))
        });

        let reader_root = config.root.clone();
        let reader_pool = Pool::new(PoolKind::Reader, Arc::clone(&clock), move |name| {
            TableReader::open(&reader_root, name)
        });

        let allocator = TableIdAllocator::open(&config.root)?;

        let idle_check_interval_ms = config.idle_check_interval_ms;
        let root = config.root.clone();
        let inner = Arc::new(EngineInner {
            config,
            bus,
            telemetry,
            writer_pool,
            reader_pool,
            allocator,
            closed: AtomicBool::new(false),
        });

        if let Err(err) = upgrade_table_ids(&root, &inner.allocator) {
            inner.close();
            return Err(err);
        }

        let maintenance = Arc::new(MaintenanceJob::new(
            Arc::downgrade(&inner),
            clock,
            idle_check_interval_ms,
        ));

        Ok(Self { inner, maintenance })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn message_bus(&self) -> &Arc<MessageBus> {
        &self.inner.bus
    }

    pub fn telemetry_sender(&self) -> flume::Sender<TelemetryEvent> {
        self.inner.telemetry.sender()
    }

    pub fn telemetry_events(&self) -> &flume::Receiver<TelemetryEvent> {
        self.inner.telemetry.receiver()
    }

    pub fn maintenance_job(&self) -> Arc<MaintenanceJob> {
        Arc::clone(&self.maintenance)
    }

    /// Allocates and returns a fresh table id.
    pub fn next_table_id(&self) -> u64 {
        self.inner.allocator.next_id()
    }

    /// Rewinds the table-id counter. Not safe under concurrent allocation;
    /// test builds only.
    #[cfg(any(test, feature = "testing"))]
    pub fn reset_table_id(&self) {
        self.inner.allocator.reset_for_tests();
    }

    /// Creates the table on disk under a freshly allocated id and returns
    /// that id. Not safe against a concurrent `get_writer` for the same
    /// name; callers hold the engine lock or create before any handle
    /// exists.
    pub fn create_table(
        &self,
        sec: &dyn SecurityContext,
        structure: &TableStructure,
    ) -> Result<u64> {
        sec.check_write_permission()?;
        let id = self.inner.allocator.next_id();
        table::create_table(
            &self.inner.config.root,
            self.inner.config.mk_dir_mode,
            structure,
            id as u32,
        )?;
        self.inner.telemetry.publish(TelemetryEvent {
            op: TableOp::Created,
            table: structure.name.clone(),
        });
        Ok(id)
    }

    /// Leases a reader. With `version` supplied, a mismatching reader is
    /// returned to the pool and the call fails with `ReaderOutOfDate`.
    pub fn get_reader(
        &self,
        _sec: &dyn SecurityContext,
        name: &str,
        version: Option<u32>,
    ) -> Result<PooledReader> {
        let reader = self.inner.reader_pool.get(name)?;
        if let Some(requested) = version {
            let actual = reader.version();
            if actual != requested {
                drop(reader);
                return Err(EngineError::ReaderOutOfDate {
                    table: name.to_string(),
                    requested,
                    actual,
                }
                .into());
            }
        }
        Ok(reader)
    }

    pub fn get_writer(&self, sec: &dyn SecurityContext, name: &str) -> Result<PooledWriter> {
        sec.check_write_permission()?;
        self.inner.writer_pool.get(name)
    }

    /// Constructs a fresh, unpooled writer over a copy of the table in
    /// `backup_root`. Backups are one-shot, so caching the writer would
    /// only retain resources past their usefulness.
    pub fn get_backup_writer(
        &self,
        sec: &dyn SecurityContext,
        name: &str,
        backup_root: &std::path::Path,
    ) -> Result<TableWriter> {
        sec.check_write_permission()?;
        TableWriter::open_backup(
            &self.inner.config.root,
            backup_root,
            name,
            self.inner.config.mk_dir_mode,
        )
    }

    /// Takes the composite engine lock on `name`: writer pool, then reader
    /// pool, rolling back on partial failure.
    pub fn lock(&self, sec: &dyn SecurityContext, name: &str) -> Result<bool> {
        sec.check_write_permission()?;
        Ok(self.inner.lock_name(name))
    }

    /// Releases the composite lock, optionally donating a writer back into
    /// the writer-pool entry.
    pub fn unlock(&self, _sec: &dyn SecurityContext, name: &str, writer: Option<TableWriter>) {
        self.inner.unlock_name(name, writer);
    }

    pub fn lock_writer(&self, name: &str) -> bool {
        self.inner.writer_pool.lock(name)
    }

    pub fn lock_readers(&self, name: &str) -> bool {
        self.inner.reader_pool.lock(name)
    }

    pub fn unlock_writer(&self, name: &str) {
        self.inner.writer_pool.unlock(name, None);
    }

    pub fn unlock_readers(&self, name: &str) {
        self.inner.reader_pool.unlock(name, None);
    }

    /// Removes the table directory under the engine lock.
    pub fn remove(&self, sec: &dyn SecurityContext, name: &str) -> Result<()> {
        sec.check_write_permission()?;
        if self.inner.lock_name(name) {
            let path = table_path(&self.inner.config.root, name);
            let result = fs::remove_dir_all(&path)
                .map_err(|e| EngineError::storage_io(&e, "could not remove table", &path));
            self.inner.unlock_name(name, None);
            return match result {
                Ok(()) => {
                    self.inner.telemetry.publish(TelemetryEvent {
                        op: TableOp::Removed,
                        table: name.to_string(),
                    });
                    Ok(())
                }
                Err(err) => {
                    error!(table = name, %err, "remove failed");
                    Err(err.into())
                }
            };
        }
        Err(EngineError::storage(0, format!("could not lock table '{}'", name)).into())
    }

    /// Renames the table directory under the engine lock.
    pub fn rename(
        &self,
        sec: &dyn SecurityContext,
        name: &str,
        new_name: &str,
    ) -> Result<()> {
        sec.check_write_permission()?;
        if self.inner.lock_name(name) {
            let result = self.rename_dir(name, new_name);
            self.inner.unlock_name(name, None);
            return match result {
                Ok(()) => {
                    self.inner.telemetry.publish(TelemetryEvent {
                        op: TableOp::Renamed,
                        table: name.to_string(),
                    });
                    Ok(())
                }
                Err(err) => Err(err),
            };
        }
        error!(from = name, to = new_name, "cannot lock table for rename");
        Err(EngineError::EntryUnavailable {
            pool: PoolKind::Writer,
            table: name.to_string(),
        }
        .into())
    }

    fn rename_dir(&self, name: &str, new_name: &str) -> Result<()> {
        let root = &self.inner.config.root;
        if table_status(root, name) != TableStatus::Exists {
            error!(table = name, "rename failed, table does not exist");
            return Err(EngineError::storage(
                0,
                format!("rename failed, table '{}' does not exist", name),
            )
            .into());
        }
        let from = table_path(root, name);
        let to = table_path(root, new_name);
        if to.exists() {
            error!(from = name, to = new_name, "rename target exists");
            return Err(EngineError::storage(
                0,
                format!("rename target '{}' exists", new_name),
            )
            .into());
        }
        fs::rename(&from, &to)
            .map_err(|e| EngineError::storage_io(&e, "rename failed", &from))?;
        Ok(())
    }

    /// Probes the filesystem for `name` without touching any pool entry.
    pub fn status(&self, _sec: &dyn SecurityContext, name: &str) -> TableStatus {
        table_status(&self.inner.config.root, name)
    }

    /// Backfills the persisted has-null flag of every symbol column from
    /// the committed data, then stamps the current metadata version. Holds
    /// a writer and a reader lease for the duration. Returns true iff the
    /// migration ran.
    pub fn migrate_null_flag(&self, sec: &dyn SecurityContext, name: &str) -> Result<bool> {
        let mut writer = self.get_writer(sec, name)?;
        let reader = self.get_reader(sec, name, None)?;
        if reader.version() >= VERSION_THAT_ADDED_SYMBOL_NULL_FLAG {
            return Ok(false);
        }

        info!(table = name, "migrating null flag for symbol columns");
        for i in 0..reader.column_count() {
            if reader.column_type(i) == ColumnType::Symbol {
                let has_null = reader.has_null(i)?;
                info!(column = reader.column_name(i), has_null, "updating null flag");
                writer.symbol_map_writer(i)?.update_null_flag(has_null)?;
            }
        }
        writer.update_metadata_version()?;
        info!(table = name, "migrated null flag for symbol columns");
        Ok(true)
    }

    /// Sweeps idle entries past their TTL out of both pools.
    pub fn release_inactive(&self) -> bool {
        self.inner.release_inactive()
    }

    pub fn release_all_readers(&self) -> bool {
        self.inner.reader_pool.release_all()
    }

    pub fn release_all_writers(&self) -> bool {
        self.inner.writer_pool.release_all()
    }

    pub fn busy_reader_count(&self) -> usize {
        self.inner.reader_pool.busy_count()
    }

    pub fn busy_writer_count(&self) -> usize {
        self.inner.writer_pool.busy_count()
    }

    /// Installs (or clears) the listener on both pools.
    pub fn set_pool_listener(&self, listener: Option<Arc<dyn PoolListener>>) {
        self.inner.writer_pool.set_listener(listener.clone());
        self.inner.reader_pool.set_listener(listener);
    }

    pub fn pool_listener(&self) -> Option<Arc<dyn PoolListener>> {
        self.inner.writer_pool.listener()
    }

    /// Releases both pools and unmaps the id counter. Dropping the engine
    /// does the same; `close` just makes the point explicit.
    pub fn close(self) {
        self.inner.close();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::security::AllowAllSecurityContext;
    use crate::table::Value;
    use tempfile::tempdir;

    const SEC: AllowAllSecurityContext = AllowAllSecurityContext;

    fn trades() -> TableStructure {
        TableStructure::new("trades")
            .column("ts", ColumnType::Timestamp)
            .column("price", ColumnType::Double)
            .column("sym", ColumnType::Symbol)
            .timestamp(0)
    }

    #[test]
    fn create_then_read_round_trip() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(EngineConfig::new(dir.path())).unwrap();

        let id = engine.create_table(&SEC, &trades()).unwrap();
        assert_eq!(engine.status(&SEC, "trades"), TableStatus::Exists);

        {
            let mut writer = engine.get_writer(&SEC, "trades").unwrap();
            writer
                .append_row(&[
                    Value::Timestamp(1),
                    Value::Double(10.0),
                    Value::Symbol("AAPL"),
                ])
                .unwrap();
            writer.commit().unwrap();
        }

        let reader = engine.get_reader(&SEC, "trades", None).unwrap();
        assert_eq!(reader.table_id() as u64, id);
        assert_eq!(reader.row_count(), 1);
    }

    #[test]
    fn maintenance_job_is_time_gated() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let clock_dyn: Arc<dyn MicrosecondClock> = clock.clone();
        let mut config = EngineConfig::new(dir.path());
        config.idle_check_interval_ms = 10;
        config.inactive_reader_ttl_ms = 1;
        config.inactive_writer_ttl_ms = 1;
        let engine = Engine::with_clock(config, Arc::clone(&clock_dyn)).unwrap();
        engine.create_table(&SEC, &trades()).unwrap();

        // Park an idle reader in the pool.
        drop(engine.get_reader(&SEC, "trades", None).unwrap());

        let job = engine.maintenance_job();
        assert!(!job.run(), "gate not reached yet");

        clock.advance(20_000);
        assert!(job.run(), "tick past the gate evicts the idle reader");
        assert!(!job.run(), "gate re-armed");
    }

    #[test]
    fn maintenance_job_outlives_engine_harmlessly() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let clock_dyn: Arc<dyn MicrosecondClock> = clock.clone();
        let engine =
            Engine::with_clock(EngineConfig::new(dir.path()), Arc::clone(&clock_dyn)).unwrap();
        let job = engine.maintenance_job();
        drop(engine);

        clock.advance(u64::from(u32::MAX));
        assert!(!job.run());
    }

    #[test]
    fn telemetry_sees_lifecycle_operations() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(EngineConfig::new(dir.path())).unwrap();

        engine.create_table(&SEC, &trades()).unwrap();
        engine.rename(&SEC, "trades", "trades2").unwrap();
        engine.remove(&SEC, "trades2").unwrap();

        let ops: Vec<TableOp> = engine
            .telemetry_events()
            .try_iter()
            .map(|event| event.op)
            .collect();
        assert_eq!(ops, vec![TableOp::Created, TableOp::Renamed, TableOp::Removed]);
    }
}
