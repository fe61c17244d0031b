//! # ChronDB Table Engine Coordinator
//!
//! ChronDB stores time-series data in columnar per-table directories. This
//! crate is the coordinator that sits in front of that layout: every table
//! lifecycle operation (create, open-for-read, open-for-write, rename,
//! drop, backup) goes through the [`Engine`], which enforces the
//! single-writer / many-readers discipline the on-disk format requires.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                Engine (engine)               │
//! │  create / get / lock / rename / remove / ... │
//! ├──────────────────────┬───────────────────────┤
//! │  WriterPool          │  ReaderPool           │
//! │  (pool, lease/lock)  │  (pool, lease/lock)   │
//! ├──────────────────────┴───────────────────────┤
//! │  TableWriter / TableReader (table)           │
//! ├──────────────────────────────────────────────┤
//! │  _tab_index.d mmap counter │ _upgrade.d scan │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Data Directory
//!
//! ```text
//! <root>/
//! ├── _tab_index.d      # persistent monotonic table-id counter (mmap)
//! ├── _upgrade.d        # format version reached by the boot upgrade
//! └── <table>/
//!     ├── _meta         # column layout, format version, table id
//!     ├── <col>.d       # fixed-width column values
//!     └── <col>.sym     # symbol dictionary sidecar
//! ```
//!
//! ## Concurrency Model
//!
//! - Table-id allocation is lock-free: an atomic increment on the mapped
//!   counter word.
//! - Pool leases never block on contention; a busy entry fails the call
//!   and the caller queues at a higher layer.
//! - Destructive operations take the composite engine lock, writer pool
//!   first, with observable rollback on partial failure.
//!
//! ## Module Overview
//!
//! - [`engine`]: the coordinator, id allocator, boot upgrade, maintenance
//! - [`pool`]: generic lease/lock resource pool with listener hooks
//! - [`table`]: minimal columnar writer/reader pair and `_meta` handling
//! - [`bus`]: message bus and telemetry ring
//! - [`security`], [`clock`], [`config`], [`error`]: ambient plumbing

pub mod bus;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod security;
pub mod table;

pub use bus::{MessageBus, TableOp, TelemetryEvent, WriterEvent};
pub use clock::{ManualClock, MicrosecondClock, OsClock};
pub use config::EngineConfig;
pub use engine::{Engine, MaintenanceJob, PooledReader, PooledWriter, TableIdAllocator};
pub use error::EngineError;
pub use pool::{Pool, PoolEvent, PoolEventKind, PoolKind, PoolListener, PooledHandle};
pub use security::{AllowAllSecurityContext, ReadOnlySecurityContext, SecurityContext};
pub use table::{
    ColumnDef, ColumnType, TableReader, TableStatus, TableStructure, TableWriter, Value,
};
