//! # Lease-Based Resource Pools
//!
//! The engine keeps one pool of table writers and one of table readers.
//! Both are instances of the generic [`Pool`]: a bounded-by-usage cache of
//! per-table resources keyed by table name, handing out exclusive leases
//! and never blocking on contention.
//!
//! ## Entry State Machine
//!
//! ```text
//! absent ──get──▶ busy ◀──get─── idle ──evict──▶ absent
//!                  │                ▲
//!                  └────return──────┘
//! absent/idle ──lock──▶ locked ──unlock+donation──▶ idle
//!                       locked ──unlock──────────▶ absent
//! ```
//!
//! A busy entry has exactly one leaseholder; a locked entry holds no
//! resource and refuses leases. The check "is this entry idle or absent?"
//! and the transition out of it are a single step under the registry lock,
//! so `get` and `lock` always observe each other's effects atomically.
//!
//! ## Lease Return
//!
//! Leases are RAII guards carrying a weak reference back to the pool
//! internals. Dropping the guard returns the resource and stamps the
//! last-used time; after pool shutdown the weak reference is dead and the
//! drop quietly releases the resource instead. `get` never blocks on a busy
//! entry: callers queue at a higher layer.

mod listener;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::clock::MicrosecondClock;
use crate::error::EngineError;

pub use listener::{PoolEvent, PoolEventKind, PoolListener};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Writer,
    Reader,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Writer => f.write_str("writer pool"),
            PoolKind::Reader => f.write_str("reader pool"),
        }
    }
}

enum Entry<R> {
    Idle { resource: R, last_used: u64 },
    Busy { owner: ThreadId },
    Locked { owner: ThreadId },
}

impl<R> Entry<R> {
    fn is_idle(&self) -> bool {
        matches!(self, Entry::Idle { .. })
    }
}

type Factory<R> = Box<dyn Fn(&str) -> Result<R> + Send + Sync>;

struct PoolInner<R: Send + 'static> {
    kind: PoolKind,
    factory: Factory<R>,
    clock: Arc<dyn MicrosecondClock>,
    entries: Mutex<HashMap<String, Entry<R>>>,
    listener: RwLock<Option<Arc<dyn PoolListener>>>,
    busy: AtomicUsize,
    closed: AtomicBool,
}

impl<R: Send + 'static> PoolInner<R> {
    fn notify(&self, kind: PoolEventKind, table: &str) {
        if let Some(listener) = self.listener.read().as_ref() {
            listener.on_event(&PoolEvent {
                kind,
                pool: self.kind,
                table,
                thread: thread::current().id(),
            });
        }
    }

    fn return_resource(&self, name: &str, resource: R) {
        if self.closed.load(Ordering::Acquire) {
            // Late return after shutdown: the entry registry is gone, just
            // release the resource.
            drop(resource);
            self.notify(PoolEventKind::Closed, name);
            return;
        }
        let mut entries = self.entries.lock();
        match entries.get_mut(name) {
            Some(slot @ Entry::Busy { .. }) => {
                *slot = Entry::Idle {
                    resource,
                    last_used: self.clock.now_micros(),
                };
                self.busy.fetch_sub(1, Ordering::AcqRel);
                self.notify(PoolEventKind::Returned, name);
            }
            _ => {
                // The entry was discarded while the lease was out (pool
                // close races the return). Nothing to reinstall.
                drop(resource);
                self.notify(PoolEventKind::Closed, name);
            }
        }
    }
}

/// Exclusive lease on a pooled resource. Dropping it returns the resource
/// to its pool; after pool shutdown the drop releases the resource instead.
pub struct PooledHandle<R: Send + 'static> {
    name: String,
    resource: Option<R>,
    inner: Weak<PoolInner<R>>,
}

impl<R: Send + 'static> PooledHandle<R> {
    pub fn table_name(&self) -> &str {
        &self.name
    }
}

impl<R: Send + 'static> std::fmt::Debug for PooledHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<R: Send + 'static> Deref for PooledHandle<R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.resource.as_ref().expect("resource present until drop")
    }
}

impl<R: Send + 'static> DerefMut for PooledHandle<R> {
    fn deref_mut(&mut self) -> &mut R {
        self.resource.as_mut().expect("resource present until drop")
    }
}

impl<R: Send + 'static> Drop for PooledHandle<R> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        match self.inner.upgrade() {
            Some(inner) => inner.return_resource(&self.name, resource),
            None => drop(resource),
        }
    }
}

pub struct Pool<R: Send + 'static> {
    inner: Arc<PoolInner<R>>,
}

impl<R: Send + 'static> Pool<R> {
    pub fn new(
        kind: PoolKind,
        clock: Arc<dyn MicrosecondClock>,
        factory: impl Fn(&str) -> Result<R> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                kind,
                factory: Box::new(factory),
                clock,
                entries: Mutex::new(HashMap::new()),
                listener: RwLock::new(None),
                busy: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Leases the resource for `name`, constructing it on first use. Fails
    /// without blocking when the entry is busy or locked; a construction
    /// failure retains no entry.
    pub fn get(&self, name: &str) -> Result<PooledHandle<R>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(EngineError::EntryUnavailable {
                pool: inner.kind,
                table: name.to_string(),
            }
            .into());
        }

        {
            let mut entries = inner.entries.lock();
            match entries.get_mut(name) {
                Some(slot @ Entry::Idle { .. }) => {
                    let prev = std::mem::replace(
                        slot,
                        Entry::Busy {
                            owner: thread::current().id(),
                        },
                    );
                    let Entry::Idle { resource, .. } = prev else {
                        unreachable!()
                    };
                    inner.busy.fetch_add(1, Ordering::AcqRel);
                    inner.notify(PoolEventKind::Acquired, name);
                    return Ok(PooledHandle {
                        name: name.to_string(),
                        resource: Some(resource),
                        inner: Arc::downgrade(inner),
                    });
                }
                Some(Entry::Busy { .. }) => {
                    return Err(EngineError::EntryUnavailable {
                        pool: inner.kind,
                        table: name.to_string(),
                    }
                    .into());
                }
                Some(Entry::Locked { .. }) => {
                    return Err(EngineError::EntryLocked {
                        pool: inner.kind,
                        table: name.to_string(),
                    }
                    .into());
                }
                None => {
                    // Reserve the name before constructing so a concurrent
                    // get cannot build a second resource for it. Contenders
                    // see a busy entry until construction settles.
                    entries.insert(
                        name.to_string(),
                        Entry::Busy {
                            owner: thread::current().id(),
                        },
                    );
                }
            }
        }

        match (inner.factory)(name) {
            Ok(resource) => {
                inner.busy.fetch_add(1, Ordering::AcqRel);
                inner.notify(PoolEventKind::Acquired, name);
                Ok(PooledHandle {
                    name: name.to_string(),
                    resource: Some(resource),
                    inner: Arc::downgrade(inner),
                })
            }
            Err(err) => {
                let mut entries = inner.entries.lock();
                entries.remove(name);
                inner.notify(PoolEventKind::ConstructionFailed, name);
                Err(err).wrap_err_with(|| {
                    format!("could not construct {} entry for '{}'", inner.kind, name)
                })
            }
        }
    }

    /// Administratively locks `name`. Succeeds only when the entry is idle
    /// or absent; locking an idle entry closes its resource. A locked entry
    /// rejects leases until unlocked.
    pub fn lock(&self, name: &str) -> bool {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut entries = inner.entries.lock();
        let owner = thread::current().id();
        match entries.get_mut(name) {
            None => {
                entries.insert(name.to_string(), Entry::Locked { owner });
                inner.notify(PoolEventKind::Locked, name);
                true
            }
            Some(slot @ Entry::Idle { .. }) => {
                let prev = std::mem::replace(slot, Entry::Locked { owner });
                drop(prev);
                inner.notify(PoolEventKind::Closed, name);
                inner.notify(PoolEventKind::Locked, name);
                true
            }
            Some(Entry::Busy { .. }) | Some(Entry::Locked { .. }) => false,
        }
    }

    /// Releases the lock on `name`. A donated resource is installed as the
    /// idle entry; without one the entry reverts to absent for lazy
    /// construction on the next lease. Unlocking a name that is not locked
    /// is a no-op.
    pub fn unlock(&self, name: &str, donation: Option<R>) {
        let inner = &self.inner;
        let mut entries = inner.entries.lock();
        if !matches!(entries.get(name), Some(Entry::Locked { .. })) {
            // Not locked: the donation, if any, has nowhere to go.
            drop(donation);
            return;
        }
        match donation {
            Some(resource) => {
                entries.insert(
                    name.to_string(),
                    Entry::Idle {
                        resource,
                        last_used: inner.clock.now_micros(),
                    },
                );
            }
            None => {
                entries.remove(name);
            }
        }
        inner.notify(PoolEventKind::Unlocked, name);
    }

    /// Thread holding the lease or lock on `name`, when there is one.
    pub fn owner_of(&self, name: &str) -> Option<ThreadId> {
        match self.inner.entries.lock().get(name) {
            Some(Entry::Busy { owner }) | Some(Entry::Locked { owner }) => Some(*owner),
            _ => None,
        }
    }

    pub fn is_locked(&self, name: &str) -> bool {
        matches!(
            self.inner.entries.lock().get(name),
            Some(Entry::Locked { .. })
        )
    }

    /// Closes and discards every idle entry whose last-used timestamp
    /// precedes `now - ttl_micros`; an entry exactly `ttl_micros` old
    /// survives. Returns true when anything was released.
    pub fn release_inactive(&self, ttl_micros: u64) -> bool {
        let inner = &self.inner;
        let now = inner.clock.now_micros();
        let mut entries = inner.entries.lock();
        let before = entries.len();
        entries.retain(|name, entry| match entry {
            Entry::Idle { last_used, .. } if last_used.saturating_add(ttl_micros) < now => {
                inner.notify(PoolEventKind::Evicted, name);
                false
            }
            _ => true,
        });
        entries.len() != before
    }

    /// Closes every idle entry unconditionally. Busy and locked entries are
    /// untouched.
    pub fn release_all(&self) -> bool {
        let inner = &self.inner;
        let mut entries = inner.entries.lock();
        let before = entries.len();
        entries.retain(|name, entry| {
            if entry.is_idle() {
                inner.notify(PoolEventKind::Closed, name);
                false
            } else {
                true
            }
        });
        entries.len() != before
    }

    pub fn busy_count(&self) -> usize {
        self.inner.busy.load(Ordering::Acquire)
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn PoolListener>>) {
        *self.inner.listener.write() = listener;
    }

    pub fn listener(&self) -> Option<Arc<dyn PoolListener>> {
        self.inner.listener.read().clone()
    }

    /// Shuts the pool down: idle and locked entries are discarded, and
    /// outstanding leases release their resources on return instead of
    /// re-pooling them. Idempotent.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut entries = inner.entries.lock();
        for (name, entry) in entries.drain() {
            if entry.is_idle() {
                inner.notify(PoolEventKind::Closed, &name);
            }
        }
    }
}
