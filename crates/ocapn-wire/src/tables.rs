//! Per-session export and import tables.
//!
//! Positions are local to one session. Export position 0 is always the
//! bootstrap object and is never collected.

use crate::captp::ImportHandle;
use crate::passable::{local_identity, Invocable, ObjectRef, Passable};
use crate::promise::Promise;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

pub const BOOTSTRAP_POSITION: u64 = 0;

/// Something this side hosts and has made reachable to the peer.
#[derive(Clone)]
pub enum Exported {
    Object(Arc<dyn Invocable>),
    Promise(Promise),
}

impl Exported {
    fn identity(&self) -> usize {
        match self {
            Self::Object(object) => local_identity(object),
            Self::Promise(promise) => promise.identity(),
        }
    }

    pub fn to_passable(&self) -> Passable {
        match self {
            Self::Object(object) => Passable::Object(ObjectRef::Local(Arc::clone(object))),
            Self::Promise(promise) => Passable::Promise(promise.clone()),
        }
    }
}

struct ExportEntry {
    value: Exported,
    /// Times this position was sent minus the deltas the peer reported.
    refcount: u64,
}

pub struct ExportTable {
    next_position: u64,
    entries: HashMap<u64, ExportEntry>,
    positions: HashMap<usize, u64>,
}

impl ExportTable {
    pub fn new(bootstrap: Arc<dyn Invocable>) -> Self {
        let value = Exported::Object(bootstrap);
        let mut positions = HashMap::new();
        positions.insert(value.identity(), BOOTSTRAP_POSITION);
        let mut entries = HashMap::new();
        entries.insert(BOOTSTRAP_POSITION, ExportEntry { value, refcount: 0 });
        Self {
            next_position: BOOTSTRAP_POSITION + 1,
            entries,
            positions,
        }
    }

    /// Export `value`, reusing its position if it is already exported.
    pub fn export(&mut self, value: Exported) -> u64 {
        if let Some(position) = self.positions.get(&value.identity()).copied() {
            if let Some(entry) = self.entries.get_mut(&position) {
                entry.refcount += 1;
                return position;
            }
        }
        self.export_fresh(|_| value)
    }

    /// Export a new value that needs to know its own position.
    pub fn export_fresh(&mut self, make: impl FnOnce(u64) -> Exported) -> u64 {
        let position = self.next_position;
        self.next_position += 1;
        let value = make(position);
        self.positions.insert(value.identity(), position);
        self.entries.insert(position, ExportEntry { value, refcount: 1 });
        position
    }

    pub fn get(&self, position: u64) -> Option<Exported> {
        self.entries.get(&position).map(|e| e.value.clone())
    }

    pub fn remove(&mut self, position: u64) -> Option<Exported> {
        if position == BOOTSTRAP_POSITION {
            return None;
        }
        let entry = self.entries.remove(&position)?;
        self.positions.remove(&entry.value.identity());
        Some(entry.value)
    }

    /// Apply an `op:gc-export`. Returns the entry if it was dropped.
    pub fn gc(&mut self, position: u64, wire_delta: u64) -> Option<Exported> {
        let entry = self.entries.get_mut(&position)?;
        entry.refcount = entry.refcount.saturating_sub(wire_delta);
        if entry.refcount == 0 {
            self.remove(position)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything but the bootstrap object.
    pub fn clear(&mut self) -> Vec<Exported> {
        let positions: Vec<u64> = self
            .entries
            .keys()
            .copied()
            .filter(|p| *p != BOOTSTRAP_POSITION)
            .collect();
        positions.into_iter().filter_map(|p| self.remove(p)).collect()
    }
}

struct ImportedPromise {
    promise: Promise,
    /// Times the peer sent us this position.
    received: u64,
}

/// The peer's exports as seen from this side.
#[derive(Default)]
pub(crate) struct ImportTable {
    objects: HashMap<u64, Weak<ImportHandle>>,
    promises: HashMap<u64, ImportedPromise>,
}

impl ImportTable {
    /// The live handle for `position`, or a new one from `make`.
    pub fn object(
        &mut self,
        position: u64,
        make: impl FnOnce() -> Arc<ImportHandle>,
    ) -> Arc<ImportHandle> {
        if let Some(handle) = self.objects.get(&position).and_then(Weak::upgrade) {
            return handle;
        }
        let handle = make();
        self.objects.insert(position, Arc::downgrade(&handle));
        handle
    }

    /// The promise already imported at `position`, counting this receipt.
    pub fn receive_promise(&mut self, position: u64) -> Option<Promise> {
        let entry = self.promises.get_mut(&position)?;
        entry.received += 1;
        Some(entry.promise.clone())
    }

    pub fn insert_promise(&mut self, position: u64, promise: Promise) {
        self.promises
            .insert(position, ImportedPromise { promise, received: 1 });
    }

    /// Forget a promise import. Returns it with the wire delta the peer is
    /// owed in `op:gc-export`.
    pub fn remove_promise(&mut self, position: u64) -> Option<(Promise, u64)> {
        self.promises
            .remove(&position)
            .map(|entry| (entry.promise, entry.received))
    }

    pub fn clear(&mut self) -> Vec<Promise> {
        self.objects.clear();
        self.promises.drain().map(|(_, entry)| entry.promise).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> Arc<dyn Invocable> {
        match Passable::from_fn(|_, _| Ok(Passable::unit())) {
            Passable::Object(ObjectRef::Local(object)) => object,
            other => panic!("Expected local object, got {other:?}"),
        }
    }

    #[test]
    fn test_promise_import_counts_receipts() {
        let mut imports = ImportTable::default();
        let (promise, _resolver) = Promise::pending();
        assert!(imports.receive_promise(4).is_none());
        imports.insert_promise(4, promise);
        assert!(imports.receive_promise(4).is_some());
        assert!(imports.receive_promise(4).is_some());
        let (_, received) = imports.remove_promise(4).unwrap();
        assert_eq!(received, 3);
        assert!(imports.remove_promise(4).is_none());
    }

    #[test]
    fn test_bootstrap_is_position_zero() {
        let bootstrap = object();
        let mut table = ExportTable::new(Arc::clone(&bootstrap));
        assert_eq!(table.export(Exported::Object(bootstrap)), BOOTSTRAP_POSITION);
        assert!(table.remove(BOOTSTRAP_POSITION).is_none());
        assert!(table.gc(BOOTSTRAP_POSITION, 10).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_export_reuses_position() {
        let mut table = ExportTable::new(object());
        let a = object();
        let b = object();
        let pa = table.export(Exported::Object(Arc::clone(&a)));
        let pb = table.export(Exported::Object(Arc::clone(&b)));
        assert_eq!(pa, 1);
        assert_eq!(pb, 2);
        assert_eq!(table.export(Exported::Object(a)), pa);
    }

    #[test]
    fn test_gc_drops_at_zero() {
        let mut table = ExportTable::new(object());
        let a = object();
        let position = table.export(Exported::Object(Arc::clone(&a)));
        table.export(Exported::Object(Arc::clone(&a)));

        assert!(table.gc(position, 1).is_none());
        assert!(table.get(position).is_some());
        assert!(table.gc(position, 1).is_some());
        assert!(table.get(position).is_none());

        // Re-exporting after collection allocates a new position.
        let again = table.export(Exported::Object(a));
        assert_ne!(again, position);
    }

    #[test]
    fn test_promises_are_exported_by_identity() {
        let mut table = ExportTable::new(object());
        let (promise, _resolver) = Promise::pending();
        let p1 = table.export(Exported::Promise(promise.clone()));
        let p2 = table.export(Exported::Promise(promise));
        assert_eq!(p1, p2);
        let (other, _r) = Promise::pending();
        assert_ne!(table.export(Exported::Promise(other)), p1);
    }

    #[test]
    fn test_clear_keeps_bootstrap() {
        let mut table = ExportTable::new(object());
        table.export(Exported::Object(object()));
        table.export_fresh(|_| Exported::Object(object()));
        assert_eq!(table.clear().len(), 2);
        assert_eq!(table.len(), 1);
        assert!(table.get(BOOTSTRAP_POSITION).is_some());
    }
}
