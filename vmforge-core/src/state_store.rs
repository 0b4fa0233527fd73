//! Tracked-state store
//!
//! Keeps one [`TrackedVm`] per resource instance, keyed by VM name, so that
//! read and delete can run in a later process than create.

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::VmforgeResult;
use crate::types::TrackedVm;

pub const TRACKED_VM_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tracked_vms");

pub trait StateStore: Send + Sync {
    fn load(&self, name: &str) -> VmforgeResult<Option<TrackedVm>>;

    fn save(&self, tracked: &TrackedVm) -> VmforgeResult<()>;

    fn remove(&self, name: &str) -> VmforgeResult<()>;

    fn list(&self) -> VmforgeResult<Vec<TrackedVm>>;

    /// Persist the record if it is still tracked, drop it otherwise
    fn sync(&self, tracked: &TrackedVm) -> VmforgeResult<()> {
        if tracked.is_tracked() {
            self.save(tracked)
        } else {
            self.remove(&tracked.spec.name)
        }
    }
}

/// Store backed by a redb database shared with other components
pub struct RedbStateStore {
    database: Arc<Database>,
}

impl RedbStateStore {
    pub fn new(database: Arc<Database>) -> VmforgeResult<Self> {
        // Create the table up front so readers never see a missing table
        let write_txn = database.begin_write()?;
        {
            let _table = write_txn.open_table(TRACKED_VM_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { database })
    }
}

impl StateStore for RedbStateStore {
    fn load(&self, name: &str) -> VmforgeResult<Option<TrackedVm>> {
        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(TRACKED_VM_TABLE)?;
        let tracked = match table.get(name)? {
            Some(data) => Some(serde_json::from_slice(data.value())?),
            None => None,
        };
        Ok(tracked)
    }

    fn save(&self, tracked: &TrackedVm) -> VmforgeResult<()> {
        let data = serde_json::to_vec(tracked)?;
        let write_txn = self.database.begin_write()?;
        {
            let mut table = write_txn.open_table(TRACKED_VM_TABLE)?;
            table.insert(tracked.spec.name.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        debug!(vm = %tracked.spec.name, "saved tracked state");
        Ok(())
    }

    fn remove(&self, name: &str) -> VmforgeResult<()> {
        let write_txn = self.database.begin_write()?;
        {
            let mut table = write_txn.open_table(TRACKED_VM_TABLE)?;
            table.remove(name)?;
        }
        write_txn.commit()?;
        debug!(vm = %name, "removed tracked state");
        Ok(())
    }

    fn list(&self) -> VmforgeResult<Vec<TrackedVm>> {
        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(TRACKED_VM_TABLE)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_key, value) = entry?;
            result.push(serde_json::from_slice(value.value())?);
        }
        Ok(result)
    }
}

/// In-process store for tests and one-shot runs
#[derive(Default)]
pub struct MemoryStateStore {
    records: RwLock<BTreeMap<String, TrackedVm>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, name: &str) -> VmforgeResult<Option<TrackedVm>> {
        Ok(self.records.read().get(name).cloned())
    }

    fn save(&self, tracked: &TrackedVm) -> VmforgeResult<()> {
        self.records
            .write()
            .insert(tracked.spec.name.clone(), tracked.clone());
        Ok(())
    }

    fn remove(&self, name: &str) -> VmforgeResult<()> {
        self.records.write().remove(name);
        Ok(())
    }

    fn list(&self) -> VmforgeResult<Vec<TrackedVm>> {
        Ok(self.records.read().values().cloned().collect())
    }
}
