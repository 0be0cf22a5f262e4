//! Register maps: which bytes of which controller block hold which values.

mod alarms;
mod descriptor;
mod plant;

pub use alarms::*;
pub use descriptor::*;
pub use plant::*;

use std::path::Path;
use std::sync::{Arc, RwLock};

/// Shared handle to the active layout table.
///
/// Reloading swaps the whole table; readers holding an older `Arc` keep a
/// consistent view until they drop it.
#[derive(Clone)]
pub struct LayoutHandle {
    current: Arc<RwLock<Arc<LayoutTable>>>,
}

impl LayoutHandle {
    pub fn new(table: LayoutTable) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(table))),
        }
    }

    pub fn current(&self) -> Arc<LayoutTable> {
        self.current.read().unwrap().clone()
    }

    /// Replace the active table, returning the previous one.
    pub fn swap(&self, table: LayoutTable) -> Arc<LayoutTable> {
        let mut guard = self.current.write().unwrap();
        std::mem::replace(&mut *guard, Arc::new(table))
    }

    /// Load, validate and swap in a plant file. The active table is kept on error.
    pub fn reload_from_file<P: AsRef<Path>>(&self, path: P) -> Result<usize, LayoutError> {
        let table = LayoutTable::build(PlantConfig::from_file(path)?)?;
        let count = table.devices().count();
        self.swap(table);
        tracing::info!("Layout reloaded: {} devices", count);
        Ok(count)
    }
}
