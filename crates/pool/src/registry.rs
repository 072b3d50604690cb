use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use resolver::RoutePattern;
use transport::IsolateAddress;

use crate::launcher::IsolateHandle;

/// One live isolate.
pub struct IsolateRecord {
    pub pattern: RoutePattern,
    pub address: IsolateAddress,
    pub import: String,
    pub handle: Box<dyn IsolateHandle>,
    pub loaded_at: Instant,
}

impl IsolateRecord {
    pub fn terminate(&self) {
        tracing::debug!("Terminating isolate {} at {}", self.handle.id(), self.address);
        self.handle.terminate();
    }
}

/// Live isolates keyed by route pattern.
#[derive(Default)]
pub struct IsolateRegistry {
    records: Mutex<HashMap<RoutePattern, Arc<IsolateRecord>>>,
}

impl IsolateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pattern: &RoutePattern) -> Option<Arc<IsolateRecord>> {
        self.records.lock().get(pattern).cloned()
    }

    /// Stores `record`, returning the one it replaces.
    pub fn insert(&self, record: Arc<IsolateRecord>) -> Option<Arc<IsolateRecord>> {
        self.records.lock().insert(record.pattern.clone(), record)
    }

    pub fn remove(&self, pattern: &RoutePattern) -> Option<Arc<IsolateRecord>> {
        self.records.lock().remove(pattern)
    }

    /// Removes the entry only while it still points at `address`, so a
    /// replacement swapped in meanwhile survives.
    pub fn remove_if_address(
        &self,
        pattern: &RoutePattern,
        address: &IsolateAddress,
    ) -> Option<Arc<IsolateRecord>> {
        let mut records = self.records.lock();
        match records.get(pattern) {
            Some(record) if record.address == *address => records.remove(pattern),
            _ => None,
        }
    }

    pub fn patterns(&self) -> Vec<RoutePattern> {
        self.records.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn drain(&self) -> Vec<Arc<IsolateRecord>> {
        self.records.lock().drain().map(|(_, record)| record).collect()
    }
}
