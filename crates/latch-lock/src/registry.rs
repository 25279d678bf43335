// Registry of lease handles held by one locker, keyed by upload id
// Guarded by a synchronous mutex; never held across an await

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::lease::LeaseHandle;

#[derive(Default)]
pub struct LockRegistry {
    handles: Mutex<HashMap<String, LeaseHandle>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the handle for `id`, returning any handle it replaces
    pub fn track(&self, id: &str, handle: LeaseHandle) -> Option<LeaseHandle> {
        self.handles.lock().insert(id.to_string(), handle)
    }

    /// Remove and return the handle for `id`
    pub fn take(&self, id: &str) -> Option<LeaseHandle> {
        self.handles.lock().remove(id)
    }

    /// Remove and return every tracked handle
    pub fn drain(&self) -> Vec<LeaseHandle> {
        self.handles.lock().drain().map(|(_, handle)| handle).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handles.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}
