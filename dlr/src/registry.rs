//! Handle registry: maps opaque model handles to the runtime that owns them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::DlrError;
use crate::runtime::{ModelPtr, Runtime, RuntimeId};

/// Opaque identifier of a live model.
///
/// Handles are issued by the registry, never reused, and never expose the
/// native model address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelHandle(u64);

impl ModelHandle {
    /// Rebuilds a handle from its raw value, e.g. one that crossed an FFI
    /// boundary. The result may name no model; operations then fail with
    /// [`DlrError::InvalidHandle`].
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model#{}", self.0)
    }
}

/// A created model together with the runtime instance that created it.
pub(crate) struct LiveModel {
    pub native: ModelPtr,
    pub runtime: Box<dyn Runtime>,
}

/// Registry entry. The slot lock serializes every native call on the model;
/// a deleted model leaves the slot empty.
pub(crate) struct ModelSlot {
    pub runtime_id: RuntimeId,
    pub state: Mutex<Option<LiveModel>>,
}

pub(crate) struct HandleRegistry {
    next: AtomicU64,
    models: Mutex<HashMap<ModelHandle, Arc<ModelSlot>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            models: Mutex::new(HashMap::new()),
        }
    }

    /// Stores a model under a freshly issued handle.
    pub fn register(&self, runtime_id: RuntimeId, model: LiveModel) -> ModelHandle {
        let handle = ModelHandle(self.next.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(ModelSlot {
            runtime_id,
            state: Mutex::new(Some(model)),
        });
        self.models.lock().insert(handle, slot);
        handle
    }

    pub fn lookup(&self, handle: ModelHandle) -> Result<Arc<ModelSlot>, DlrError> {
        self.models
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(DlrError::InvalidHandle(handle))
    }

    pub fn unregister(&self, handle: ModelHandle) -> Result<Arc<ModelSlot>, DlrError> {
        self.models
            .lock()
            .remove(&handle)
            .ok_or(DlrError::InvalidHandle(handle))
    }

    /// Returns the registered handles in issue order.
    pub fn handles(&self) -> Vec<ModelHandle> {
        let mut handles: Vec<ModelHandle> = self.models.lock().keys().copied().collect();
        handles.sort_unstable();
        handles
    }
}

#[cfg(test)]
impl HandleRegistry {
    pub fn len(&self) -> usize {
        self.models.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
