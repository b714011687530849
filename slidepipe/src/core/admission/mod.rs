//! Admission Module
//!
//! Decides whether a detected file becomes a conversion task, and tracks which
//! task keys are in flight so that no key is ever converted twice at once.

mod gate;

pub use gate::*;

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::core::CoreResult;

// =============================================================================
// Admission Store
// =============================================================================

/// In-flight set of task keys.
///
/// The default store is process-local. A shared implementation lets several
/// service instances watching the same share avoid claiming the same slide.
#[async_trait]
pub trait AdmissionStore: Send + Sync {
    /// Returns true when the key is claimed by a live task
    async fn exists(&self, task_key: &str) -> CoreResult<bool>;

    /// Claims a key. Returns false when it was already claimed.
    async fn insert(&self, task_key: &str) -> CoreResult<bool>;

    /// Releases a key after its task reached a terminal state
    async fn remove(&self, task_key: &str) -> CoreResult<()>;
}

/// Process-local admission store
#[derive(Debug, Default)]
pub struct MemoryAdmissionStore {
    keys: Mutex<HashSet<String>>,
}

impl MemoryAdmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AdmissionStore for MemoryAdmissionStore {
    async fn exists(&self, task_key: &str) -> CoreResult<bool> {
        Ok(self
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(task_key))
    }

    async fn insert(&self, task_key: &str) -> CoreResult<bool> {
        Ok(self
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_key.to_string()))
    }

    async fn remove(&self, task_key: &str) -> CoreResult<()> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_key);
        Ok(())
    }
}
