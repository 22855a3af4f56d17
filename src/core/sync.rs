//! Process-local synchronization primitives shared between stores and flag files.
//!
//! Production code uses [`SyncContext::global`], so every store in the process serializes its
//! saves through one mutex. Tests hand each simulated machine its own isolated context.

use crate::core::error::CairnError;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

#[derive(Debug, Clone)]
pub struct SyncContext {
    save_lock: Arc<Mutex<()>>,
    flag_lock: Arc<Mutex<()>>,
}

impl SyncContext {
    pub fn global() -> Self {
        static GLOBAL: OnceLock<SyncContext> = OnceLock::new();
        GLOBAL.get_or_init(SyncContext::isolated).clone()
    }

    pub fn isolated() -> Self {
        Self {
            save_lock: Arc::new(Mutex::new(())),
            flag_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn lock_save(&self) -> Result<MutexGuard<'_, ()>, CairnError> {
        self.save_lock
            .lock()
            .map_err(|_| CairnError::ValidationError("save lock poisoned".to_string()))
    }

    pub fn lock_flags(&self) -> Result<MutexGuard<'_, ()>, CairnError> {
        self.flag_lock
            .lock()
            .map_err(|_| CairnError::ValidationError("flag lock poisoned".to_string()))
    }

    pub fn shares_save_lock(&self, other: &SyncContext) -> bool {
        Arc::ptr_eq(&self.save_lock, &other.save_lock)
    }
}

impl Default for SyncContext {
    fn default() -> Self {
        Self::global()
    }
}
