//! Per-project mutual exclusion.
//!
//! # Invariants
//! - At most one guard per project id exists at a time.
//! - Guards release on drop, including during unwinding.
//! - A poisoned inner mutex is recovered; the held-set stays consistent
//!   because it is only mutated in `acquire` and `drop`.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct ProjectLocks {
    held: Mutex<HashSet<Uuid>>,
    released: Condvar,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the project is free, then holds it.
    pub fn acquire(&self, project_id: Uuid) -> ProjectLockGuard<'_> {
        let mut held = self.held_set();
        while held.contains(&project_id) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(project_id);
        ProjectLockGuard {
            locks: self,
            project_id,
        }
    }

    /// Holds the project only if nobody else does.
    pub fn try_acquire(&self, project_id: Uuid) -> Option<ProjectLockGuard<'_>> {
        let mut held = self.held_set();
        if !held.insert(project_id) {
            return None;
        }
        Some(ProjectLockGuard {
            locks: self,
            project_id,
        })
    }

    fn held_set(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct ProjectLockGuard<'a> {
    locks: &'a ProjectLocks,
    project_id: Uuid,
}

impl ProjectLockGuard<'_> {
    pub fn project_id(&self) -> Uuid {
        self.project_id
    }
}

impl Drop for ProjectLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.held_set().remove(&self.project_id);
        self.locks.released.notify_all();
    }
}
