//! Process registry shared by every supervisor of the provider

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::process::{ProcessHandle, ProcessRegistry};
use iprov_core::prelude::*;

/// Mutex-guarded table of live supervisors, keyed by logical name.
///
/// The lock is only held for insert/delete/snapshot; waiting happens on the
/// cloned handles outside the lock.
#[derive(Debug, Default)]
pub struct ProcessTable {
    procs: Mutex<HashMap<String, ProcessHandle>>,
    shutting_down: AtomicBool,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop accepting restarts and new processes
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<ProcessHandle> {
        self.lock().get(name).cloned()
    }

    /// Stop every registered process and wait until all report terminated
    pub async fn stop_all(&self) {
        let handles = self.snapshot();
        if handles.is_empty() {
            return;
        }

        info!("Stopping {} supervised processes", handles.len());
        for handle in &handles {
            handle.stop();
        }
        for handle in &handles {
            handle.wait_terminated().await;
        }
    }

    fn snapshot(&self) -> Vec<ProcessHandle> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProcessHandle>> {
        // A poisoned table still holds valid handles
        self.procs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProcessRegistry for ProcessTable {
    fn register(&self, handle: ProcessHandle) {
        let name = handle.name().to_string();
        if let Some(previous) = self.lock().insert(name.clone(), handle) {
            warn!("Process name '{}' reused; stopping previous instance", name);
            previous.stop();
        }
    }

    fn unregister(&self, name: &str, id: u64) {
        let mut procs = self.lock();
        if procs.get(name).is_some_and(|h| h.id() == id) {
            procs.remove(name);
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}
