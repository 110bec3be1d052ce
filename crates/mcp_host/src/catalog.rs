//! TTL-bounded cache of the aggregate tool catalog.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{model::ToolDescriptor, registry::ServerRegistry};

/// How long a snapshot stays servable before `get` refreshes it.
pub const DEFAULT_CATALOG_TTL: Duration = Duration::from_secs(300);

/// Snapshot of `{server id → tool list}` with one TTL for the whole cache.
///
/// Reads hand out value copies; concurrent reads that race on a stale
/// snapshot coalesce into a single refresh behind an async gate, and the new
/// snapshot is published atomically.
pub struct ToolCatalog {
    ttl: Duration,
    snapshot: Mutex<Snapshot>,
    refresh_gate: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct Snapshot {
    tools_by_server: HashMap<String, Vec<ToolDescriptor>>,
    refreshed_at: Option<Instant>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_CATALOG_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            snapshot: Mutex::new(Snapshot::default()),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the snapshot, refreshing from the registry when stale.
    /// Infallible: `all_tools` substitutes empty lists for broken servers.
    pub async fn get(&self, registry: &ServerRegistry) -> HashMap<String, Vec<ToolDescriptor>> {
        self.get_with(|| registry.all_tools()).await
    }

    /// Like [`get`](Self::get) with a caller-supplied refresh source.
    pub async fn get_with<F, Fut>(&self, refresh: F) -> HashMap<String, Vec<ToolDescriptor>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = HashMap<String, Vec<ToolDescriptor>>>,
    {
        if let Some(fresh) = self.fresh_copy() {
            return fresh;
        }

        let _gate = self.refresh_gate.lock().await;
        // A racing reader may have refreshed while this one queued on the gate.
        if let Some(fresh) = self.fresh_copy() {
            return fresh;
        }

        let tools_by_server = refresh().await;
        debug!(servers = tools_by_server.len(), "tool catalog refreshed");
        {
            let mut snapshot = lock(&self.snapshot);
            snapshot.tools_by_server = tools_by_server.clone();
            snapshot.refreshed_at = Some(Instant::now());
        }
        tools_by_server
    }

    /// Drops the timestamp so the next `get` refreshes.
    pub fn invalidate(&self) {
        lock(&self.snapshot).refreshed_at = None;
    }

    /// Age of the current snapshot, if one was ever published.
    pub fn age(&self) -> Option<Duration> {
        lock(&self.snapshot).refreshed_at.map(|at| at.elapsed())
    }

    fn fresh_copy(&self) -> Option<HashMap<String, Vec<ToolDescriptor>>> {
        let snapshot = lock(&self.snapshot);
        match snapshot.refreshed_at {
            Some(at) if at.elapsed() < self.ttl => Some(snapshot.tools_by_server.clone()),
            _ => None,
        }
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
