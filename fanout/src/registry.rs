//! Shared worker pools, one per [`PoolKey`].
//!
//! Dispatchers ask the registry for a pool on every batch. The first request
//! for a key builds the pool; later requests get the same `Arc` back until the
//! pool is shut down or evicted. Pools are never torn down behind a caller's
//! back: eviction skips any pool a caller still holds.

use dashmap::{DashMap, mapref::entry::Entry};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use crate::{
    error::Result,
    pool::{PoolKey, ProcessCommand, WorkerPool},
    settings::ExecutorKind,
};

#[derive(Debug)]
pub struct PoolRegistry {
    pools: DashMap<PoolKey, Arc<WorkerPool>>,
    command: ProcessCommand,
    created: AtomicUsize,
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolRegistry {
    /// Process pools launch the current executable.
    pub fn new() -> Self {
        let command = ProcessCommand::current_exe().unwrap_or_else(|e| {
            let argv0 = std::env::args_os().next().unwrap_or_default();
            tracing::warn!(
                "Cannot locate the current executable ({e}), process workers will run {argv0:?}"
            );
            ProcessCommand::new(argv0)
        });
        Self::with_command(command)
    }

    /// Process pools launch `command` instead of the current executable.
    pub fn with_command(command: ProcessCommand) -> Self {
        Self {
            pools: DashMap::new(),
            command,
            created: AtomicUsize::new(0),
        }
    }

    pub fn command(&self) -> &ProcessCommand {
        &self.command
    }

    /// Returns the live pool for `(executor, workers)`, building it if needed.
    ///
    /// With `prewarm`, the pool has run a warm-up job on every worker before
    /// this returns.
    pub fn acquire(
        &self,
        executor: ExecutorKind,
        workers: usize,
        prewarm: bool,
    ) -> Result<Arc<WorkerPool>> {
        let key = PoolKey::new(executor, workers);
        let pool = match self.get(&key) {
            Some(pool) => pool,
            None => self.get_or_create(key, prewarm)?,
        };
        if prewarm && pool.warmed_workers() < pool.workers() {
            pool.prewarm()?;
        }
        pool.touch();
        Ok(pool)
    }

    fn get_or_create(&self, key: PoolKey, prewarm: bool) -> Result<Arc<WorkerPool>> {
        // The entry holds the shard lock, so a key is only ever built once.
        match self.pools.entry(key) {
            Entry::Occupied(entry) if !entry.get().is_closed() => Ok(Arc::clone(entry.get())),
            Entry::Occupied(mut entry) => {
                tracing::debug!(%key, "Replacing closed worker pool");
                let pool = self.build(key, prewarm)?;
                entry.insert(Arc::clone(&pool));
                Ok(pool)
            }
            Entry::Vacant(entry) => {
                let pool = self.build(key, prewarm)?;
                entry.insert(Arc::clone(&pool));
                Ok(pool)
            }
        }
    }

    fn build(&self, key: PoolKey, prewarm: bool) -> Result<Arc<WorkerPool>> {
        let pool = WorkerPool::spawn(key, &self.command)?;
        if prewarm {
            pool.prewarm()?;
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(pool))
    }

    /// The live pool for `key`, if there is one.
    pub fn get(&self, key: &PoolKey) -> Option<Arc<WorkerPool>> {
        self.pools
            .get(key)
            .filter(|pool| !pool.is_closed())
            .map(|pool| Arc::clone(pool.value()))
    }

    /// Removes and shuts down the pool for `(executor, workers)`.
    ///
    /// Returns whether there was one.
    pub fn shutdown(&self, executor: ExecutorKind, workers: usize) -> bool {
        match self.pools.remove(&PoolKey::new(executor, workers)) {
            Some((_, pool)) => {
                pool.shutdown();
                true
            }
            None => false,
        }
    }

    /// Shuts down pools that nobody holds and that have been idle for longer
    /// than `max_idle`. Returns how many were evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let evictable = |pool: &Arc<WorkerPool>| {
            Arc::strong_count(pool) == 1 && pool.idle_for() > max_idle
        };
        let candidates: Vec<PoolKey> = self
            .pools
            .iter()
            .filter(|entry| evictable(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = 0;
        for key in candidates {
            if let Some((_, pool)) = self.pools.remove_if(&key, |_, pool| evictable(pool)) {
                tracing::debug!(%key, idle = ?pool.idle_for(), "Evicting idle worker pool");
                pool.shutdown();
                evicted += 1;
            }
        }
        evicted
    }

    /// Shuts down every pool.
    pub fn shutdown_all(&self) {
        let keys: Vec<PoolKey> = self.pools.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, pool)) = self.pools.remove(&key) {
                pool.shutdown();
            }
        }
    }

    /// How many pools this registry has built so far.
    pub fn pools_created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

impl Drop for PoolRegistry {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}
