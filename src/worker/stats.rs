//! Worker statistics.
//!
//! Each worker owns its counters outright (no atomics on the hot path);
//! `WorkerPool::stats` collects them with a broadcast and merges the copies.
//! The only shared numbers are the per-worker descriptor counts in
//! [`WorkerLoad`], which the accepting worker reads to place new clients.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters kept by one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Workers merged into this value
    pub workers: usize,
    /// Client connections adopted by the worker
    pub connections_accepted: u64,
    pub backends_opened: u64,
    /// Connect attempts made for backends being reconnected
    pub reconnects: u64,
    /// Descriptors currently owned
    pub active_descriptors: u64,
    pub descriptors_closed: u64,
    /// Packets handed to the router
    pub packets_routed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub tasks_run: u64,
    /// Tasks that returned an error or panicked
    pub tasks_failed: u64,
    pub protocol_errors: u64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self {
            workers: 1,
            ..Default::default()
        }
    }

    pub fn connection_accepted(&mut self) {
        self.connections_accepted += 1;
        self.active_descriptors += 1;
    }

    pub fn backend_opened(&mut self) {
        self.backends_opened += 1;
        self.active_descriptors += 1;
    }

    pub fn reconnect_started(&mut self) {
        self.reconnects += 1;
    }

    pub fn descriptor_closed(&mut self) {
        self.descriptors_closed += 1;
        self.active_descriptors = self.active_descriptors.saturating_sub(1);
    }

    pub fn packets_routed(&mut self, count: usize) {
        self.packets_routed += count as u64;
    }

    pub fn bytes_read(&mut self, count: usize) {
        self.bytes_read += count as u64;
    }

    pub fn bytes_written(&mut self, count: u64) {
        self.bytes_written += count;
    }

    pub fn task_run(&mut self) {
        self.tasks_run += 1;
    }

    pub fn task_failed(&mut self) {
        self.tasks_run += 1;
        self.tasks_failed += 1;
    }

    pub fn protocol_error(&mut self) {
        self.protocol_errors += 1;
    }

    /// Adds `other` into `self`.
    pub fn merge(&mut self, other: &WorkerStats) {
        self.workers += other.workers;
        self.connections_accepted += other.connections_accepted;
        self.backends_opened += other.backends_opened;
        self.reconnects += other.reconnects;
        self.active_descriptors += other.active_descriptors;
        self.descriptors_closed += other.descriptors_closed;
        self.packets_routed += other.packets_routed;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.tasks_run += other.tasks_run;
        self.tasks_failed += other.tasks_failed;
        self.protocol_errors += other.protocol_errors;
    }
}

impl fmt::Display for WorkerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "workers={} accepted={} backends={} reconnects={} active={} closed={} \
             packets={} read={}B written={}B tasks={} failed={} protocol_errors={}",
            self.workers,
            self.connections_accepted,
            self.backends_opened,
            self.reconnects,
            self.active_descriptors,
            self.descriptors_closed,
            self.packets_routed,
            self.bytes_read,
            self.bytes_written,
            self.tasks_run,
            self.tasks_failed,
            self.protocol_errors
        )
    }
}

/// Descriptor count per worker, readable from any thread.
#[derive(Debug)]
pub struct WorkerLoad {
    counts: Vec<AtomicUsize>,
}

impl WorkerLoad {
    pub fn new(workers: usize) -> Self {
        Self {
            counts: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn increment(&self, worker: usize) {
        if let Some(count) = self.counts.get(worker) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn decrement(&self, worker: usize) {
        if let Some(count) = self.counts.get(worker) {
            let _ = count.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
        }
    }

    pub fn get(&self, worker: usize) -> usize {
        self.counts
            .get(worker)
            .map_or(0, |count| count.load(Ordering::Relaxed))
    }

    /// Worker with the fewest descriptors; ties go to the lowest index.
    pub fn least_loaded(&self) -> usize {
        self.counts
            .iter()
            .enumerate()
            .min_by_key(|(_, count)| count.load(Ordering::Relaxed))
            .map_or(0, |(worker, _)| worker)
    }
}
