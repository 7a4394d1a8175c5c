//! Lightweight global metrics for pgpio.
//!
//! Thread-safe atomic counters for:
//! - agent protocol traffic (requests, bytes each direction)
//! - async writes and delivered async errors
//! - agent launches

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Protocol -----
static FIO_REQUESTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static FIO_BYTES_SENT: AtomicU64 = AtomicU64::new(0);
static FIO_BYTES_RECEIVED: AtomicU64 = AtomicU64::new(0);

// ----- Async writes -----
static FIO_ASYNC_WRITES: AtomicU64 = AtomicU64::new(0);
static FIO_ASYNC_ERRORS: AtomicU64 = AtomicU64::new(0);

// ----- Agent -----
static AGENT_LAUNCHES: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub fio_requests_total: u64,
    pub fio_bytes_sent: u64,
    pub fio_bytes_received: u64,
    pub fio_async_writes: u64,
    pub fio_async_errors: u64,
    pub agent_launches: u64,
}

impl MetricsSnapshot {
    /// Average request payload in bytes (sent side).
    pub fn avg_request_bytes(&self) -> f64 {
        if self.fio_requests_total == 0 {
            0.0
        } else {
            self.fio_bytes_sent as f64 / self.fio_requests_total as f64
        }
    }
}

pub fn metrics_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        fio_requests_total: FIO_REQUESTS_TOTAL.load(Ordering::Relaxed),
        fio_bytes_sent: FIO_BYTES_SENT.load(Ordering::Relaxed),
        fio_bytes_received: FIO_BYTES_RECEIVED.load(Ordering::Relaxed),
        fio_async_writes: FIO_ASYNC_WRITES.load(Ordering::Relaxed),
        fio_async_errors: FIO_ASYNC_ERRORS.load(Ordering::Relaxed),
        agent_launches: AGENT_LAUNCHES.load(Ordering::Relaxed),
    }
}

pub fn metrics_reset() {
    for c in [
        &FIO_REQUESTS_TOTAL,
        &FIO_BYTES_SENT,
        &FIO_BYTES_RECEIVED,
        &FIO_ASYNC_WRITES,
        &FIO_ASYNC_ERRORS,
        &AGENT_LAUNCHES,
    ] {
        c.store(0, Ordering::Relaxed);
    }
}

// ----- recorders -----

#[inline]
pub fn record_fio_request() {
    FIO_REQUESTS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_fio_sent(bytes: u64) {
    FIO_BYTES_SENT.fetch_add(bytes, Ordering::Relaxed);
}

#[inline]
pub fn record_fio_received(bytes: u64) {
    FIO_BYTES_RECEIVED.fetch_add(bytes, Ordering::Relaxed);
}

#[inline]
pub fn record_async_write() {
    FIO_ASYNC_WRITES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_async_error() {
    FIO_ASYNC_ERRORS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_agent_launch() {
    AGENT_LAUNCHES.fetch_add(1, Ordering::Relaxed);
}
