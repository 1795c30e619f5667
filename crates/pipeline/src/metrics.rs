use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Counters for one build run. Updated from many tasks at once.
#[derive(Default)]
pub struct BuildMetrics {
    chunks_processed: AtomicUsize,
    chunks_failed: AtomicUsize,
    entities_extracted: AtomicUsize,
    relations_extracted: AtomicUsize,

    nodes_merged: AtomicUsize,
    edges_merged: AtomicUsize,
    merge_failures: AtomicUsize,

    // Timing (in microseconds)
    extract_time_us: AtomicU64,
    merge_time_us: AtomicU64,
}

impl BuildMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_extraction(&self, chunks: usize, entities: usize, relations: usize) {
        self.chunks_processed.fetch_add(chunks, Ordering::Relaxed);
        self.entities_extracted.fetch_add(entities, Ordering::Relaxed);
        self.relations_extracted.fetch_add(relations, Ordering::Relaxed);
    }

    pub fn record_failed_chunks(&self, chunks: usize) {
        self.chunks_failed.fetch_add(chunks, Ordering::Relaxed);
    }

    pub fn record_merge(&self, is_edge: bool, success: bool) {
        match (is_edge, success) {
            (_, false) => self.merge_failures.fetch_add(1, Ordering::Relaxed),
            (false, true) => self.nodes_merged.fetch_add(1, Ordering::Relaxed),
            (true, true) => self.edges_merged.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_extract_time(&self, duration: Duration) {
        self.extract_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_merge_time(&self, duration: Duration) {
        self.merge_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            entities_extracted: self.entities_extracted.load(Ordering::Relaxed),
            relations_extracted: self.relations_extracted.load(Ordering::Relaxed),
            nodes_merged: self.nodes_merged.load(Ordering::Relaxed),
            edges_merged: self.edges_merged.load(Ordering::Relaxed),
            merge_failures: self.merge_failures.load(Ordering::Relaxed),
            extract_time_ms: us_to_ms(&self.extract_time_us),
            merge_time_ms: us_to_ms(&self.merge_time_us),
        }
    }
}

fn us_to_ms(total_us: &AtomicU64) -> f64 {
    total_us.load(Ordering::Relaxed) as f64 / 1000.0
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub chunks_processed: usize,
    pub chunks_failed: usize,
    pub entities_extracted: usize,
    pub relations_extracted: usize,
    pub nodes_merged: usize,
    pub edges_merged: usize,
    pub merge_failures: usize,
    pub extract_time_ms: f64,
    pub merge_time_ms: f64,
}

pub struct TimedOperation {
    start: Instant,
}

impl TimedOperation {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
