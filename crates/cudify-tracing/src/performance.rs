//! Timing helpers for launches, allocations and barrier traffic.
//!
//! ```rust
//! use cudify_tracing::performance::{record_launch, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("grid_launch", Some(100));
//! // ... run the grid ...
//! drop(span); // logged only when it took at least 100us
//!
//! record_launch(8, 64, 1_250);
//! ```

use std::sync::OnceLock;
use std::time::Instant;
use tracing::Level;

/// RAII guard that times a region and logs it on drop.
///
/// Nothing is logged when a threshold is set and the region finished faster.
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Start timing `name`; `threshold_us = None` always logs.
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, name, threshold_us)
    }

    /// Like [`PerformanceSpan::new`] but at an explicit span level.
    pub fn with_level(level: Level, name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %name),
            Level::DEBUG => tracing::debug_span!("perf", name = %name),
            Level::INFO => tracing::info_span!("perf", name = %name),
            Level::WARN => tracing::warn_span!("perf", name = %name),
            Level::ERROR => tracing::error_span!("perf", name = %name),
        };

        Self {
            name,
            threshold_us,
            start_time: Instant::now(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold_us(&self) -> Option<u64> {
        self.threshold_us
    }

    /// Microseconds since the span was created.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.map_or(true, |t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

static THRESHOLD: OnceLock<Option<u64>> = OnceLock::new();

/// Fix the process-wide threshold. Returns `false` when it was already set
/// or already read.
pub fn set_default_threshold_us(threshold_us: Option<u64>) -> bool {
    THRESHOLD.set(threshold_us).is_ok()
}

/// Threshold used by runtime spans: the one installed with the global
/// subscriber, otherwise `CUDIFY_PERF_THRESHOLD_US` read once per process.
pub fn default_threshold_us() -> Option<u64> {
    *THRESHOLD.get_or_init(|| {
        std::env::var(crate::ENV_PERF_THRESHOLD)
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
    })
}

fn per_second(count: u64, duration_us: u64) -> f64 {
    if duration_us == 0 {
        0.0
    } else {
        (count as f64 / duration_us as f64) * 1_000_000.0
    }
}

/// Record a finished grid launch.
pub fn record_launch(blocks: u64, threads_per_block: u64, duration_us: u64) {
    let threads = blocks.saturating_mul(threads_per_block);
    tracing::debug!(
        event = "launch",
        blocks = blocks,
        threads_per_block = threads_per_block,
        threads = threads,
        duration_us = duration_us,
        threads_per_sec = per_second(threads, duration_us),
        "grid_launch_complete"
    );
}

/// Record a device or pinned-host allocation.
pub fn record_allocation(size_bytes: usize, space: &str, duration_us: u64) {
    tracing::debug!(
        event = "allocation",
        size_bytes = size_bytes,
        size_kb = size_bytes as f64 / 1024.0,
        space = space,
        duration_us = duration_us,
        "memory_allocation"
    );
}

/// Record barrier traffic for one block.
pub fn record_barriers(block: u64, generations: u64, resumes: u64) {
    tracing::trace!(
        event = "barrier",
        block = block,
        generations = generations,
        resumes = resumes,
        "block_barriers"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn span_keeps_name_and_threshold() {
        let span = PerformanceSpan::new("launch", Some(1000));
        assert_eq!(span.name(), "launch");
        assert_eq!(span.threshold_us(), Some(1000));
    }

    #[test]
    fn span_measures_elapsed_time() {
        let span = PerformanceSpan::with_level(Level::INFO, "sleep", None);
        thread::sleep(Duration::from_millis(5));
        assert!(span.elapsed_us() >= 5_000);
    }

    #[test]
    fn rates_handle_zero_duration() {
        assert_eq!(per_second(100, 0), 0.0);
        assert!((per_second(1_000, 1_000) - 1_000_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn record_helpers_do_not_panic() {
        record_launch(4, 64, 10);
        record_launch(u64::MAX, 2, 0);
        record_allocation(4096, "device", 3);
        record_barriers(0, 2, 8);
    }
}
