//! Shorthand for the common instrumentation patterns.

/// Start a [`PerformanceSpan`](crate::performance::PerformanceSpan).
///
/// ```rust
/// use cudify_tracing::perf_span;
///
/// let _span = perf_span!("upload", bytes = 4096);
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        $crate::__tracing::debug!(span = $name, $($field = $value),+, "perf_span_start");
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// Like [`perf_span!`] but only logs regions slower than `threshold_us`.
///
/// ```rust
/// use cudify_tracing::perf_span_threshold;
///
/// let _span = perf_span_threshold!("launch", Some(500), blocks = 16);
/// ```
#[macro_export]
macro_rules! perf_span_threshold {
    ($name:expr, $threshold_us:expr) => {{
        $crate::performance::PerformanceSpan::new($name, $threshold_us)
    }};
    ($name:expr, $threshold_us:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        $crate::__tracing::trace!(span = $name, $($field = $value),+, "perf_span_start");
        $crate::performance::PerformanceSpan::new($name, $threshold_us)
    }};
}

/// Evaluate a block and return `(value, duration_us)`.
///
/// ```rust
/// use cudify_tracing::timed_block;
///
/// let (sum, _us) = timed_block!("sum", { (1..=10).sum::<i32>() });
/// assert_eq!(sum, 55);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = ::std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        $crate::__tracing::debug!(
            operation = $name,
            duration_us = duration_us,
            "timed_block_complete"
        );
        (result, duration_us)
    }};
}
