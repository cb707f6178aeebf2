//! The threshold configured on the global subscriber is the one runtime
//! spans use. Own test binary: the subscriber and threshold are per process.

use cudify_tracing::performance::{default_threshold_us, set_default_threshold_us};
use cudify_tracing::{init_global_tracing, TracingConfig, TracingOutput};

#[test]
fn global_init_fixes_the_span_threshold() {
    let config = TracingConfig {
        default_directive: "warn".to_string(),
        ansi: false,
        output: TracingOutput::Compact,
        performance_threshold_us: Some(1234),
        ..TracingConfig::for_local()
    };
    init_global_tracing(&config).unwrap();

    assert_eq!(default_threshold_us(), Some(1234));
    assert!(!set_default_threshold_us(Some(1)));
    assert_eq!(default_threshold_us(), Some(1234));
}
