//! Shared tracing setup for the cudify workspace.
//!
//! Binaries, integration tests and benchmarks install their `tracing`
//! subscriber through this crate so the log surface of the runtime looks the
//! same everywhere: one environment-driven configuration, one filter
//! resolution order (`CUDIFY_TRACING_DIRECTIVES`, then `RUST_LOG`, then the
//! default directive), three output formats.
//!
//! ```rust
//! use cudify_tracing::{build_subscriber, TracingConfig};
//!
//! let config = TracingConfig::for_ci();
//! let subscriber = build_subscriber(&config).expect("valid default directive");
//! tracing::subscriber::with_default(subscriber, || {
//!     tracing::info!(workers = 4, "emulator ready");
//! });
//! ```

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;

pub use tracing::{debug, error, info, trace, warn};

#[doc(hidden)]
pub use tracing as __tracing;

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// Environment variable selecting the preset (`local` or `ci`).
pub const ENV_PROFILE: &str = "CUDIFY_TRACING_PROFILE";
/// Environment variable overriding the filter directives.
pub const ENV_DIRECTIVES: &str = "CUDIFY_TRACING_DIRECTIVES";
/// Environment variable selecting the output format.
pub const ENV_FORMAT: &str = "CUDIFY_TRACING_FORMAT";
/// Environment variable setting the performance span threshold in microseconds.
pub const ENV_PERF_THRESHOLD: &str = "CUDIFY_PERF_THRESHOLD_US";

/// How the shared subscriber should behave.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Explicit filter directives (e.g. `cudify_runtime=debug,info`).
    pub directives: Option<String>,
    /// Directive used when neither `directives` nor `RUST_LOG` parse.
    pub default_directive: String,
    /// Print event targets (module paths).
    pub include_targets: bool,
    /// ANSI colours. Off for CI logs.
    pub ansi: bool,
    /// Span lifecycle events to emit.
    pub span_events: FmtSpan,
    /// Formatter output.
    pub output: TracingOutput,
    /// Performance spans shorter than this are not logged.
    pub performance_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

impl TracingConfig {
    /// Pretty, coloured output for local development.
    pub fn for_local() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: true,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Pretty,
            performance_threshold_us: None,
        }
    }

    /// JSON without colour codes, for CI and log collectors.
    pub fn for_ci() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: false,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Json,
            performance_threshold_us: None,
        }
    }

    /// Build a configuration from `CUDIFY_TRACING_*` environment hints.
    ///
    /// Unknown or empty values are ignored and the preset value is kept.
    pub fn from_env() -> Self {
        let profile = env::var(ENV_PROFILE)
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase();

        let mut config = match profile.as_str() {
            "ci" => Self::for_ci(),
            _ => Self::for_local(),
        };

        if let Ok(directives) = env::var(ENV_DIRECTIVES) {
            if !directives.trim().is_empty() {
                config.directives = Some(directives);
            }
        }

        if let Ok(format) = env::var(ENV_FORMAT) {
            if let Some(parsed) = TracingOutput::from_env_value(&format) {
                config.output = parsed;
                if config.output == TracingOutput::Json {
                    config.ansi = false;
                }
            }
        }

        if let Ok(threshold) = env::var(ENV_PERF_THRESHOLD) {
            if let Ok(threshold_us) = threshold.trim().parse::<u64>() {
                config.performance_threshold_us = Some(threshold_us);
            }
        }

        config
    }

    fn resolve_filter(&self) -> Result<EnvFilter, TracingSetupError> {
        match &self.directives {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))),
        }
    }
}

/// Output format of the formatter layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl TracingOutput {
    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Failure to configure the shared subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    /// The directive string did not parse.
    #[error("invalid tracing directive: {0}")]
    InvalidFilter(String),
    /// A global subscriber is already installed.
    #[error("failed to install global tracing subscriber: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build a subscriber for `config` without installing it.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let filter = config.resolve_filter()?;
    Ok(Registry::default().with(format_layer(config)).with(filter))
}

fn format_layer(config: &TracingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let span_events = config.span_events.clone();
    match config.output {
        TracingOutput::Compact => Box::new(
            tracing_fmt::layer()
                .compact()
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_span_events(span_events),
        ),
        TracingOutput::Pretty => Box::new(
            tracing_fmt::layer()
                .pretty()
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_span_events(span_events),
        ),
        TracingOutput::Json => Box::new(
            tracing_fmt::layer()
                .json()
                .with_target(config.include_targets)
                .with_ansi(false)
                .with_span_events(span_events),
        ),
    }
}

/// Install the configured subscriber as the process-wide default.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    build_subscriber(config)?.try_init()?;
    if !performance::set_default_threshold_us(config.performance_threshold_us) {
        tracing::debug!("performance threshold already fixed, keeping it");
    }
    Ok(())
}

/// Install a subscriber for tests; repeated calls are harmless.
pub fn init_test_tracing() {
    let config = TracingConfig {
        default_directive: "warn".to_string(),
        ansi: false,
        output: TracingOutput::Compact,
        ..TracingConfig::for_local()
    };
    let _ = init_global_tracing(&config);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [ENV_PROFILE, ENV_DIRECTIVES, ENV_FORMAT, ENV_PERF_THRESHOLD, "RUST_LOG"] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn rejects_invalid_directive() {
        clear_env();
        let config = TracingConfig {
            directives: Some("=::invalid".to_string()),
            ..TracingConfig::default()
        };
        assert!(matches!(build_subscriber(&config), Err(TracingSetupError::InvalidFilter(_))));
    }

    #[test]
    #[serial]
    fn builds_every_output_format() {
        clear_env();
        for output in [TracingOutput::Compact, TracingOutput::Pretty, TracingOutput::Json] {
            let config = TracingConfig {
                output,
                ..TracingConfig::default()
            };
            assert!(build_subscriber(&config).is_ok());
        }
    }

    #[test]
    #[serial]
    fn from_env_reads_profile_format_and_threshold() {
        clear_env();
        env::set_var(ENV_PROFILE, "ci");
        env::set_var(ENV_FORMAT, "compact");
        env::set_var(ENV_DIRECTIVES, "cudify_runtime=debug");
        env::set_var(ENV_PERF_THRESHOLD, "250");

        let config = TracingConfig::from_env();
        assert_eq!(config.directives.as_deref(), Some("cudify_runtime=debug"));
        assert_eq!(config.output, TracingOutput::Compact);
        assert!(!config.ansi);
        assert_eq!(config.performance_threshold_us, Some(250));
        clear_env();
    }

    #[test]
    #[serial]
    fn from_env_ignores_unknown_format() {
        clear_env();
        env::set_var(ENV_FORMAT, "xml");
        let config = TracingConfig::from_env();
        assert_eq!(config.output, TracingOutput::Pretty);
        clear_env();
    }
}
