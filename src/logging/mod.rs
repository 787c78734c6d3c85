//! Logging infrastructure - structured tracing across the boundary
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - One target per component (`handles`, `ownership`, `refcount`, `frame`,
//!   `dispatch`, `bridge`) so filters can isolate a layer
//! - Zero-cost when disabled
//! - Guard-based performance tracking
//! - Console output (compact or JSON) plus an optional non-blocking file writer

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

pub use tracing::{debug, error, info, trace, warn, Level};

use crate::foreign::MethodKey;
use crate::frame::CallError;
use crate::handle::{Handle, ResourceKind};
use crate::ownership::ScopeId;


/// Event targets, one per component
pub const TARGETS: [&str; 6] = ["handles", "ownership", "refcount", "frame", "dispatch", "bridge"];

static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Keeps the file writer's worker alive until [`flush`]
static FILE_GUARD: Mutex<Option<WorkerGuard>> = parking_lot::const_mutex(None);

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Enable file logging
    pub file_output: bool,
    /// Log file path (if file_output enabled)
    pub log_path: Option<String>,
    /// JSON lines instead of compact text
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
    /// Enable performance tracking
    pub track_performance: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_output: false,
            log_path: None,
            json_format: false,
            show_spans: false,
            track_performance: cfg!(debug_assertions),
        }
    }
}

/// Parse a level name; unknown names fall back to `INFO`.
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Apply `TETHER_LOG_*` overrides on top of `self`
    pub fn with_env(mut self) -> Self {
        // TETHER_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level) = std::env::var("TETHER_LOG_LEVEL") {
            self.level = parse_level(&level);
        }

        // TETHER_LOG_FILE: path to log file
        if let Ok(path) = std::env::var("TETHER_LOG_FILE") {
            self.file_output = true;
            self.log_path = Some(path);
        }

        if std::env::var("TETHER_LOG_JSON").is_ok() {
            self.json_format = true;
        }
        if std::env::var("TETHER_LOG_SPANS").is_ok() {
            self.show_spans = true;
        }

        // TETHER_LOG_PERF: enable performance tracking
        if let Ok(val) = std::env::var("TETHER_LOG_PERF") {
            self.track_performance = val == "1" || val.eq_ignore_ascii_case("true");
        }

        self
    }

    /// Create high-performance config (minimal logging)
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            file_output: false,
            log_path: None,
            json_format: false,
            show_spans: false,
            track_performance: false,
        }
    }

    /// Create debug config (verbose logging)
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            file_output: true,
            log_path: Some("tether.log".to_string()),
            json_format: false,
            show_spans: true,
            track_performance: true,
        }
    }
}

/// Initialize logging with configuration from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration.
///
/// Only the first call installs a subscriber. If the host application already
/// installed a global subscriber, that one is kept.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives(config.level)));

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let compact = (!config.json_format).then(|| {
            fmt::layer()
                .with_writer(io::stderr)
                .compact()
                .with_span_events(span_events.clone())
                .with_target(true)
                .with_thread_ids(cfg!(debug_assertions))
        });

        let json = config.json_format.then(|| {
            fmt::layer()
                .with_writer(io::stderr)
                .json()
                .with_span_events(span_events.clone())
        });

        let file = match (config.file_output, config.log_path.as_deref()) {
            (true, Some(path)) => match file_appender(path) {
                Ok(appender) => {
                    let (writer, guard) = tracing_appender::non_blocking(appender);
                    *FILE_GUARD.lock() = Some(guard);
                    Some(
                        fmt::layer()
                            .with_writer(writer)
                            .with_ansi(false)
                            .with_span_events(span_events)
                            .with_target(true),
                    )
                }
                Err(err) => {
                    eprintln!("tether: log file {} unavailable: {}", path, err);
                    None
                }
            },
            _ => None,
        };

        let installed = tracing_subscriber::registry()
            .with(env_filter)
            .with(compact)
            .with(json)
            .with(file)
            .try_init();

        if installed.is_err() {
            debug!(target: "bridge", "global subscriber already set, keeping it");
        }
    });
}

/// `target=level` for every component target and the crate itself
fn default_directives(level: Level) -> String {
    let level = level.as_str().to_lowercase();
    TARGETS
        .iter()
        .chain(std::iter::once(&"tether"))
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",")
}

fn file_appender(
    path: &str,
) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    let path = Path::new(path);
    let directory = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("tether.log");

    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(directory)
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

/// Flush and stop the file writer, if one is running
pub fn flush() {
    FILE_GUARD.lock().take();
}

// ============================================================================
// Boundary events
// ============================================================================

/// Log a handle entering a lifetime scope
#[inline]
pub fn log_adopt(handle: Handle, kind: ResourceKind, scope: ScopeId) {
    trace!(
        target: "ownership",
        event = "adopt",
        ?handle,
        ?kind,
        %scope,
        "handle adopted"
    );
}

/// Log a handle leaving its scope
#[inline]
pub fn log_release(handle: Handle, kind: ResourceKind, freed: bool) {
    trace!(
        target: "ownership",
        event = "release",
        ?handle,
        ?kind,
        freed,
        "handle released"
    );
}

/// Log a rejected stale handle
pub fn log_stale(handle: Handle, operation: &str) {
    warn!(
        target: "handles",
        event = "stale_handle",
        ?handle,
        operation,
        "stale handle rejected"
    );
}

/// Log a foreign call about to run
#[inline]
pub fn log_dispatch(method: &MethodKey, args: usize) {
    trace!(
        target: "dispatch",
        event = "dispatch",
        %method,
        args,
        "dispatching foreign call"
    );
}

/// Log a foreign-reported call failure
pub fn log_call_error(method: &MethodKey, error: &CallError) {
    debug!(
        target: "dispatch",
        event = "call_error",
        %method,
        kind = ?error.error,
        argument = error.argument,
        expected = error.expected,
        "foreign call reported failure"
    );
}

/// Log a scope torn down with outstanding handles
pub fn log_frame_leak(scope: ScopeId, outstanding: usize, reclaimed: bool) {
    warn!(
        target: "ownership",
        event = "frame_leak",
        %scope,
        outstanding,
        reclaimed,
        "scope torn down with outstanding handles"
    );
}

/// Log a foreign refcount change
#[inline]
pub fn log_refcount(object: u64, transition: &str, count: i64) {
    trace!(
        target: "refcount",
        event = "refcount",
        object,
        transition,
        count,
        "foreign refcount changed"
    );
}

/// Log a refcount underflow (the bridge is poisoned afterwards)
pub fn log_underflow(object: u64, count: i64) {
    error!(
        target: "refcount",
        event = "refcount_underflow",
        object,
        count,
        "foreign refcount underflow, refcount bridge poisoned"
    );
}

/// Performance tracking utilities
pub mod perf {
    use std::time::Instant;
    use tracing::debug;

    /// Track operation duration (returns guard that logs on drop)
    #[must_use]
    pub fn track(operation: &'static str) -> PerformanceGuard {
        PerformanceGuard {
            operation,
            start: Instant::now(),
        }
    }

    pub struct PerformanceGuard {
        operation: &'static str,
        start: Instant,
    }

    impl Drop for PerformanceGuard {
        fn drop(&mut self) {
            debug!(
                target: "bridge",
                operation = self.operation,
                duration_us = self.start.elapsed().as_micros() as u64,
                "operation completed"
            );
        }
    }
}
