//! Component-tagged `tracing` macros and subscriber setup.
//!
//! Every event carries a `component` field so one daemon's output can be
//! filtered per subsystem:
//!
//! ```ignore
//! use fdist_config::{log_server_info, log_maint_warn};
//!
//! log_server_info!("Serving file", reference = "3f1c9a27b0e4d6c2");
//! log_maint_warn!("Delete failed", error = %e);
//! ```

/// Values of the `component` field.
pub struct Component;

impl Component {
    pub const SERVER: &'static str = "SERVER";
    pub const NOTIFY: &'static str = "NOTIFY";
    pub const MAINT: &'static str = "MAINT";
    pub const REGISTRY: &'static str = "REGISTRY";
}

/// Verbosity selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Map a `-v` count to a level (0 = info).
    pub fn from_verbosity(verbose: u8) -> Self {
        match verbose {
            0 => LogLevel::Info,
            1 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

// === SERVER logging macros ===

#[macro_export]
macro_rules! log_server_error {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::error!(component = $crate::logging::Component::SERVER, $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_server_warn {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::warn!(component = $crate::logging::Component::SERVER, $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_server_info {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::info!(component = $crate::logging::Component::SERVER, $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_server_debug {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::debug!(component = $crate::logging::Component::SERVER, $($($field)+,)? $msg)
    };
}

// === NOTIFY logging macros ===

#[macro_export]
macro_rules! log_notify_warn {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::warn!(component = $crate::logging::Component::NOTIFY, $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_notify_debug {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::debug!(component = $crate::logging::Component::NOTIFY, $($($field)+,)? $msg)
    };
}

// === MAINT logging macros ===

#[macro_export]
macro_rules! log_maint_warn {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::warn!(component = $crate::logging::Component::MAINT, $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_maint_info {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::info!(component = $crate::logging::Component::MAINT, $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_maint_debug {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::debug!(component = $crate::logging::Component::MAINT, $($($field)+,)? $msg)
    };
}

// === REGISTRY logging macros ===

#[macro_export]
macro_rules! log_registry_info {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::info!(component = $crate::logging::Component::REGISTRY, $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_registry_debug {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::debug!(component = $crate::logging::Component::REGISTRY, $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_registry_warn {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::warn!(component = $crate::logging::Component::REGISTRY, $($($field)+,)? $msg)
    };
}

/// Install the global subscriber writing to stderr.
///
/// `RUST_LOG` wins over `level` when set. Calling this twice keeps the first
/// subscriber.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let default_directive = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
