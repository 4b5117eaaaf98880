//! # Streamer Error Handling
//!
//! Error types for the frame hand-off and pipeline lifecycle engine.
//!
//! ## Architecture
//!
//! - **`StreamerError`**: one variant per failure kind, each carrying an [`ErrorContext`]
//! - **`ErrorContext`**: when it happened, what was being done, severity and metadata
//! - **`classify`**: whether an error ends the current run, and logging it at its severity
//!
//! ## Error Kinds
//!
//! | Variant           | Raised by                      | Effect on the run |
//! |-------------------|--------------------------------|-------------------|
//! | `Initialization`  | `Pipeline::init` / `run`       | run never starts  |
//! | `Submit`          | pump forwarding a frame        | forces `Stopping` |
//! | `TransportSend`   | latest-wins publish channel    | counted, ignored  |
//! | `ShutdownTimeout` | `Pipeline::stop`               | surfaced loudly   |
//! | `Validation`      | `Pipeline::feed`, config       | call rejected     |
//! | `State`           | any out-of-order lifecycle call| call rejected     |
//!
//! ## Usage
//!
//! ```rust
//! use rgb_streamer::error::{StreamerError, classify};
//!
//! let error = StreamerError::submit("appsrc returned flushing")
//!     .with_operation("push frame 42");
//! assert!(classify::is_fatal(&error));
//! ```

use std::{error::Error as StdError, fmt, time::SystemTime};

/// Severity levels for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, nothing to act on
    Info,
    /// Something was dropped but streaming continues
    Warning,
    /// The current call or run failed
    Error,
    /// An internal contract was broken
    Critical,
}

/// Metadata about when and where an error occurred
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// When the error occurred
    pub timestamp: SystemTime,
    /// The operation being performed when the error occurred
    pub operation: Option<String>,
    /// Additional context about the error
    pub context: Option<String>,
    /// Error severity level
    pub severity: ErrorSeverity,
    /// Additional metadata as key-value pairs
    pub metadata: std::collections::HashMap<String, String>,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            timestamp: SystemTime::now(),
            operation: None,
            context: None,
            severity: ErrorSeverity::Error,
            metadata: std::collections::HashMap::new(),
        }
    }
}

impl ErrorContext {
    /// Create a new error context
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context with the given severity
    pub fn with_severity(severity: ErrorSeverity) -> Self {
        Self {
            severity,
            ..Self::default()
        }
    }
}

/// Base error type for the streamer library
#[derive(Debug)]
pub enum StreamerError {
    /// The downstream collaborator could not be constructed or opened
    Initialization {
        stage: String,
        reason: String,
        context: ErrorContext,
    },
    /// Downstream rejected a frame
    Submit {
        reason: String,
        context: ErrorContext,
    },
    /// The publish channel could not deliver a message
    TransportSend {
        endpoint: Option<String>,
        reason: String,
        context: ErrorContext,
    },
    /// The pump did not finish within the shutdown grace period
    ShutdownTimeout {
        operation: String,
        duration_ms: u64,
        context: ErrorContext,
    },
    /// Configuration errors
    Config {
        field: String,
        value: String,
        reason: String,
        context: ErrorContext,
    },
    /// Rejected input (frame dimensions, buffer length, ...)
    Validation {
        field: String,
        constraint: String,
        value: String,
        context: ErrorContext,
    },
    /// Invalid lifecycle transition
    State {
        current_state: String,
        attempted_operation: String,
        reason: String,
        context: ErrorContext,
    },
    /// I/O errors
    Io {
        operation: String,
        source: std::io::Error,
        context: ErrorContext,
    },
    /// GStreamer errors, stored as text so the core does not depend on GStreamer
    GStreamer {
        element: Option<String>,
        message: String,
        context: ErrorContext,
    },
}

impl StreamerError {
    /// Create an initialization error
    pub fn initialization(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Initialization {
            stage: stage.into(),
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create a submit error
    pub fn submit(reason: impl Into<String>) -> Self {
        Self::Submit {
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create a non-fatal transport send error
    pub fn transport_send(endpoint: Option<String>, reason: impl Into<String>) -> Self {
        Self::TransportSend {
            endpoint,
            reason: reason.into(),
            context: ErrorContext::with_severity(ErrorSeverity::Warning),
        }
    }

    /// Create a shutdown timeout error
    pub fn shutdown_timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::ShutdownTimeout {
            operation: operation.into(),
            duration_ms,
            context: ErrorContext::with_severity(ErrorSeverity::Critical),
        }
    }

    /// Create a configuration error
    pub fn config(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Config {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create a validation error
    pub fn validation(
        field: impl Into<String>,
        constraint: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::Validation {
            field: field.into(),
            constraint: constraint.into(),
            value: value.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create a state error
    pub fn state(
        current_state: impl Into<String>,
        attempted_operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::State {
            current_state: current_state.into(),
            attempted_operation: attempted_operation.into(),
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
            context: ErrorContext::new(),
        }
    }

    /// Create a GStreamer error
    pub fn gstreamer(element: Option<String>, message: impl Into<String>) -> Self {
        Self::GStreamer {
            element,
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context_mut().context = Some(context.into());
        self
    }

    /// Add operation context
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.context_mut().operation = Some(operation.into());
        self
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context_mut().metadata.insert(key.into(), value.into());
        self
    }

    /// Get the error context
    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Initialization { context, .. } => context,
            Self::Submit { context, .. } => context,
            Self::TransportSend { context, .. } => context,
            Self::ShutdownTimeout { context, .. } => context,
            Self::Config { context, .. } => context,
            Self::Validation { context, .. } => context,
            Self::State { context, .. } => context,
            Self::Io { context, .. } => context,
            Self::GStreamer { context, .. } => context,
        }
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            Self::Initialization { context, .. } => context,
            Self::Submit { context, .. } => context,
            Self::TransportSend { context, .. } => context,
            Self::ShutdownTimeout { context, .. } => context,
            Self::Config { context, .. } => context,
            Self::Validation { context, .. } => context,
            Self::State { context, .. } => context,
            Self::Io { context, .. } => context,
            Self::GStreamer { context, .. } => context,
        }
    }

    /// Get the error category as a string
    pub fn category(&self) -> &'static str {
        match self {
            Self::Initialization { .. } => "initialization",
            Self::Submit { .. } => "submit",
            Self::TransportSend { .. } => "transport_send",
            Self::ShutdownTimeout { .. } => "shutdown_timeout",
            Self::Config { .. } => "config",
            Self::Validation { .. } => "validation",
            Self::State { .. } => "state",
            Self::Io { .. } => "io",
            Self::GStreamer { .. } => "gstreamer",
        }
    }
}

impl fmt::Display for StreamerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamerError::Initialization { stage, reason, .. } => {
                write!(f, "Failed to initialize {}: {}", stage, reason)
            }
            StreamerError::Submit { reason, .. } => {
                write!(f, "Downstream rejected frame: {}", reason)
            }
            StreamerError::TransportSend {
                endpoint, reason, ..
            } => {
                if let Some(endpoint) = endpoint {
                    write!(f, "Publish to {} failed: {}", endpoint, reason)
                } else {
                    write!(f, "Publish failed: {}", reason)
                }
            }
            StreamerError::ShutdownTimeout {
                operation,
                duration_ms,
                ..
            } => {
                write!(
                    f,
                    "Shutdown timed out during {} after {}ms",
                    operation, duration_ms
                )
            }
            StreamerError::Config {
                field,
                value,
                reason,
                ..
            } => {
                write!(
                    f,
                    "Configuration error in '{}': {} (value: {})",
                    field, reason, value
                )
            }
            StreamerError::Validation {
                field,
                constraint,
                value,
                ..
            } => {
                write!(
                    f,
                    "Validation failed for '{}': {} (value: {})",
                    field, constraint, value
                )
            }
            StreamerError::State {
                current_state,
                attempted_operation,
                reason,
                ..
            } => {
                write!(
                    f,
                    "Invalid state transition from '{}' when attempting '{}': {}",
                    current_state, attempted_operation, reason
                )
            }
            StreamerError::Io {
                operation, source, ..
            } => {
                write!(f, "I/O error during {}: {}", operation, source)
            }
            StreamerError::GStreamer {
                element, message, ..
            } => {
                if let Some(element) = element {
                    write!(f, "GStreamer error in element '{}': {}", element, message)
                } else {
                    write!(f, "GStreamer error: {}", message)
                }
            }
        }
    }
}

impl StdError for StreamerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type alias using our custom error type
pub type StreamerResult<T> = Result<T, StreamerError>;

/// Trait for errors with severity levels
pub trait HasSeverity {
    /// Get the severity level of this error
    fn severity(&self) -> ErrorSeverity;
}

impl HasSeverity for StreamerError {
    fn severity(&self) -> ErrorSeverity {
        self.context().severity
    }
}

/// Error classification utilities
pub mod classify {
    use super::*;

    /// Whether the error ends the current run.
    ///
    /// Publish failures never do: a slow or missing subscriber must not stall
    /// frame production.
    pub fn is_fatal(error: &StreamerError) -> bool {
        !matches!(error, StreamerError::TransportSend { .. })
    }

    /// Log `error` at the level its severity calls for.
    pub fn report(error: &StreamerError) {
        let operation = error.context().operation.as_deref().unwrap_or("streaming");
        match error.severity() {
            ErrorSeverity::Info => log::info!("{}: {}", operation, error),
            ErrorSeverity::Warning => log::warn!("{}: {}", operation, error),
            ErrorSeverity::Error | ErrorSeverity::Critical => {
                log::error!("{}: {}", operation, error)
            }
        }
    }
}

impl From<std::io::Error> for StreamerError {
    fn from(error: std::io::Error) -> Self {
        Self::io("unknown", error)
    }
}

#[cfg(feature = "gstreamer")]
impl From<gstreamer::glib::Error> for StreamerError {
    fn from(error: gstreamer::glib::Error) -> Self {
        Self::gstreamer(None, error.to_string())
    }
}

#[cfg(feature = "gstreamer")]
impl From<gstreamer::glib::BoolError> for StreamerError {
    fn from(error: gstreamer::glib::BoolError) -> Self {
        Self::gstreamer(None, error.to_string())
    }
}
