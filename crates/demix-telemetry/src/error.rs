//! Telemetry error types.

use std::string::FromUtf8Error;

use thiserror::Error;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;

/// Result alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Errors raised while setting up logging or exporting metrics.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The configured log level is not a valid filter directive.
    #[error("invalid log filter")]
    LogFilter {
        /// Directive as configured.
        directive: String,
        /// Parser error.
        source: ParseError,
    },
    /// Another global subscriber was installed first.
    #[error("failed to install tracing subscriber")]
    SubscriberInstall {
        /// Underlying tracing subscriber error.
        #[from]
        source: TryInitError,
    },
    /// A job or cache metric could not be built or registered.
    #[error("failed to set up metric")]
    Metric {
        /// Metric name.
        name: &'static str,
        /// `build` or `register`.
        action: &'static str,
        /// Underlying Prometheus error.
        source: prometheus::Error,
    },
    /// Gathered metrics could not be rendered in the text exposition format.
    #[error("failed to render metrics")]
    Render {
        /// Underlying Prometheus error.
        source: prometheus::Error,
    },
    /// The text encoder produced bytes that are not UTF-8.
    #[error("rendered metrics were not valid utf-8")]
    RenderEncoding {
        /// Conversion error.
        #[from]
        source: FromUtf8Error,
    },
}

impl TelemetryError {
    pub(crate) const fn metric(
        name: &'static str,
        action: &'static str,
        source: prometheus::Error,
    ) -> Self {
        Self::Metric {
            name,
            action,
            source,
        }
    }
}
