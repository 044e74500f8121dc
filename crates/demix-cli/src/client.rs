//! Error type and exit-code mapping shared by command handlers.

use std::fmt::{self, Display, Formatter};

use demix_app::{AppError, CacheError, JobError, describe};
use demix_telemetry::TelemetryError;

/// CLI-level error type to distinguish validation from operational failures.
#[derive(Debug)]
pub(crate) enum CliError {
    Validation(String),
    Failure(anyhow::Error),
}

/// Convenience alias for functions returning a `CliError`.
pub(crate) type CliResult<T> = Result<T, CliError>;

impl CliError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn failure(error: impl Into<anyhow::Error>) -> Self {
        Self::Failure(error.into())
    }

    pub(crate) const fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => 2,
            Self::Failure(_) => 3,
        }
    }

    pub(crate) fn display_message(&self) -> String {
        match self {
            Self::Validation(message) => message.clone(),
            Self::Failure(error) => format!("{error:#}"),
        }
    }
}

impl Display for CliError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str("cli error")
    }
}

impl std::error::Error for CliError {}

impl From<JobError> for CliError {
    fn from(err: JobError) -> Self {
        if err.is_caller_error() {
            let subject = err
                .job_id()
                .map_or_else(String::new, |id| format!("job {id}: "));
            Self::Validation(format!("{subject}{}", caller_message(&err)))
        } else if let JobError::EngineFailure { source, .. } = &err {
            Self::Failure(anyhow::anyhow!(
                "{}: {}",
                describe(&err),
                source.diagnostics()
            ))
        } else {
            Self::Failure(anyhow::Error::new(err))
        }
    }
}

fn caller_message(err: &JobError) -> String {
    match err {
        JobError::InvalidInput {
            field,
            reason,
            value: Some(value),
            ..
        } => format!("{err} ({field}: {reason}, got {value:?})"),
        JobError::InvalidInput { field, reason, .. } => format!("{err} ({field}: {reason})"),
        JobError::InvalidTransition {
            operation, status, ..
        } => format!("{err} ({operation} while {status})"),
        JobError::OutputsInUse { leases, .. } => format!("{err} ({leases} open)"),
        _ => describe(err),
    }
}

impl From<AppError> for CliError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Config { .. }
            | AppError::Telemetry {
                source: TelemetryError::LogFilter { .. },
                ..
            } => Self::Validation(describe(&err)),
            other => Self::Failure(anyhow::Error::new(other)),
        }
    }
}

impl From<CacheError> for CliError {
    fn from(err: CacheError) -> Self {
        Self::Failure(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use demix_app::load_config;
    use std::path::PathBuf;

    #[test]
    fn caller_errors_exit_with_validation_code() {
        let err = CliError::from(JobError::UnknownJob {
            job_id: "00000000000000aa".into(),
        });
        assert_eq!(err.exit_code(), 2);
        assert!(err.display_message().starts_with("job 00000000000000aa: "));
    }

    #[test]
    fn rejected_input_names_the_field() {
        let err = CliError::from(JobError::InvalidInput {
            job_id: None,
            stage: "validate",
            field: "filename",
            reason: "unsupported_extension",
            value: Some("notes.txt".into()),
        });
        assert_eq!(
            err.display_message(),
            "input rejected (filename: unsupported_extension, got \"notes.txt\")"
        );
    }

    #[test]
    fn system_errors_exit_with_failure_code() {
        let err = CliError::from(JobError::Io {
            job_id: None,
            stage: "reap",
            path: None,
            source: std::io::Error::other("disk gone"),
        });
        assert_eq!(err.exit_code(), 3);
        assert!(err.display_message().contains("disk gone"));
    }

    #[test]
    fn config_errors_are_validation_errors() {
        let err = load_config(Some(PathBuf::from("/no/such/demix.yaml")))
            .err()
            .map(CliError::from);
        assert!(matches!(err, Some(CliError::Validation(_))));
    }

    #[test]
    fn bad_log_filters_are_validation_errors() {
        let err = demix_app::init_telemetry(&demix_config::TelemetryConfig {
            log_level: "demix=deafening".into(),
            ..demix_config::TelemetryConfig::default()
        })
        .err()
        .map(CliError::from);
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(matches!(err, Some(CliError::Validation(_))));
        }
    }
}
