//! Spans for one front-end invocation and for individual jobs.

use tracing::field::{Empty, display};
use tracing::span::EnteredSpan;
use tracing::{Span, info_span};

use crate::init::build_sha;

/// Keeps the invocation span entered until dropped.
///
/// Every event logged while the guard lives carries the front end, the build SHA
/// and, once recorded, the command being run.
#[derive(Debug)]
pub struct InvocationGuard {
    span: EnteredSpan,
}

impl InvocationGuard {
    /// Enter the invocation span for `front_end` (for example `cli`).
    #[must_use]
    pub fn enter(front_end: &'static str) -> Self {
        let span = info_span!(
            "demix",
            front_end,
            command = Empty,
            build_sha = %build_sha()
        );
        Self {
            span: span.entered(),
        }
    }

    /// Record the command this invocation runs.
    pub fn record_command(&self, command: &str) {
        self.span.record("command", display(command));
    }
}

/// Span wrapping all work performed for one job. `status` is recorded when the job
/// settles.
#[must_use]
pub fn job_span(job_id: &str, model: &str) -> Span {
    info_span!("job", job_id = %job_id, model = %model, status = Empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_guard_records_the_command() {
        let guard = InvocationGuard::enter("test");
        guard.record_command("separate");
        drop(guard);
    }

    #[test]
    fn job_span_accepts_status_updates() {
        let span = job_span("00000000deadbeef", "mdx_extra");
        span.record("status", display("running"));
        let _entered = span.enter();
    }
}
