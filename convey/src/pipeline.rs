//! Runs install conventions in order against one deployment context.

use anyhow::Result;
use thiserror::Error;
use tracing::{error, info, info_span};

use crate::core::cancel::CancellationToken;
use crate::core::context::DeploymentContext;

/// One install step.
///
/// Conventions receive the shared context by `&mut` and may read and write
/// variables. Returning an error stops the pipeline.
pub trait Convention {
    fn name(&self) -> &str;
    fn install(&self, ctx: &mut DeploymentContext) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("deployment cancelled before step {next}")]
    Cancelled { next: String },
}

/// Summary of a successful pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    /// Names of the steps that ran, in order.
    pub completed: Vec<String>,
}

/// Run `conventions` in list order, stopping at the first failure.
///
/// The failing step's message and full error chain are recorded on the context
/// before the error is returned unchanged, so callers can still `downcast_ref`
/// it. Earlier steps are not undone.
pub fn run_conventions<'c>(
    ctx: &mut DeploymentContext,
    conventions: &[Box<dyn Convention + 'c>],
    cancel: &CancellationToken,
) -> Result<PipelineOutcome> {
    let mut completed = Vec::with_capacity(conventions.len());
    for (index, convention) in conventions.iter().enumerate() {
        let name = convention.name();
        if cancel.is_cancelled() {
            let err = anyhow::Error::new(PipelineError::Cancelled {
                next: name.to_string(),
            });
            record_failure(ctx, name, &err);
            return Err(err);
        }

        let span = info_span!("convention", step = index + 1, name);
        let _guard = span.enter();
        info!("running");
        if let Err(err) = convention.install(ctx) {
            record_failure(ctx, name, &err);
            return Err(err);
        }
        completed.push(name.to_string());
    }
    info!(steps = completed.len(), "all conventions completed");
    Ok(PipelineOutcome { completed })
}

fn record_failure(ctx: &mut DeploymentContext, name: &str, err: &anyhow::Error) {
    error!(step = name, "{err:#}");
    ctx.record_error(err.to_string(), format!("{err:?}"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::variables::Variables;
    use crate::test_support::{FailingConvention, RecordingConvention, StepLog};

    fn context() -> DeploymentContext {
        DeploymentContext::new("pkg.zip", Variables::new())
    }

    #[test]
    fn runs_every_step_in_order() {
        let log = StepLog::default();
        let steps: Vec<Box<dyn Convention>> = vec![
            Box::new(RecordingConvention::new("extract", &log)),
            Box::new(RecordingConvention::new("configure", &log)),
        ];
        let mut ctx = context();

        let outcome = run_conventions(&mut ctx, &steps, &CancellationToken::new()).expect("run");
        assert_eq!(outcome.completed, vec!["extract", "configure"]);
        assert_eq!(log.names(), vec!["extract", "configure"]);
        assert_eq!(ctx.last_error(), None);
    }

    #[test]
    fn failure_stops_pipeline_and_records_error() {
        let log = StepLog::default();
        let steps: Vec<Box<dyn Convention>> = vec![
            Box::new(RecordingConvention::new("one", &log)),
            Box::new(FailingConvention::new("two", "disk full")),
            Box::new(RecordingConvention::new("three", &log)),
        ];
        let mut ctx = context();

        let err = run_conventions(&mut ctx, &steps, &CancellationToken::new()).expect_err("fails");
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(log.names(), vec!["one"]);
        assert_eq!(ctx.last_error(), Some("disk full"));
        assert!(ctx.last_error_detail().is_some_and(|d| d.contains("disk full")));
    }

    #[test]
    fn cancellation_stops_before_next_step() {
        let log = StepLog::default();
        let steps: Vec<Box<dyn Convention>> = vec![Box::new(RecordingConvention::new("one", &log))];
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut ctx = context();

        let err = run_conventions(&mut ctx, &steps, &cancel).expect_err("cancelled");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Cancelled { next }) if next == "one"
        ));
        assert!(log.names().is_empty());
        assert!(ctx.last_error().is_some());
    }

    #[test]
    fn steps_share_variables() {
        struct Writer;
        impl Convention for Writer {
            fn name(&self) -> &str {
                "writer"
            }
            fn install(&self, ctx: &mut DeploymentContext) -> Result<()> {
                ctx.variables.set("Shared", "yes");
                Ok(())
            }
        }
        struct Reader;
        impl Convention for Reader {
            fn name(&self) -> &str {
                "reader"
            }
            fn install(&self, ctx: &mut DeploymentContext) -> Result<()> {
                anyhow::ensure!(ctx.variables.get("shared") == Some("yes"), "missing");
                Ok(())
            }
        }

        let steps: Vec<Box<dyn Convention>> = vec![Box::new(Writer), Box::new(Reader)];
        let mut ctx = context();
        run_conventions(&mut ctx, &steps, &CancellationToken::new()).expect("run");
    }
}
