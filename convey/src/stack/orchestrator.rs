//! Drives a single stack deployment: describe, create/update, watch for rollback
//! and publish outputs.

use std::collections::HashSet;

use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancellationToken;
use crate::core::context::DeploymentContext;
use crate::core::error_code::ErrorCode;
use crate::core::stack::{EventFilter, StackDescription, StackEvent, StackRef, StackStatus};
use crate::stack::client::{CloudError, CloudErrorKind, StackClientFactory, StackDeployment};
use crate::stack::errors::StackError;
use crate::stack::poll::StackPoller;

/// Name of the output variable holding a stack output value.
pub fn output_variable_name(key: &str) -> String {
    format!("AwsOutputs[{key}]")
}

/// Codes already shown to the user by one orchestrator.
#[derive(Debug, Default)]
pub struct WarningLedger {
    shown: HashSet<ErrorCode>,
}

impl WarningLedger {
    /// True the first time `code` is recorded.
    pub fn record(&mut self, code: ErrorCode) -> bool {
        self.shown.insert(code)
    }

    pub fn contains(&self, code: ErrorCode) -> bool {
        self.shown.contains(&code)
    }
}

/// What `deploy` did to the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployAction {
    Created { stack_id: String },
    /// The previous stack was stuck in `ROLLBACK_COMPLETE` and was replaced.
    Recreated { stack_id: String },
    Updated { stack_id: String },
    /// Nothing to change; no stack events will follow.
    Unchanged,
}

impl DeployAction {
    /// Whether the provider started an operation worth waiting for.
    pub fn started_operation(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

pub struct StackOrchestrator {
    ledger: WarningLedger,
}

impl StackOrchestrator {
    pub fn new(ledger: WarningLedger) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &WarningLedger {
        &self.ledger
    }

    /// Log `message` once per code. Returns whether it was shown.
    pub fn display_warning(&mut self, code: ErrorCode, message: &str) -> bool {
        if self.ledger.record(code) {
            warn!(code = %code, help = %code.help_url(), "{message}");
            true
        } else {
            debug!(code = %code, "warning already shown");
            false
        }
    }

    /// Run `op`, reporting a provider error as a warning before handing it back.
    pub fn with_cloud_exception_handling<T>(
        &mut self,
        op: impl FnOnce() -> Result<T, CloudError>,
    ) -> Result<T, CloudError> {
        op().inspect_err(|err| self.warn_cloud_error(err))
    }

    fn warn_cloud_error(&mut self, err: &CloudError) {
        let mut message = format!("AWS returned an error: {err}");
        if let Some(detail) = &err.detail {
            message.push_str(&format!(" ({detail})"));
        }
        self.display_warning(ErrorCode::SERVICE_ERROR, &message);
    }

    /// Describe `stack`. `Ok(None)` when it does not exist.
    #[instrument(skip_all, fields(stack = %stack))]
    pub fn query_stack<F: StackClientFactory + ?Sized>(
        &mut self,
        factory: &F,
        stack: &StackRef,
    ) -> Result<Option<StackDescription>, StackError> {
        match factory.client().and_then(|client| client.describe_stack(stack)) {
            Ok(description) => Ok(Some(description)),
            Err(err) if err.is_not_found() => {
                debug!("stack does not exist");
                Ok(None)
            }
            Err(err) if err.is_access_denied() => Err(StackError::permission(
                ErrorCode::DESCRIBE_STACK_DENIED,
                format!("the AWS account lacks permission to describe stack {stack}"),
                err,
            )),
            Err(err) => {
                self.warn_cloud_error(&err);
                Err(StackError::unknown(
                    ErrorCode::DESCRIBE_STACK_FAILED,
                    format!("unexpected error describing stack {stack}"),
                    err,
                ))
            }
        }
    }

    /// Build a watcher that turns rollback events into failures.
    pub fn rollback_watcher<'a, F: StackClientFactory + ?Sized>(
        &'a mut self,
        factory: &'a F,
        stack: &StackRef,
        expect_success: bool,
        missing_is_failure: bool,
        filter: EventFilter,
    ) -> RollbackWatcher<'a, F> {
        RollbackWatcher {
            orchestrator: self,
            factory,
            stack: stack.clone(),
            expect_success,
            missing_is_failure,
            filter,
        }
    }

    /// Write `AwsOutputs[name]`. A missing value is stored as an empty string.
    pub fn set_output_variable(&self, ctx: &mut DeploymentContext, name: &str, value: Option<&str>) {
        let variable = output_variable_name(name);
        ctx.variables.set(&variable, value.unwrap_or_default());
        info!(
            "saved output variable Convey.Action[{}].Output.{variable}",
            ctx.action_name()
        );
    }

    /// Publish every stack output plus `StackId`. Returns the number of outputs set.
    #[instrument(skip_all, fields(stack = %stack))]
    pub fn read_outputs<F: StackClientFactory + ?Sized>(
        &mut self,
        factory: &F,
        stack: &StackRef,
        ctx: &mut DeploymentContext,
    ) -> Result<usize, StackError> {
        let description = match self.query_stack(factory, stack) {
            Ok(Some(description)) => description,
            Ok(None) => {
                warn!("stack no longer exists, no outputs to read");
                return Ok(0);
            }
            Err(StackError::Permission { source, .. }) => {
                // The deployment itself went through; only the outputs are lost.
                self.display_warning(
                    ErrorCode::DESCRIBE_STACK_DENIED,
                    &format!("outputs unavailable for stack {stack}: {source}"),
                );
                return Ok(0);
            }
            Err(err) => return Err(err),
        };

        for output in &description.outputs {
            self.set_output_variable(ctx, &output.key, output.value.as_deref());
        }
        self.set_output_variable(ctx, "StackId", Some(&description.stack_id));
        Ok(description.outputs.len())
    }

    /// Create, replace or update the stack so it matches `deployment`.
    ///
    /// A stack left in `ROLLBACK_COMPLETE` cannot be updated, so it is deleted
    /// and created again; `poller` waits for the deletion to finish.
    #[instrument(skip_all, fields(stack = %deployment.stack))]
    pub fn deploy<F: StackClientFactory + ?Sized>(
        &mut self,
        factory: &F,
        deployment: &StackDeployment,
        poller: &StackPoller,
        cancel: &CancellationToken,
    ) -> Result<DeployAction, StackError> {
        let stack = &deployment.stack;
        match self.query_stack(factory, stack)? {
            None => {
                info!("creating stack");
                let stack_id = self.modify(stack, "create", || {
                    factory.client()?.create_stack(deployment)
                })?;
                Ok(DeployAction::Created { stack_id })
            }
            Some(existing) if existing.status.as_str() == StackStatus::ROLLBACK_COMPLETE => {
                info!(
                    status = %existing.status,
                    "stack failed its first creation, deleting before creating again"
                );
                self.modify(stack, "delete", || factory.client()?.delete_stack(stack))?;
                poller.wait_for_deletion(self, factory, stack, cancel)?;
                let stack_id = self.modify(stack, "create", || {
                    factory.client()?.create_stack(deployment)
                })?;
                Ok(DeployAction::Recreated { stack_id })
            }
            Some(existing) => {
                info!(status = %existing.status, "updating stack");
                match factory
                    .client()
                    .and_then(|client| client.update_stack(deployment))
                {
                    Ok(stack_id) => Ok(DeployAction::Updated { stack_id }),
                    Err(err) if err.kind == CloudErrorKind::NoUpdates => {
                        info!("no updates are to be performed");
                        Ok(DeployAction::Unchanged)
                    }
                    Err(err) => {
                        self.warn_cloud_error(&err);
                        Err(modify_error(stack, "update", err))
                    }
                }
            }
        }
    }

    fn modify<T>(
        &mut self,
        stack: &StackRef,
        verb: &str,
        op: impl FnOnce() -> Result<T, CloudError>,
    ) -> Result<T, StackError> {
        self.with_cloud_exception_handling(op)
            .map_err(|err| modify_error(stack, verb, err))
    }
}

impl Default for StackOrchestrator {
    fn default() -> Self {
        Self::new(WarningLedger::default())
    }
}

fn modify_error(stack: &StackRef, verb: &str, err: CloudError) -> StackError {
    if err.is_access_denied() {
        StackError::permission(
            ErrorCode::MODIFY_STACK_DENIED,
            format!("the AWS account lacks permission to {verb} stack {stack}"),
            err,
        )
    } else {
        StackError::unknown(
            ErrorCode::MODIFY_STACK_FAILED,
            format!("unexpected error trying to {verb} stack {stack}"),
            err,
        )
    }
}

/// Checks stack events for rollbacks on behalf of one orchestrator.
pub struct RollbackWatcher<'a, F: StackClientFactory + ?Sized> {
    orchestrator: &'a mut StackOrchestrator,
    factory: &'a F,
    stack: StackRef,
    expect_success: bool,
    missing_is_failure: bool,
    filter: EventFilter,
}

impl<F: StackClientFactory + ?Sized> RollbackWatcher<'_, F> {
    pub fn stack(&self) -> &StackRef {
        &self.stack
    }

    /// Newest event accepted by this watcher's filter.
    pub fn latest_event(&mut self) -> Result<Option<StackEvent>, StackError> {
        let factory = self.factory;
        let stack = &self.stack;
        let filter = &self.filter;
        self.orchestrator
            .with_cloud_exception_handling(|| factory.client()?.last_stack_event(stack, filter))
            .map_err(|err| {
                if err.is_access_denied() {
                    StackError::permission(
                        ErrorCode::DESCRIBE_EVENTS_DENIED,
                        format!(
                            "the AWS account lacks permission to describe events of stack {stack}"
                        ),
                        err,
                    )
                } else {
                    StackError::unknown(
                        ErrorCode::DESCRIBE_STACK_FAILED,
                        format!("unexpected error reading events of stack {stack}"),
                        err,
                    )
                }
            })
    }

    /// Inspect one event (or its absence).
    ///
    /// A missing event fails only when `missing_is_failure` is set. A rollback
    /// event accepted by the filter fails only when `expect_success` is set.
    pub fn observe(&mut self, event: Option<&StackEvent>) -> Result<(), StackError> {
        let Some(event) = event else {
            info!(stack = %self.stack, "no stack events found");
            if self.missing_is_failure {
                return Err(StackError::MissingEvent {
                    stack: self.stack.clone(),
                });
            }
            return Ok(());
        };

        info!(stack = %self.stack, "{event}");
        if !self.filter.matches(event) || !event.status.is_rollback() {
            return Ok(());
        }

        let failed = self.failed_event_before(event)?;
        if let Some(failed) = &failed {
            warn!(stack = %self.stack, "first failure: {failed}");
        }
        if !self.expect_success {
            debug!(status = %event.status, "rollback was expected");
            return Ok(());
        }
        Err(StackError::RolledBack {
            stack: self.stack.clone(),
            status: event.status.clone(),
            resource_type: event.resource_type.clone(),
            reason: event.reason.clone(),
            failed_reason: failed.and_then(|f| f.reason),
        })
    }

    /// Most recent failed event at or before `trigger`, for diagnostics.
    fn failed_event_before(
        &mut self,
        trigger: &StackEvent,
    ) -> Result<Option<StackEvent>, StackError> {
        let factory = self.factory;
        let stack = &self.stack;
        let events = match self
            .orchestrator
            .with_cloud_exception_handling(|| factory.client()?.recent_stack_events(stack))
        {
            Ok(events) => events,
            Err(err) if err.is_access_denied() => {
                self.orchestrator.display_warning(
                    ErrorCode::DESCRIBE_EVENTS_DENIED,
                    &format!(
                        "the AWS account lacks permission to describe events of stack {stack}; the failure cause is unavailable"
                    ),
                );
                return Ok(None);
            }
            Err(err) => {
                return Err(StackError::unknown(
                    ErrorCode::DESCRIBE_STACK_FAILED,
                    format!("unexpected error reading events of stack {stack}"),
                    err,
                ));
            }
        };
        Ok(events.into_iter().find(|e| {
            e.event_id != trigger.event_id
                && e.timestamp <= trigger.timestamp
                && e.status.is_failed()
        }))
    }
}
