//! Waits for an in-flight stack operation to settle.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument};

use crate::core::cancel::CancellationToken;
use crate::core::error_code::ErrorCode;
use crate::core::stack::{StackEvent, StackRef, StackStatus};
use crate::stack::client::{CloudError, StackClientFactory};
use crate::stack::errors::StackError;
use crate::stack::orchestrator::{RollbackWatcher, StackOrchestrator};

/// Longest single sleep, so cancellation is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackPoller {
    pub interval: Duration,
    pub timeout: Duration,
}

impl StackPoller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Feed the newest event to `watcher` every interval until the stack itself
    /// reports a terminal status. Returns that final event.
    #[instrument(skip_all, fields(stack = %watcher.stack()))]
    pub fn wait<F: StackClientFactory + ?Sized>(
        &self,
        watcher: &mut RollbackWatcher<'_, F>,
        cancel: &CancellationToken,
    ) -> Result<StackEvent, StackError> {
        let started = Instant::now();
        let mut ticks = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(StackError::Cancelled {
                    stack: watcher.stack().clone(),
                });
            }
            ticks += 1;
            let event = watcher.latest_event()?;
            watcher.observe(event.as_ref())?;
            if let Some(event) = event {
                if watcher.stack().is_root_event(&event) && event.status.is_terminal() {
                    info!(status = %event.status, ticks, "stack operation finished");
                    return Ok(event);
                }
            }
            self.pause(started, watcher.stack(), cancel)?;
        }
    }

    /// Poll until the stack is gone after a delete request.
    #[instrument(skip_all, fields(stack = %stack))]
    pub fn wait_for_deletion<F: StackClientFactory + ?Sized>(
        &self,
        orchestrator: &mut StackOrchestrator,
        factory: &F,
        stack: &StackRef,
        cancel: &CancellationToken,
    ) -> Result<(), StackError> {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(StackError::Cancelled {
                    stack: stack.clone(),
                });
            }
            match orchestrator.query_stack(factory, stack)? {
                None => return Ok(()),
                Some(description) => match description.status.as_str() {
                    StackStatus::DELETE_COMPLETE => return Ok(()),
                    StackStatus::DELETE_FAILED => {
                        let reason = description
                            .status_reason
                            .unwrap_or_else(|| "no reason given".to_string());
                        return Err(StackError::unknown(
                            ErrorCode::MODIFY_STACK_FAILED,
                            format!("stack {stack} could not be deleted"),
                            CloudError::other(reason),
                        ));
                    }
                    status => debug!(status, "waiting for deletion"),
                },
            }
            self.pause(started, stack, cancel)?;
        }
    }

    /// Sleep one interval, failing once the overall timeout would be exceeded.
    fn pause(
        &self,
        started: Instant,
        stack: &StackRef,
        cancel: &CancellationToken,
    ) -> Result<(), StackError> {
        let timed_out = || StackError::TimedOut {
            stack: stack.clone(),
            waited_secs: started.elapsed().as_secs(),
        };
        let Some(wake) = Instant::now().checked_add(self.interval) else {
            return Err(timed_out());
        };
        // A timeout past any representable instant means no deadline.
        if started.checked_add(self.timeout).is_some_and(|deadline| wake > deadline) {
            return Err(timed_out());
        }
        while Instant::now() < wake {
            if cancel.is_cancelled() {
                return Err(StackError::Cancelled {
                    stack: stack.clone(),
                });
            }
            thread::sleep(SLEEP_SLICE.min(wake.saturating_duration_since(Instant::now())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stack::EventFilter;
    use crate::test_support::{ScriptedStackClient, description, root_event};

    fn fast() -> StackPoller {
        StackPoller::new(Duration::from_millis(1), Duration::from_secs(5))
    }

    fn stack() -> StackRef {
        StackRef::new("web")
    }

    #[test]
    fn stops_on_terminal_root_event() {
        let client = ScriptedStackClient::new()
            .last_event(Ok(None))
            .last_event(Ok(Some(root_event(&stack(), StackStatus::UPDATE_IN_PROGRESS))))
            .last_event(Ok(Some(root_event(&stack(), StackStatus::UPDATE_COMPLETE))));
        let mut orchestrator = StackOrchestrator::default();
        let filter = EventFilter::all().root_of(&stack());
        let mut watcher = orchestrator.rollback_watcher(&client, &stack(), true, false, filter);

        let last = fast()
            .wait(&mut watcher, &CancellationToken::new())
            .expect("finished");
        assert_eq!(last.status.as_str(), StackStatus::UPDATE_COMPLETE);
        assert_eq!(client.calls().len(), 3);
    }

    #[test]
    fn rollback_surfaces_through_poller() {
        let client = ScriptedStackClient::new()
            .last_event(Ok(Some(root_event(
                &stack(),
                StackStatus::UPDATE_ROLLBACK_IN_PROGRESS,
            ))))
            .recent_events(Ok(Vec::new()));
        let mut orchestrator = StackOrchestrator::default();
        let mut watcher =
            orchestrator.rollback_watcher(&client, &stack(), true, false, EventFilter::all());

        let err = fast()
            .wait(&mut watcher, &CancellationToken::new())
            .expect_err("rolled back");
        assert!(matches!(err, StackError::RolledBack { .. }));
    }

    #[test]
    fn times_out_when_never_terminal() {
        let mut client = ScriptedStackClient::new();
        for _ in 0..10 {
            client = client.last_event(Ok(Some(root_event(
                &stack(),
                StackStatus::CREATE_IN_PROGRESS,
            ))));
        }
        let mut orchestrator = StackOrchestrator::default();
        let mut watcher =
            orchestrator.rollback_watcher(&client, &stack(), true, false, EventFilter::all());
        let poller = StackPoller::new(Duration::from_millis(20), Duration::from_millis(50));

        let err = poller
            .wait(&mut watcher, &CancellationToken::new())
            .expect_err("timeout");
        assert!(matches!(err, StackError::TimedOut { .. }));
        assert_eq!(err.code(), Some(ErrorCode::STACK_WAIT_TIMED_OUT));
    }

    #[test]
    fn huge_timeout_means_no_deadline() {
        let client = ScriptedStackClient::new()
            .last_event(Ok(Some(root_event(&stack(), StackStatus::CREATE_IN_PROGRESS))))
            .last_event(Ok(Some(root_event(&stack(), StackStatus::CREATE_COMPLETE))));
        let mut orchestrator = StackOrchestrator::default();
        let mut watcher =
            orchestrator.rollback_watcher(&client, &stack(), true, false, EventFilter::all());
        let poller = StackPoller::new(Duration::from_millis(1), Duration::from_secs(u64::MAX));

        let last = poller
            .wait(&mut watcher, &CancellationToken::new())
            .expect("finished");
        assert_eq!(last.status.as_str(), StackStatus::CREATE_COMPLETE);
    }

    #[test]
    fn honors_cancellation() {
        let client = ScriptedStackClient::new();
        let mut orchestrator = StackOrchestrator::default();
        let mut watcher =
            orchestrator.rollback_watcher(&client, &stack(), true, false, EventFilter::all());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fast().wait(&mut watcher, &cancel).expect_err("cancelled");
        assert!(matches!(err, StackError::Cancelled { .. }));
        assert!(client.calls().is_empty());
    }

    #[test]
    fn denied_event_lookup_is_a_permission_error() {
        let client = ScriptedStackClient::new()
            .last_event(Err(CloudError::access_denied("not authorized")));
        let mut orchestrator = StackOrchestrator::default();
        let mut watcher =
            orchestrator.rollback_watcher(&client, &stack(), true, false, EventFilter::all());

        let err = fast()
            .wait(&mut watcher, &CancellationToken::new())
            .expect_err("denied");
        assert!(matches!(err, StackError::Permission { .. }));
        assert_eq!(err.code(), Some(ErrorCode::DESCRIBE_EVENTS_DENIED));
    }

    #[test]
    fn failed_event_lookup_is_an_unknown_error() {
        let client =
            ScriptedStackClient::new().last_event(Err(CloudError::other("connection reset")));
        let mut orchestrator = StackOrchestrator::default();
        let mut watcher =
            orchestrator.rollback_watcher(&client, &stack(), true, false, EventFilter::all());

        let err = fast()
            .wait(&mut watcher, &CancellationToken::new())
            .expect_err("failed");
        assert!(matches!(err, StackError::Unknown { .. }));
        assert_eq!(err.code(), Some(ErrorCode::DESCRIBE_STACK_FAILED));
        assert!(orchestrator.ledger().contains(ErrorCode::SERVICE_ERROR));
    }

    #[test]
    fn missing_events_fail_each_tick_when_required() {
        let client = ScriptedStackClient::new().last_event(Ok(None));
        let mut orchestrator = StackOrchestrator::default();
        let mut watcher =
            orchestrator.rollback_watcher(&client, &stack(), true, true, EventFilter::all());
        let err = fast()
            .wait(&mut watcher, &CancellationToken::new())
            .expect_err("missing");
        assert!(matches!(err, StackError::MissingEvent { .. }));
    }

    #[test]
    fn deletion_wait_ends_when_stack_disappears() {
        let client = ScriptedStackClient::new()
            .describe(Ok(description("web", StackStatus::DELETE_IN_PROGRESS)))
            .describe(Err(CloudError::not_found(&stack())));
        let mut orchestrator = StackOrchestrator::default();
        fast()
            .wait_for_deletion(&mut orchestrator, &client, &stack(), &CancellationToken::new())
            .expect("deleted");
    }

    #[test]
    fn deletion_failure_is_reported() {
        let mut failed = description("web", StackStatus::DELETE_FAILED);
        failed.status_reason = Some("bucket not empty".to_string());
        let client = ScriptedStackClient::new().describe(Ok(failed));
        let mut orchestrator = StackOrchestrator::default();
        let err = fast()
            .wait_for_deletion(&mut orchestrator, &client, &stack(), &CancellationToken::new())
            .expect_err("failed");
        assert_eq!(err.code(), Some(ErrorCode::MODIFY_STACK_FAILED));
        assert!(err.to_string().contains("bucket not empty"));
    }
}
