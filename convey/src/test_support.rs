//! Test-only fakes: a scripted stack provider, recording sinks and conventions.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};

use crate::core::context::DeploymentContext;
use crate::core::stack::{
    EventFilter, STACK_RESOURCE_TYPE, StackDescription, StackEvent, StackRef, StackStatus,
};
use crate::io::splitter::{ConsoleSink, OutputStream};
use crate::pipeline::Convention;
use crate::stack::client::{CloudError, StackClient, StackClientFactory, StackDeployment};

const BASE_TIMESTAMP: i64 = 1_700_000_000;
static NEXT_EVENT_SECS: AtomicI64 = AtomicI64::new(1_000);

/// Stack event with a deterministic id and a timestamp `secs` after a fixed base.
pub fn event_at(logical: &str, resource_type: &str, status: &str, secs: i64) -> StackEvent {
    StackEvent {
        event_id: format!("{logical}-{status}-{secs}"),
        logical_resource_id: logical.to_string(),
        physical_resource_id: None,
        resource_type: resource_type.to_string(),
        status: StackStatus::new(status),
        reason: None,
        timestamp: DateTime::<Utc>::from_timestamp(BASE_TIMESTAMP + secs, 0).unwrap_or_default(),
    }
}

/// Event about the stack itself; each call is later than the previous one.
pub fn root_event(stack: &StackRef, status: &str) -> StackEvent {
    let secs = NEXT_EVENT_SECS.fetch_add(1, Ordering::SeqCst);
    event_at(stack.name(), STACK_RESOURCE_TYPE, status, secs)
}

pub fn description(name: &str, status: &str) -> StackDescription {
    StackDescription {
        stack_id: format!("arn:aws:cloudformation:us-east-1:123456789012:stack/{name}/0000"),
        stack_name: name.to_string(),
        status: StackStatus::new(status),
        status_reason: None,
        outputs: Vec::new(),
    }
}

/// Stack provider answering from queues of canned responses.
///
/// Each call pops the next response for its operation; an empty queue answers
/// with an error so unexpected calls fail loudly.
#[derive(Default)]
pub struct ScriptedStackClient {
    describes: RefCell<VecDeque<Result<StackDescription, CloudError>>>,
    last_events: RefCell<VecDeque<Result<Option<StackEvent>, CloudError>>>,
    recent_events: RefCell<VecDeque<Result<Vec<StackEvent>, CloudError>>>,
    creates: RefCell<VecDeque<Result<String, CloudError>>>,
    updates: RefCell<VecDeque<Result<String, CloudError>>>,
    deletes: RefCell<VecDeque<Result<(), CloudError>>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedStackClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn describe(self, response: Result<StackDescription, CloudError>) -> Self {
        self.describes.borrow_mut().push_back(response);
        self
    }

    pub fn last_event(self, response: Result<Option<StackEvent>, CloudError>) -> Self {
        self.last_events.borrow_mut().push_back(response);
        self
    }

    pub fn recent_events(self, response: Result<Vec<StackEvent>, CloudError>) -> Self {
        self.recent_events.borrow_mut().push_back(response);
        self
    }

    pub fn create(self, response: Result<String, CloudError>) -> Self {
        self.creates.borrow_mut().push_back(response);
        self
    }

    pub fn update(self, response: Result<String, CloudError>) -> Self {
        self.updates.borrow_mut().push_back(response);
        self
    }

    pub fn delete(self, response: Result<(), CloudError>) -> Self {
        self.deletes.borrow_mut().push_back(response);
        self
    }

    /// Operations called so far, as `"<operation> <stack>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn next<T>(
        &self,
        queue: &RefCell<VecDeque<Result<T, CloudError>>>,
        operation: &str,
        stack: &StackRef,
    ) -> Result<T, CloudError> {
        self.calls.borrow_mut().push(format!("{operation} {stack}"));
        queue
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(CloudError::other(format!("no scripted {operation} response"))))
    }
}

impl StackClient for ScriptedStackClient {
    fn describe_stack(&self, stack: &StackRef) -> Result<StackDescription, CloudError> {
        self.next(&self.describes, "describe_stack", stack)
    }

    fn last_stack_event(
        &self,
        stack: &StackRef,
        filter: &EventFilter,
    ) -> Result<Option<StackEvent>, CloudError> {
        let event = self.next(&self.last_events, "last_stack_event", stack)?;
        Ok(event.filter(|e| filter.matches(e)))
    }

    fn recent_stack_events(&self, stack: &StackRef) -> Result<Vec<StackEvent>, CloudError> {
        self.next(&self.recent_events, "recent_stack_events", stack)
    }

    fn create_stack(&self, deployment: &StackDeployment) -> Result<String, CloudError> {
        self.next(&self.creates, "create_stack", &deployment.stack)
    }

    fn update_stack(&self, deployment: &StackDeployment) -> Result<String, CloudError> {
        self.next(&self.updates, "update_stack", &deployment.stack)
    }

    fn delete_stack(&self, stack: &StackRef) -> Result<(), CloudError> {
        self.next(&self.deletes, "delete_stack", stack)
    }
}

impl StackClientFactory for ScriptedStackClient {
    fn client(&self) -> Result<Box<dyn StackClient + '_>, CloudError> {
        Ok(Box::new(self))
    }
}

/// Console sink that keeps every line.
#[derive(Debug, Default)]
pub struct RecordingConsole {
    pub lines: Vec<(OutputStream, String)>,
}

impl RecordingConsole {
    pub fn text(&self) -> Vec<&str> {
        self.lines.iter().map(|(_, line)| line.as_str()).collect()
    }
}

impl ConsoleSink for RecordingConsole {
    fn write_line(&mut self, stream: OutputStream, line: &str) {
        self.lines.push((stream, line.to_string()));
    }
}

/// Shared record of which conventions ran.
#[derive(Debug, Clone, Default)]
pub struct StepLog(Rc<RefCell<Vec<String>>>);

impl StepLog {
    pub fn names(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

/// Convention that appends its name to a [`StepLog`] and sets `Ran.<name>`.
pub struct RecordingConvention {
    name: String,
    log: StepLog,
}

impl RecordingConvention {
    pub fn new(name: &str, log: &StepLog) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
        }
    }
}

impl Convention for RecordingConvention {
    fn name(&self) -> &str {
        &self.name
    }

    fn install(&self, ctx: &mut DeploymentContext) -> Result<()> {
        self.log.0.borrow_mut().push(self.name.clone());
        ctx.variables.set(format!("Ran.{}", self.name), "true");
        Ok(())
    }
}

/// Convention that always fails with `message`.
pub struct FailingConvention {
    name: String,
    message: String,
}

impl FailingConvention {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
        }
    }
}

impl Convention for FailingConvention {
    fn name(&self) -> &str {
        &self.name
    }

    fn install(&self, _ctx: &mut DeploymentContext) -> Result<()> {
        Err(anyhow!("{}", self.message))
    }
}

/// Write a zip archive holding `entries` (name, contents).
pub fn write_zip(path: &Path, entries: &[(&str, &str)]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut writer = zip::ZipWriter::new(file);
    for (name, contents) in entries {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .with_context(|| format!("start entry {name}"))?;
        writer.write_all(contents.as_bytes())?;
    }
    writer.finish().context("finish zip")?;
    Ok(())
}

/// Temporary directory holding a zip package named `file_name`.
pub struct TestPackage {
    pub dir: tempfile::TempDir,
    pub path: PathBuf,
}

impl TestPackage {
    pub fn new(file_name: &str, entries: &[(&str, &str)]) -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let path = dir.path().join(file_name);
        write_zip(&path, entries)?;
        Ok(Self { dir, path })
    }

    pub fn staging_root(&self) -> PathBuf {
        self.dir.path().join("staging")
    }
}
