//! Helpers for running child processes with timeouts, cancellation and
//! concurrent output draining.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::cancel::CancellationToken;
use crate::io::splitter::{ConsoleSink, MessageSink, OutputSplitter, OutputStream, SplitCounts};

/// Granularity at which waits notice cancellation and deadlines.
const POLL_SLICE: Duration = Duration::from_millis(50);
const CHUNK_SIZE: usize = 8192;

/// Limits applied to one child process.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl ProcessOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// How waiting for a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitEnd {
    Exited,
    TimedOut,
    Cancelled,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Result of a child whose output went through an [`OutputSplitter`].
#[derive(Debug, Clone, Copy)]
pub struct SplitRun {
    pub status: ExitStatus,
    pub timed_out: bool,
    pub cancelled: bool,
    pub counts: SplitCounts,
}

impl SplitRun {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.status.success()
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = options.timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    options: &ProcessOptions,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = spawn(&mut cmd)?;

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let (status, end) = wait_child(&mut child, options)?;

    let (stdout, stdout_truncated) = join_reader(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_reader(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), ?end, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out: end == WaitEnd::TimedOut,
        cancelled: end == WaitEnd::Cancelled,
    })
}

/// Run a command and route its combined output through `splitter` as it is produced.
///
/// Each pipe is drained by its own reader thread that forwards raw chunks over an
/// unbounded channel, so the child never blocks on a full pipe. Routing happens
/// on the calling thread in arrival order.
#[instrument(skip_all, fields(timeout_secs = options.timeout.as_secs()))]
pub fn run_split_command<C: ConsoleSink, M: MessageSink>(
    mut cmd: Command,
    options: &ProcessOptions,
    splitter: &mut OutputSplitter<C, M>,
) -> Result<SplitRun> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = spawn(&mut cmd)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel::<(OutputStream, Vec<u8>)>();
    let stdout_tx = tx.clone();
    let stdout_handle =
        thread::spawn(move || forward_chunks(stdout, OutputStream::Stdout, stdout_tx));
    let stderr_handle = thread::spawn(move || forward_chunks(stderr, OutputStream::Stderr, tx));

    let deadline = deadline_after(options.timeout);
    let (status, end) = loop {
        while let Ok((stream, chunk)) = rx.try_recv() {
            splitter.feed(stream, &chunk);
        }
        if let Some(status) = child.wait_timeout(POLL_SLICE).context("wait for command")? {
            break (status, WaitEnd::Exited);
        }
        if options.cancel.is_cancelled() {
            warn!("cancellation requested, killing child");
            break (kill_and_reap(&mut child)?, WaitEnd::Cancelled);
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            warn!(
                timeout_secs = options.timeout.as_secs(),
                "command timed out, killing"
            );
            break (kill_and_reap(&mut child)?, WaitEnd::TimedOut);
        }
    };

    // Senders live in the reader threads; iteration ends once both hit EOF.
    for (stream, chunk) in rx.iter() {
        splitter.feed(stream, &chunk);
    }
    join_reader(stdout_handle).context("join stdout")?;
    join_reader(stderr_handle).context("join stderr")?;
    let counts = splitter.finish();

    debug!(exit_code = ?status.code(), ?end, console_lines = counts.console_lines, messages = counts.messages, "command finished");
    Ok(SplitRun {
        status,
        timed_out: end == WaitEnd::TimedOut,
        cancelled: end == WaitEnd::Cancelled,
        counts,
    })
}

fn spawn(cmd: &mut Command) -> Result<Child> {
    debug!(program = ?cmd.get_program(), "spawning child process");
    match cmd.spawn() {
        Ok(child) => Ok(child),
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()))
        }
    }
}

fn wait_child(child: &mut Child, options: &ProcessOptions) -> Result<(ExitStatus, WaitEnd)> {
    let deadline = deadline_after(options.timeout);
    loop {
        if let Some(status) = child.wait_timeout(POLL_SLICE).context("wait for command")? {
            return Ok((status, WaitEnd::Exited));
        }
        if options.cancel.is_cancelled() {
            warn!("cancellation requested, killing child");
            return Ok((kill_and_reap(child)?, WaitEnd::Cancelled));
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            warn!(
                timeout_secs = options.timeout.as_secs(),
                "command timed out, killing"
            );
            return Ok((kill_and_reap(child)?, WaitEnd::TimedOut));
        }
    }
}

/// `None` when the timeout reaches past any representable instant.
fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

fn kill_and_reap(child: &mut Child) -> Result<ExitStatus> {
    child.kill().context("kill command")?;
    child.wait().context("wait command after kill")
}

fn join_reader<T>(handle: thread::JoinHandle<Result<T>>) -> Result<T> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn forward_chunks<R: Read>(
    mut reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<(OutputStream, Vec<u8>)>,
) -> Result<()> {
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        // The receiver only disappears when the caller bailed out; keep draining.
        let _ = tx.send((stream, chunk[..n].to_vec()));
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
