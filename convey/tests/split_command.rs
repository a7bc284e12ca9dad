//! Real child processes through the output splitter.

#![cfg(unix)]

use std::process::Command;
use std::time::Duration;

use convey::core::context::DeploymentContext;
use convey::core::service_message::ServiceMessage;
use convey::core::variables::Variables;
use convey::io::process::{ProcessOptions, run_split_command};
use convey::io::service_channel::ContextSink;
use convey::io::splitter::{OutputSplitter, OutputStream};
use convey::test_support::RecordingConsole;

fn sh(script: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    cmd
}

#[test]
fn service_messages_update_context_and_console_keeps_the_rest() {
    let set = ServiceMessage::set_variable("Release", "v1.4", false).to_line();
    let progress = ServiceMessage::progress(50, "halfway").to_line();
    let script = format!("echo start\necho \"{set}\"\necho oops >&2\necho \"{progress}\"\necho done\n");

    let mut ctx = DeploymentContext::new("web.zip", Variables::new());
    let mut console = RecordingConsole::default();
    let run = {
        let mut splitter = OutputSplitter::new(&mut console, ContextSink::new(&mut ctx));
        run_split_command(
            sh(&script),
            &ProcessOptions::new(Duration::from_secs(10)),
            &mut splitter,
        )
        .expect("run")
    };

    assert!(run.success());
    assert_eq!(run.counts.messages, 2);
    assert_eq!(run.counts.console_lines, 3);
    assert_eq!(ctx.variables.get("release"), Some("v1.4"));

    let stdout: Vec<&str> = console
        .lines
        .iter()
        .filter(|(stream, _)| *stream == OutputStream::Stdout)
        .map(|(_, line)| line.as_str())
        .collect();
    assert_eq!(stdout, vec!["start", "done"]);
    assert!(
        console
            .lines
            .contains(&(OutputStream::Stderr, "oops".to_string()))
    );
}

#[test]
fn malformed_message_is_echoed_as_console_text() {
    let mut ctx = DeploymentContext::new("web.zip", Variables::new());
    let mut console = RecordingConsole::default();
    let run = {
        let mut splitter = OutputSplitter::new(&mut console, ContextSink::new(&mut ctx));
        run_split_command(
            sh("echo \"##convey[setVariable name='***']\""),
            &ProcessOptions::new(Duration::from_secs(10)),
            &mut splitter,
        )
        .expect("run")
    };

    assert_eq!(run.counts.malformed, 1);
    assert_eq!(run.counts.messages, 0);
    assert_eq!(console.text(), vec!["##convey[setVariable name='***']"]);
    assert!(ctx.variables.is_empty());
}

#[test]
fn timeout_kills_the_child() {
    let mut ctx = DeploymentContext::new("web.zip", Variables::new());
    let mut console = RecordingConsole::default();
    let mut splitter = OutputSplitter::new(&mut console, ContextSink::new(&mut ctx));
    let run = run_split_command(
        sh("echo begin; exec sleep 5"),
        &ProcessOptions::new(Duration::from_millis(200)),
        &mut splitter,
    )
    .expect("run");

    assert!(run.timed_out);
    assert!(!run.success());
}
