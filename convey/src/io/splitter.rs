//! Demultiplexes subprocess output into console text and service messages.
//!
//! Bytes arrive in arbitrary chunks per stream. Each stream is buffered until a
//! newline completes a line; the line is then routed to exactly one sink.

use std::io::Write;

use tracing::{debug, warn};

use crate::core::service_message::{ParsedLine, ServiceMessage, parse_line};

/// Longest line buffered before it is routed without a terminator.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Which pipe of the child a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives plain console lines, without line terminators.
pub trait ConsoleSink {
    fn write_line(&mut self, stream: OutputStream, line: &str);
}

/// Receives decoded service messages.
pub trait MessageSink {
    fn receive(&mut self, message: ServiceMessage);
}

impl<T: ConsoleSink + ?Sized> ConsoleSink for &mut T {
    fn write_line(&mut self, stream: OutputStream, line: &str) {
        (**self).write_line(stream, line);
    }
}

impl<T: MessageSink + ?Sized> MessageSink for &mut T {
    fn receive(&mut self, message: ServiceMessage) {
        (**self).receive(message);
    }
}

/// Forwards console lines to the agent's own stdout/stderr unchanged.
#[derive(Debug, Default)]
pub struct StdoutConsole;

impl ConsoleSink for StdoutConsole {
    fn write_line(&mut self, stream: OutputStream, line: &str) {
        let result = match stream {
            OutputStream::Stdout => writeln!(std::io::stdout().lock(), "{line}"),
            OutputStream::Stderr => writeln!(std::io::stderr().lock(), "{line}"),
        };
        if let Err(err) = result {
            warn!(err = %err, "failed to forward console line");
        }
    }
}

/// Buffers every message in arrival order.
#[derive(Debug, Default)]
pub struct CollectedMessages {
    pub messages: Vec<ServiceMessage>,
}

impl MessageSink for CollectedMessages {
    fn receive(&mut self, message: ServiceMessage) {
        self.messages.push(message);
    }
}

/// Line tallies for one splitter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitCounts {
    pub console_lines: usize,
    pub messages: usize,
    /// Lines that looked like service messages but failed to decode (counted in `console_lines` too).
    pub malformed: usize,
}

pub struct OutputSplitter<C, M> {
    console: C,
    messages: M,
    pending_stdout: Vec<u8>,
    pending_stderr: Vec<u8>,
    counts: SplitCounts,
}

impl<C: ConsoleSink, M: MessageSink> OutputSplitter<C, M> {
    pub fn new(console: C, messages: M) -> Self {
        Self {
            console,
            messages,
            pending_stdout: Vec::new(),
            pending_stderr: Vec::new(),
            counts: SplitCounts::default(),
        }
    }

    /// Append a chunk read from `stream` and route every line it completes.
    ///
    /// Buffered bytes never contain a newline, so only the new chunk is
    /// scanned. An unterminated line reaching [`MAX_LINE_BYTES`] is routed in
    /// pieces of that size.
    pub fn feed(&mut self, stream: OutputStream, chunk: &[u8]) {
        let mut pending = std::mem::take(self.pending_mut(stream));
        let mut scan_from = pending.len();
        pending.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = pending[scan_from..].iter().position(|b| *b == b'\n') {
            let end = scan_from + offset;
            self.route(stream, &pending[start..end]);
            start = end + 1;
            scan_from = start;
        }
        while pending.len() - start >= MAX_LINE_BYTES {
            debug!(?stream, "splitting overlong line");
            self.route(stream, &pending[start..start + MAX_LINE_BYTES]);
            start += MAX_LINE_BYTES;
        }
        pending.drain(..start);
        *self.pending_mut(stream) = pending;
    }

    /// Route any unterminated trailing data as final lines (stdout first).
    pub fn finish(&mut self) -> SplitCounts {
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let rest = std::mem::take(self.pending_mut(stream));
            if !rest.is_empty() {
                self.route(stream, &rest);
            }
        }
        self.counts
    }

    pub fn counts(&self) -> SplitCounts {
        self.counts
    }

    pub fn into_sinks(self) -> (C, M) {
        (self.console, self.messages)
    }

    fn pending_mut(&mut self, stream: OutputStream) -> &mut Vec<u8> {
        match stream {
            OutputStream::Stdout => &mut self.pending_stdout,
            OutputStream::Stderr => &mut self.pending_stderr,
        }
    }

    fn route(&mut self, stream: OutputStream, raw: &[u8]) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        match parse_line(&line) {
            ParsedLine::Plain => {
                self.counts.console_lines += 1;
                self.console.write_line(stream, &line);
            }
            ParsedLine::Message(message) => {
                self.counts.messages += 1;
                self.messages.receive(message);
            }
            ParsedLine::Malformed(reason) => {
                warn!(reason = %reason, "treating malformed service message as console text");
                self.counts.malformed += 1;
                self.counts.console_lines += 1;
                self.console.write_line(stream, &line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Lines(Vec<(OutputStream, String)>);

    impl ConsoleSink for Lines {
        fn write_line(&mut self, stream: OutputStream, line: &str) {
            self.0.push((stream, line.to_string()));
        }
    }

    fn splitter() -> OutputSplitter<Lines, CollectedMessages> {
        OutputSplitter::new(Lines::default(), CollectedMessages::default())
    }

    #[test]
    fn interleaved_lines_route_to_one_sink_each() {
        let mut split = splitter();
        let mut input = String::new();
        let mut expected_plain = Vec::new();
        let mut expected_messages = Vec::new();
        for i in 0..5 {
            let plain = format!("plain {i}");
            input.push_str(&plain);
            input.push('\n');
            expected_plain.push(plain);
            if i % 2 == 0 {
                let msg = ServiceMessage::set_variable(&format!("v{i}"), &i.to_string(), false);
                input.push_str(&msg.to_line());
                input.push('\n');
                expected_messages.push(msg);
            }
        }

        split.feed(OutputStream::Stdout, input.as_bytes());
        let counts = split.finish();
        let (console, messages) = split.into_sinks();

        let plain: Vec<String> = console.0.into_iter().map(|(_, l)| l).collect();
        assert_eq!(plain, expected_plain);
        assert_eq!(messages.messages, expected_messages);
        assert_eq!(counts.console_lines, 5);
        assert_eq!(counts.messages, 3);
    }

    #[test]
    fn partial_writes_are_reassembled() {
        let mut split = splitter();
        let line = ServiceMessage::progress(50, "halfway").to_line();
        let (head, tail) = line.split_at(7);

        split.feed(OutputStream::Stdout, b"hel");
        split.feed(OutputStream::Stdout, b"lo\n");
        split.feed(OutputStream::Stdout, head.as_bytes());
        split.feed(OutputStream::Stdout, tail.as_bytes());
        split.feed(OutputStream::Stdout, b"\n");
        split.finish();

        let (console, messages) = split.into_sinks();
        assert_eq!(console.0, vec![(OutputStream::Stdout, "hello".to_string())]);
        assert_eq!(messages.messages.len(), 1);
        assert_eq!(messages.messages[0].property("message"), Some("halfway"));
    }

    #[test]
    fn streams_buffer_independently() {
        let mut split = splitter();
        split.feed(OutputStream::Stdout, b"out-");
        split.feed(OutputStream::Stderr, b"err line\n");
        split.feed(OutputStream::Stdout, b"line\r\n");
        split.finish();

        let (console, _) = split.into_sinks();
        assert_eq!(
            console.0,
            vec![
                (OutputStream::Stderr, "err line".to_string()),
                (OutputStream::Stdout, "out-line".to_string()),
            ]
        );
    }

    #[test]
    fn finish_flushes_unterminated_tail() {
        let mut split = splitter();
        split.feed(OutputStream::Stdout, b"no newline");
        assert_eq!(split.counts().console_lines, 0);
        let counts = split.finish();
        assert_eq!(counts.console_lines, 1);
    }

    #[test]
    fn malformed_message_goes_to_console() {
        let mut split = splitter();
        split.feed(OutputStream::Stdout, b"##convey[setVariable name='%%%']\n");
        let counts = split.finish();
        let (console, messages) = split.into_sinks();
        assert_eq!(counts.malformed, 1);
        assert_eq!(console.0.len(), 1);
        assert!(messages.messages.is_empty());
    }

    #[test]
    fn empty_lines_are_preserved() {
        let mut split = splitter();
        split.feed(OutputStream::Stdout, b"a\n\nb\n");
        split.finish();
        let (console, _) = split.into_sinks();
        let lines: Vec<&str> = console.0.iter().map(|(_, l)| l.as_str()).collect();
        assert_eq!(lines, vec!["a", "", "b"]);
    }

    #[test]
    fn overlong_line_is_split_at_the_cap() {
        let mut split = splitter();
        let piece = vec![b'a'; 1000];
        for _ in 0..70 {
            split.feed(OutputStream::Stdout, &piece);
        }
        assert_eq!(split.counts().console_lines, 1);
        split.feed(OutputStream::Stdout, b"\n");
        split.finish();

        let (console, _) = split.into_sinks();
        let lengths: Vec<usize> = console.0.iter().map(|(_, l)| l.len()).collect();
        assert_eq!(lengths, vec![MAX_LINE_BYTES, 70_000 - MAX_LINE_BYTES]);
    }
}
