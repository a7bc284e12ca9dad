//! Structured service messages embedded in free-form process output.
//!
//! A service message occupies one whole line:
//!
//! ```text
//! ##convey[setVariable name='QnVpbGRJZA==' value='NDI=']
//! ```
//!
//! The token after `##convey[` is the message name; it is followed by zero or
//! more `key='value'` attributes whose values are base64 (standard alphabet).
//! Every other line is plain console text.

use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;

pub const PREFIX: &str = "##convey[";

pub const SET_VARIABLE: &str = "setVariable";
pub const PROGRESS: &str = "progress";
pub const WARNING: &str = "warning";

static MESSAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^##convey\[([A-Za-z][A-Za-z0-9_-]*)((?:\s+[A-Za-z][A-Za-z0-9_]*='[^']*')*)\s*\]$")
        .unwrap()
});
static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z][A-Za-z0-9_]*)='([^']*)'").unwrap());

/// A decoded service message: a name plus ordered, decoded attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMessage {
    pub name: String,
    pub properties: Vec<(String, String)>,
}

/// Classification of a single output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Plain,
    Message(ServiceMessage),
    /// Carries the service message prefix but cannot be decoded.
    Malformed(String),
}

impl ServiceMessage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    pub fn set_variable(name: &str, value: &str, sensitive: bool) -> Self {
        let msg = Self::new(SET_VARIABLE)
            .with("name", name)
            .with("value", value);
        if sensitive {
            msg.with("sensitive", "true")
        } else {
            msg
        }
    }

    pub fn progress(percentage: u8, message: &str) -> Self {
        Self::new(PROGRESS)
            .with("percentage", percentage.to_string())
            .with("message", message)
    }

    pub fn warning(message: &str) -> Self {
        Self::new(WARNING).with("message", message)
    }

    /// First attribute named `key`.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Encode as a single output line (no trailing newline).
    pub fn to_line(&self) -> String {
        let mut line = format!("{PREFIX}{}", self.name);
        for (key, value) in &self.properties {
            line.push(' ');
            line.push_str(key);
            line.push_str("='");
            line.push_str(&STANDARD.encode(value.as_bytes()));
            line.push('\'');
        }
        line.push(']');
        line
    }
}

/// Classify `line` (without its terminator).
pub fn parse_line(line: &str) -> ParsedLine {
    let trimmed = line.trim();
    if !trimmed.starts_with(PREFIX) {
        return ParsedLine::Plain;
    }
    let Some(caps) = MESSAGE_RE.captures(trimmed) else {
        return ParsedLine::Malformed("unrecognized service message syntax".to_string());
    };

    let mut message = ServiceMessage::new(&caps[1]);
    for attr in ATTR_RE.captures_iter(&caps[2]) {
        let key = &attr[1];
        let decoded = match STANDARD.decode(&attr[2]) {
            Ok(bytes) => bytes,
            Err(err) => {
                return ParsedLine::Malformed(format!("attribute '{key}' is not base64: {err}"));
            }
        };
        let value = match String::from_utf8(decoded) {
            Ok(value) => value,
            Err(_) => {
                return ParsedLine::Malformed(format!("attribute '{key}' is not UTF-8"));
            }
        };
        message.properties.push((key.to_string(), value));
    }
    ParsedLine::Message(message)
}
