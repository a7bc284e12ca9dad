//! Agent configuration, usually `convey.toml` next to the package.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Agent configuration (TOML).
///
/// Missing fields fall back to defaults so an empty file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Wall-clock limit for any single child process (scripts, extractor tools).
    pub process_timeout_secs: u64,

    /// Bytes of captured output kept per stream for non-streaming commands.
    pub output_limit_bytes: usize,

    pub stack: StackConfig,

    /// External extractor tools, consulted after the built-in zip extractor.
    pub extractors: Vec<ExtractorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StackConfig {
    pub poll_interval_secs: u64,
    pub wait_timeout_secs: u64,
    /// Program used to reach CloudFormation.
    pub aws_cli: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

/// One external extraction tool.
///
/// `command` may contain `{archive}` and `{destination}` placeholders. The tool
/// runs with the destination as its working directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractorConfig {
    pub name: String,
    pub kinds: Vec<String>,
    pub command: Vec<String>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            wait_timeout_secs: 60 * 60,
            aws_cli: "aws".to_string(),
            region: None,
            profile: None,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            process_timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
            stack: StackConfig::default(),
            extractors: Vec::new(),
        }
    }
}

/// Upper bound for any configured wait (30 days).
pub const MAX_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.process_timeout_secs == 0 {
            return Err(anyhow!("process_timeout_secs must be > 0"));
        }
        if self.process_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(anyhow!(
                "process_timeout_secs must be <= {MAX_TIMEOUT_SECS}"
            ));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.stack.poll_interval_secs == 0 {
            return Err(anyhow!("stack.poll_interval_secs must be > 0"));
        }
        if self.stack.wait_timeout_secs < self.stack.poll_interval_secs {
            return Err(anyhow!(
                "stack.wait_timeout_secs must be >= stack.poll_interval_secs"
            ));
        }
        if self.stack.wait_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(anyhow!(
                "stack.wait_timeout_secs must be <= {MAX_TIMEOUT_SECS}"
            ));
        }
        if self.stack.aws_cli.trim().is_empty() {
            return Err(anyhow!("stack.aws_cli must not be empty"));
        }
        for extractor in &self.extractors {
            if extractor.name.trim().is_empty() {
                return Err(anyhow!("extractors[].name must not be empty"));
            }
            if extractor.kinds.is_empty() {
                return Err(anyhow!(
                    "extractor {} must list at least one kind",
                    extractor.name
                ));
            }
            if extractor.command.is_empty() || extractor.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "extractor {} command must be a non-empty array",
                    extractor.name
                ));
            }
        }
        Ok(())
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }
}

impl StackConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Write `contents` next to `path` first, then rename over it.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path has no file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
