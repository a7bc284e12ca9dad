//! Runs the `PreDeploy.sh` / `Deploy.sh` / `PostDeploy.sh` scripts shipped in a package.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Result, anyhow};
use thiserror::Error;
use tracing::{debug, info};

use crate::core::context::DeploymentContext;
use crate::io::process::{ProcessOptions, run_split_command};
use crate::io::service_channel::ContextSink;
use crate::io::splitter::{OutputSplitter, StdoutConsole};
use crate::pipeline::Convention;

/// Prefix of the environment variables scripts receive the deployment variables in.
pub const ENV_PREFIX: &str = "CONVEY_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPhase {
    PreDeploy,
    Deploy,
    PostDeploy,
}

impl ScriptPhase {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::PreDeploy => "PreDeploy.sh",
            Self::Deploy => "Deploy.sh",
            Self::PostDeploy => "PostDeploy.sh",
        }
    }

    fn step_name(self) -> &'static str {
        match self {
            Self::PreDeploy => "pre-deploy-script",
            Self::Deploy => "deploy-script",
            Self::PostDeploy => "post-deploy-script",
        }
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script {} failed with exit code {code}", .script.display())]
    Failed { script: PathBuf, code: i32 },
    #[error("script {} was terminated by a signal", .script.display())]
    Killed { script: PathBuf },
    #[error("script {} did not finish within {secs}s", .script.display())]
    TimedOut { script: PathBuf, secs: u64 },
    #[error("script {} was cancelled", .script.display())]
    Cancelled { script: PathBuf },
}

/// Environment variable name for a deployment variable: `CONVEY_` followed by
/// the upper-cased name with every non-alphanumeric character replaced by `_`.
pub fn env_name(variable: &str) -> String {
    let mut name = String::with_capacity(ENV_PREFIX.len() + variable.len());
    name.push_str(ENV_PREFIX);
    name.extend(variable.chars().map(|c| {
        if c.is_ascii_alphanumeric() {
            c.to_ascii_uppercase()
        } else {
            '_'
        }
    }));
    name
}

/// Runs one phase's script from the current directory when the package has it.
///
/// Script output is split: plain lines are echoed, service messages are
/// applied to the context as they arrive.
pub struct PackagedScript {
    phase: ScriptPhase,
    options: ProcessOptions,
}

impl PackagedScript {
    pub fn new(phase: ScriptPhase, options: ProcessOptions) -> Self {
        Self { phase, options }
    }
}

impl Convention for PackagedScript {
    fn name(&self) -> &str {
        self.phase.step_name()
    }

    fn install(&self, ctx: &mut DeploymentContext) -> Result<()> {
        let dir = ctx
            .current_directory()
            .ok_or_else(|| anyhow!("package has not been extracted"))?;
        let script = dir.join(self.phase.file_name());
        if !script.is_file() {
            debug!(script = %script.display(), "no script for phase");
            return Ok(());
        }

        let mut cmd = Command::new("sh");
        cmd.arg(&script).current_dir(&dir);
        for (name, value) in ctx.variables.iter() {
            cmd.env(env_name(name), value);
        }

        info!(script = %script.display(), "running script");
        let mut splitter = OutputSplitter::new(StdoutConsole, ContextSink::new(ctx));
        let run = run_split_command(cmd, &self.options, &mut splitter)?;
        let (_, sink) = splitter.into_sinks();
        if !sink.variables_set().is_empty() {
            info!(variables = ?sink.variables_set(), "script set variables");
        }

        if run.timed_out {
            return Err(ScriptError::TimedOut {
                script,
                secs: self.options.timeout.as_secs(),
            }
            .into());
        }
        if run.cancelled {
            return Err(ScriptError::Cancelled { script }.into());
        }
        if !run.status.success() {
            return Err(match run.status.code() {
                Some(code) => ScriptError::Failed { script, code },
                None => ScriptError::Killed { script },
            }
            .into());
        }
        Ok(())
    }
}
