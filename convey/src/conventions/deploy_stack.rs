use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::core::cancel::CancellationToken;
use crate::core::context::{DeploymentContext, known};
use crate::core::stack::{EventFilter, StackRef};
use crate::pipeline::Convention;
use crate::stack::client::{StackClientFactory, StackDeployment};
use crate::stack::orchestrator::{StackOrchestrator, WarningLedger};
use crate::stack::poll::StackPoller;

/// One entry of a CloudFormation parameters file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ParameterEntry {
    parameter_key: String,
    #[serde(default)]
    parameter_value: String,
}

/// Creates or updates the stack named by `Convey.Action.Aws.CloudFormationStackName`,
/// waits for it to settle and publishes its outputs as `AwsOutputs[...]`.
///
/// Skipped when no stack name is set.
pub struct DeployStack<F> {
    factory: F,
    poller: StackPoller,
    cancel: CancellationToken,
}

impl<F: StackClientFactory> DeployStack<F> {
    pub fn new(factory: F, poller: StackPoller, cancel: CancellationToken) -> Self {
        Self {
            factory,
            poller,
            cancel,
        }
    }

    fn build_deployment(&self, ctx: &DeploymentContext, stack: StackRef) -> Result<StackDeployment> {
        let vars = &ctx.variables;
        let dir = ctx.current_directory();
        let template_var = vars
            .get_non_empty(known::STACK_TEMPLATE)
            .with_context(|| format!("variable {} is required", known::STACK_TEMPLATE))?;
        let template_path = resolve(dir.as_deref(), template_var);
        let template_body = fs::read_to_string(&template_path)
            .with_context(|| format!("read template {}", template_path.display()))?;

        let parameters = match vars.get_non_empty(known::STACK_PARAMETERS) {
            Some(file) => read_parameters(&resolve(dir.as_deref(), file))?,
            None => Vec::new(),
        };
        let capabilities = vars
            .get_non_empty(known::STACK_CAPABILITIES)
            .map(|caps| {
                caps.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(StackDeployment {
            stack,
            template_body,
            parameters,
            capabilities,
            role_arn: vars.get_non_empty(known::STACK_ROLE_ARN).map(str::to_string),
        })
    }
}

impl<F: StackClientFactory> Convention for DeployStack<F> {
    fn name(&self) -> &str {
        "deploy-stack"
    }

    fn install(&self, ctx: &mut DeploymentContext) -> Result<()> {
        let Some(name) = ctx.variables.get_non_empty(known::STACK_NAME) else {
            debug!("no {} set, skipping", known::STACK_NAME);
            return Ok(());
        };
        let stack = StackRef::new(name);
        let deployment = self.build_deployment(ctx, stack.clone())?;
        let wait = ctx.variables.get_flag(known::STACK_WAIT, true);

        let mut orchestrator = StackOrchestrator::new(WarningLedger::default());
        let action = orchestrator.deploy(&self.factory, &deployment, &self.poller, &self.cancel)?;
        info!(?action, "stack deployment submitted");

        if !action.started_operation() || wait {
            if action.started_operation() {
                let filter = EventFilter::all().root_of(&stack);
                let mut watcher =
                    orchestrator.rollback_watcher(&self.factory, &stack, true, false, filter);
                self.poller.wait(&mut watcher, &self.cancel)?;
            }
            orchestrator.read_outputs(&self.factory, &stack, ctx)?;
        } else {
            info!("not waiting for the stack to finish; outputs are not read");
        }
        Ok(())
    }
}

fn resolve(dir: Option<&Path>, file: &str) -> PathBuf {
    let path = Path::new(file);
    match dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

fn read_parameters(path: &Path) -> Result<Vec<(String, String)>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read parameters {}", path.display()))?;
    let entries: Vec<ParameterEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("parse parameters {}", path.display()))?;
    Ok(entries
        .into_iter()
        .map(|e| (e.parameter_key, e.parameter_value))
        .collect())
}
