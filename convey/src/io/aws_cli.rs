//! [`StackClient`] backed by the `aws cloudformation` command line tool.

use std::process::Command;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::stack::{
    EventFilter, StackDescription, StackEvent, StackOutput, StackRef, StackStatus,
};
use crate::io::config::AgentConfig;
use crate::io::process::{ProcessOptions, run_command_with_timeout};
use crate::stack::client::{
    CloudError, CloudErrorKind, StackClient, StackClientFactory, StackDeployment,
};

/// Events fetched per call; only the newest ones matter while polling.
const EVENT_PAGE_SIZE: &str = "100";

static CLI_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"An error occurred \((?P<code>[^)]+)\)(?: when calling the (?P<op>\w+) operation)?(?: \(reached max retries: \d+\))?: (?P<message>.*)",
    )
    .unwrap()
});

#[derive(Debug, Clone)]
pub struct AwsCliStackClient {
    program: String,
    region: Option<String>,
    profile: Option<String>,
    options: ProcessOptions,
    output_limit_bytes: usize,
}

impl AwsCliStackClient {
    pub fn from_config(cfg: &AgentConfig, options: ProcessOptions) -> Self {
        Self {
            program: cfg.stack.aws_cli.clone(),
            region: cfg.stack.region.clone(),
            profile: cfg.stack.profile.clone(),
            options,
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }

    #[instrument(skip(self, args), fields(program = %self.program))]
    fn run(&self, operation: &str, args: &[String]) -> Result<String, CloudError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("cloudformation")
            .arg(operation)
            .args(args)
            .args(["--output", "json"]);
        if let Some(region) = &self.region {
            cmd.args(["--region", region.as_str()]);
        }
        if let Some(profile) = &self.profile {
            cmd.args(["--profile", profile.as_str()]);
        }

        let output = run_command_with_timeout(cmd, None, &self.options, self.output_limit_bytes)
            .map_err(|err| CloudError::new(CloudErrorKind::Other, "CliError", format!("{err:#}")))?;
        if output.timed_out || output.cancelled {
            return Err(CloudError::new(
                CloudErrorKind::Other,
                "CliError",
                format!("aws cloudformation {operation} did not finish"),
            ));
        }
        if !output.status.success() {
            return Err(parse_cli_error(&output.stderr_text()));
        }
        debug!(bytes = output.stdout.len(), "aws cli succeeded");
        Ok(output.stdout_text())
    }

    fn events(&self, stack: &StackRef) -> Result<Vec<StackEvent>, CloudError> {
        let stdout = self.run(
            "describe-stack-events",
            &[
                "--stack-name".to_string(),
                stack.to_string(),
                "--max-items".to_string(),
                EVENT_PAGE_SIZE.to_string(),
            ],
        )?;
        parse_events(&stdout)
    }
}

impl StackClient for AwsCliStackClient {
    fn describe_stack(&self, stack: &StackRef) -> Result<StackDescription, CloudError> {
        let stdout = self.run(
            "describe-stacks",
            &["--stack-name".to_string(), stack.to_string()],
        )?;
        parse_description(&stdout)?.ok_or_else(|| CloudError::not_found(stack))
    }

    fn last_stack_event(
        &self,
        stack: &StackRef,
        filter: &EventFilter,
    ) -> Result<Option<StackEvent>, CloudError> {
        Ok(self.events(stack)?.into_iter().find(|e| filter.matches(e)))
    }

    fn recent_stack_events(&self, stack: &StackRef) -> Result<Vec<StackEvent>, CloudError> {
        self.events(stack)
    }

    fn create_stack(&self, deployment: &StackDeployment) -> Result<String, CloudError> {
        let stdout = self.run("create-stack", &deployment_args(deployment)?)?;
        parse_stack_id(&stdout)
    }

    fn update_stack(&self, deployment: &StackDeployment) -> Result<String, CloudError> {
        let stdout = self.run("update-stack", &deployment_args(deployment)?)?;
        parse_stack_id(&stdout)
    }

    fn delete_stack(&self, stack: &StackRef) -> Result<(), CloudError> {
        self.run("delete-stack", &["--stack-name".to_string(), stack.to_string()])?;
        Ok(())
    }
}

impl StackClientFactory for AwsCliStackClient {
    fn client(&self) -> Result<Box<dyn StackClient + '_>, CloudError> {
        Ok(Box::new(self))
    }
}

/// Map the CLI's stderr to a provider error.
pub fn parse_cli_error(stderr: &str) -> CloudError {
    let Some(caps) = stderr.lines().find_map(|line| CLI_ERROR_RE.captures(line)) else {
        let message = stderr.trim();
        let message = if message.is_empty() {
            "aws cli failed without output"
        } else {
            message
        };
        return CloudError::new(CloudErrorKind::Other, "CliError", message);
    };
    let code = caps.name("code").map_or("", |m| m.as_str()).trim();
    let message = caps.name("message").map_or("", |m| m.as_str()).trim();

    let kind = if code.contains("AccessDenied")
        || code.contains("Unauthorized")
        || code == "AuthorizationError"
    {
        CloudErrorKind::AccessDenied
    } else if code == "ValidationError" && message.contains("does not exist") {
        CloudErrorKind::NotFound
    } else if code == "ValidationError" && message.contains("No updates are to be performed") {
        CloudErrorKind::NoUpdates
    } else if code.starts_with("Throttl") {
        CloudErrorKind::Throttled
    } else if code == "ValidationError" {
        CloudErrorKind::Validation
    } else {
        CloudErrorKind::Other
    };
    CloudError::new(kind, code, message)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ParameterArg<'a> {
    parameter_key: &'a str,
    parameter_value: &'a str,
}

fn deployment_args(deployment: &StackDeployment) -> Result<Vec<String>, CloudError> {
    let mut args = vec![
        "--stack-name".to_string(),
        deployment.stack.to_string(),
        "--template-body".to_string(),
        deployment.template_body.clone(),
    ];
    if !deployment.parameters.is_empty() {
        let params: Vec<ParameterArg<'_>> = deployment
            .parameters
            .iter()
            .map(|(key, value)| ParameterArg {
                parameter_key: key,
                parameter_value: value,
            })
            .collect();
        let json = serde_json::to_string(&params).map_err(|err| {
            CloudError::new(CloudErrorKind::Validation, "InvalidParameters", err.to_string())
        })?;
        args.push("--parameters".to_string());
        args.push(json);
    }
    if !deployment.capabilities.is_empty() {
        args.push("--capabilities".to_string());
        args.extend(deployment.capabilities.iter().cloned());
    }
    if let Some(role) = &deployment.role_arn {
        args.push("--role-arn".to_string());
        args.push(role.clone());
    }
    Ok(args)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStacksResponse {
    #[serde(default)]
    stacks: Vec<StackJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackJson {
    stack_id: String,
    stack_name: String,
    stack_status: String,
    stack_status_reason: Option<String>,
    #[serde(default)]
    outputs: Vec<OutputJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OutputJson {
    output_key: String,
    output_value: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeEventsResponse {
    #[serde(default)]
    stack_events: Vec<EventJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EventJson {
    event_id: String,
    logical_resource_id: Option<String>,
    physical_resource_id: Option<String>,
    resource_type: Option<String>,
    resource_status: Option<String>,
    resource_status_reason: Option<String>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackIdResponse {
    stack_id: String,
}

fn malformed(err: serde_json::Error) -> CloudError {
    CloudError::new(
        CloudErrorKind::Other,
        "MalformedResponse",
        format!("unexpected aws cli output: {err}"),
    )
}

fn parse_description(stdout: &str) -> Result<Option<StackDescription>, CloudError> {
    let response: DescribeStacksResponse = serde_json::from_str(stdout).map_err(malformed)?;
    Ok(response.stacks.into_iter().next().map(|s| StackDescription {
        stack_id: s.stack_id,
        stack_name: s.stack_name,
        status: StackStatus::new(s.stack_status),
        status_reason: s.stack_status_reason,
        outputs: s
            .outputs
            .into_iter()
            .map(|o| StackOutput {
                key: o.output_key,
                value: o.output_value,
                description: o.description,
            })
            .collect(),
    }))
}

fn parse_events(stdout: &str) -> Result<Vec<StackEvent>, CloudError> {
    let response: DescribeEventsResponse = serde_json::from_str(stdout).map_err(malformed)?;
    Ok(response
        .stack_events
        .into_iter()
        .map(|e| StackEvent {
            event_id: e.event_id,
            logical_resource_id: e.logical_resource_id.unwrap_or_default(),
            physical_resource_id: e.physical_resource_id,
            resource_type: e.resource_type.unwrap_or_default(),
            status: StackStatus::new(e.resource_status.unwrap_or_default()),
            reason: e.resource_status_reason,
            timestamp: e.timestamp,
        })
        .collect())
}

fn parse_stack_id(stdout: &str) -> Result<String, CloudError> {
    let response: StackIdResponse = serde_json::from_str(stdout).map_err(malformed)?;
    Ok(response.stack_id)
}
