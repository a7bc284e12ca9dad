//! Applies decoded service messages to the deployment context.

use tracing::{debug, info, warn};

use crate::core::context::DeploymentContext;
use crate::core::service_message::{PROGRESS, SET_VARIABLE, ServiceMessage, WARNING};
use crate::io::splitter::MessageSink;

/// What applying a message did to the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    VariableSet { name: String },
    Progress,
    Warning,
    Ignored,
}

/// Apply one message. Messages never fail the deployment: anything that cannot
/// be applied is logged and ignored.
pub fn apply_message(ctx: &mut DeploymentContext, message: &ServiceMessage) -> Applied {
    match message.name.as_str() {
        SET_VARIABLE => {
            let Some(name) = message.property("name").filter(|n| !n.trim().is_empty()) else {
                warn!("setVariable message without a name, ignoring");
                return Applied::Ignored;
            };
            let value = message.property("value").unwrap_or_default();
            let sensitive = message
                .property("sensitive")
                .is_some_and(|s| s.eq_ignore_ascii_case("true"));
            if sensitive {
                info!(name, "setting sensitive variable from process output");
            } else {
                info!(name, value, "setting variable from process output");
            }
            ctx.variables.set(name, value);
            Applied::VariableSet {
                name: name.to_string(),
            }
        }
        PROGRESS => {
            let percentage = message.property("percentage").unwrap_or("?");
            let text = message.property("message").unwrap_or_default();
            info!(percentage, "{text}");
            Applied::Progress
        }
        WARNING => {
            warn!("{}", message.property("message").unwrap_or_default());
            Applied::Warning
        }
        other => {
            debug!(name = other, "ignoring unknown service message");
            Applied::Ignored
        }
    }
}

/// Message sink that applies each message to a context as soon as it arrives.
pub struct ContextSink<'a> {
    ctx: &'a mut DeploymentContext,
    variables_set: Vec<String>,
}

impl<'a> ContextSink<'a> {
    pub fn new(ctx: &'a mut DeploymentContext) -> Self {
        Self {
            ctx,
            variables_set: Vec::new(),
        }
    }

    /// Names of variables set so far, in arrival order.
    pub fn variables_set(&self) -> &[String] {
        &self.variables_set
    }
}

impl MessageSink for ContextSink<'_> {
    fn receive(&mut self, message: ServiceMessage) {
        if let Applied::VariableSet { name } = apply_message(self.ctx, &message) {
            self.variables_set.push(name);
        }
    }
}
