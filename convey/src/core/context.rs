//! Deployment context threaded through every convention of a run.
//!
//! The context is created once per deployment, handed to each convention by
//! `&mut`, and dropped when the run ends. Directory paths are derived from
//! variables so a convention that changes a variable changes the paths seen by
//! every later convention.

use std::path::{Path, PathBuf};

use crate::core::variables::Variables;

/// Well-known variable names read or written by the agent.
pub mod known {
    pub const ACTION_NAME: &str = "Convey.Action.Name";
    pub const STAGING_DIRECTORY: &str = "Convey.Action.StagingDirectory";
    pub const CUSTOM_INSTALLATION_DIRECTORY: &str = "Convey.Action.CustomInstallationDirectory";
    pub const PACKAGE_KIND: &str = "Convey.Package.Kind";
    pub const STACK_NAME: &str = "Convey.Action.Aws.CloudFormationStackName";
    pub const STACK_TEMPLATE: &str = "Convey.Action.Aws.CloudFormationTemplate";
    pub const STACK_PARAMETERS: &str = "Convey.Action.Aws.CloudFormationParameters";
    pub const STACK_CAPABILITIES: &str = "Convey.Action.Aws.CloudFormationCapabilities";
    pub const STACK_WAIT: &str = "Convey.Action.Aws.WaitForCompletion";
    pub const STACK_ROLE_ARN: &str = "Convey.Action.Aws.CloudFormationRoleArn";
}

/// Which derived directory `current_directory` resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectoryMode {
    #[default]
    Staging,
    Custom,
}

#[derive(Debug, Clone)]
pub struct DeploymentContext {
    package_path: PathBuf,
    pub variables: Variables,
    directory_mode: DirectoryMode,
    last_error: Option<String>,
    last_error_detail: Option<String>,
}

impl DeploymentContext {
    pub fn new(package_path: impl Into<PathBuf>, variables: Variables) -> Self {
        Self {
            package_path: package_path.into(),
            variables,
            directory_mode: DirectoryMode::Staging,
            last_error: None,
            last_error_detail: None,
        }
    }

    pub fn package_path(&self) -> &Path {
        &self.package_path
    }

    pub fn staging_directory(&self) -> Option<PathBuf> {
        self.variables
            .get_non_empty(known::STAGING_DIRECTORY)
            .map(PathBuf::from)
    }

    pub fn set_staging_directory(&mut self, dir: &Path) {
        self.variables
            .set(known::STAGING_DIRECTORY, dir.to_string_lossy().to_string());
    }

    pub fn custom_directory(&self) -> Option<PathBuf> {
        self.variables
            .get_non_empty(known::CUSTOM_INSTALLATION_DIRECTORY)
            .map(PathBuf::from)
    }

    pub fn directory_mode(&self) -> DirectoryMode {
        self.directory_mode
    }

    pub fn set_directory_mode(&mut self, mode: DirectoryMode) {
        self.directory_mode = mode;
    }

    /// Directory conventions operate in.
    ///
    /// In `Custom` mode the custom directory wins when it is set; otherwise the
    /// staging directory is used. `None` only before extraction has run.
    pub fn current_directory(&self) -> Option<PathBuf> {
        match self.directory_mode {
            DirectoryMode::Custom => self.custom_directory().or_else(|| self.staging_directory()),
            DirectoryMode::Staging => self.staging_directory(),
        }
    }

    /// Name of the action owning this deployment, for log lines.
    pub fn action_name(&self) -> &str {
        self.variables
            .get_non_empty(known::ACTION_NAME)
            .unwrap_or("<unnamed action>")
    }

    /// Record the terminal failure of the run.
    pub fn record_error(&mut self, message: impl Into<String>, detail: impl Into<String>) {
        self.last_error = Some(message.into());
        self.last_error_detail = Some(detail.into());
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_error_detail(&self) -> Option<&str> {
        self.last_error_detail.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> DeploymentContext {
        DeploymentContext::new("/packages/web.1.0.zip", Variables::new())
    }

    #[test]
    fn current_directory_absent_before_extraction() {
        let ctx = context();
        assert_eq!(ctx.current_directory(), None);
    }

    #[test]
    fn staging_mode_ignores_custom_directory() {
        let mut ctx = context();
        ctx.set_staging_directory(Path::new("/work/staging"));
        ctx.variables
            .set(known::CUSTOM_INSTALLATION_DIRECTORY, "/srv/web");
        assert_eq!(ctx.current_directory(), Some(PathBuf::from("/work/staging")));
    }

    #[test]
    fn custom_mode_prefers_custom_directory() {
        let mut ctx = context();
        ctx.set_staging_directory(Path::new("/work/staging"));
        ctx.set_directory_mode(DirectoryMode::Custom);
        assert_eq!(ctx.current_directory(), Some(PathBuf::from("/work/staging")));

        ctx.variables
            .set(known::CUSTOM_INSTALLATION_DIRECTORY, "/srv/web");
        assert_eq!(ctx.current_directory(), Some(PathBuf::from("/srv/web")));
    }

    #[test]
    fn record_error_overwrites_previous() {
        let mut ctx = context();
        ctx.record_error("first", "first detail");
        ctx.record_error("second", "second detail");
        assert_eq!(ctx.last_error(), Some("second"));
        assert_eq!(ctx.last_error_detail(), Some("second detail"));
    }

    #[test]
    fn action_name_has_placeholder() {
        let mut ctx = context();
        assert_eq!(ctx.action_name(), "<unnamed action>");
        ctx.variables.set(known::ACTION_NAME, "Deploy web");
        assert_eq!(ctx.action_name(), "Deploy web");
    }
}
