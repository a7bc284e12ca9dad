//! Concrete install steps and the standard deployment order.

pub mod custom_directory;
pub mod deploy_stack;
pub mod extract_package;
pub mod script;

use crate::core::cancel::CancellationToken;
use crate::io::aws_cli::AwsCliStackClient;
use crate::io::config::AgentConfig;
use crate::io::extractor::ExtractorRegistry;
use crate::io::process::ProcessOptions;
use crate::pipeline::Convention;
use crate::stack::poll::StackPoller;

pub use custom_directory::CopyToCustomDirectory;
pub use deploy_stack::DeployStack;
pub use extract_package::ExtractPackage;
pub use script::{PackagedScript, ScriptError, ScriptPhase};

/// Steps run by `convey deploy`, in order.
pub fn standard_conventions(
    cfg: &AgentConfig,
    staging_root: &std::path::Path,
    cancel: &CancellationToken,
) -> Vec<Box<dyn Convention>> {
    let options = ProcessOptions::new(cfg.process_timeout()).with_cancel(cancel.clone());
    let registry = ExtractorRegistry::from_config(cfg, &options);
    let poller = StackPoller::new(cfg.stack.poll_interval(), cfg.stack.wait_timeout());
    let client = AwsCliStackClient::from_config(cfg, options.clone());

    vec![
        Box::new(ExtractPackage::new(registry, staging_root)),
        Box::new(CopyToCustomDirectory),
        Box::new(PackagedScript::new(ScriptPhase::PreDeploy, options.clone())),
        Box::new(PackagedScript::new(ScriptPhase::Deploy, options.clone())),
        Box::new(DeployStack::new(client, poller, cancel.clone())),
        Box::new(PackagedScript::new(ScriptPhase::PostDeploy, options)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let steps = standard_conventions(
            &AgentConfig::default(),
            temp.path(),
            &CancellationToken::new(),
        );
        let names: Vec<&str> = steps.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "extract-package",
                "copy-to-custom-directory",
                "pre-deploy-script",
                "deploy-script",
                "deploy-stack",
                "post-deploy-script",
            ]
        );
    }
}
