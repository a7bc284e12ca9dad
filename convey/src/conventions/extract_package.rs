use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::core::context::DeploymentContext;
use crate::io::extractor::{ExtractorRegistry, PackageKind};
use crate::pipeline::Convention;

/// Unpacks the package into the staging directory and records that directory
/// on the context.
///
/// A staging directory already present in the variables is reused; otherwise
/// one is derived from the package file name under `staging_root`.
pub struct ExtractPackage {
    registry: ExtractorRegistry,
    staging_root: PathBuf,
}

impl ExtractPackage {
    pub fn new(registry: ExtractorRegistry, staging_root: &Path) -> Self {
        Self {
            registry,
            staging_root: staging_root.to_path_buf(),
        }
    }

    fn destination(&self, ctx: &DeploymentContext) -> PathBuf {
        if let Some(dir) = ctx.staging_directory() {
            return dir;
        }
        let file_name = ctx
            .package_path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "package".to_string());
        let stem = file_name.split('.').next().unwrap_or("package");
        let stem = if stem.is_empty() { "package" } else { stem };
        self.staging_root.join(stem)
    }
}

impl Convention for ExtractPackage {
    fn name(&self) -> &str {
        "extract-package"
    }

    fn install(&self, ctx: &mut DeploymentContext) -> Result<()> {
        let package = ctx.package_path().to_path_buf();
        let destination = self.destination(ctx);
        let kind = PackageKind::for_context(ctx)?;
        let extractor = self.registry.create_extractor(&kind)?;

        let report = extractor
            .extract(&package, &destination, ctx)
            .with_context(|| format!("extract {}", package.display()))?;
        ctx.set_staging_directory(&destination);
        info!(
            extractor = %report.extractor,
            files = ?report.files,
            destination = %destination.display(),
            "package extracted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::known;
    use crate::core::variables::Variables;
    use crate::io::extractor::{ExtractError, ZipExtractor};
    use crate::test_support::write_zip;

    #[test]
    fn extracts_into_derived_staging_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let package = temp.path().join("web.1.0.0.zip");
        write_zip(&package, &[("Deploy.sh", "echo hi")]).expect("zip");
        let staging_root = temp.path().join("staging");
        let step = ExtractPackage::new(
            ExtractorRegistry::new(vec![Box::new(ZipExtractor)]),
            &staging_root,
        );
        let mut ctx = DeploymentContext::new(&package, Variables::new());

        step.install(&mut ctx).expect("install");
        let staging = ctx.staging_directory().expect("staging set");
        assert_eq!(staging, staging_root.join("web"));
        assert!(staging.join("Deploy.sh").exists());
        assert_eq!(ctx.current_directory(), Some(staging));
    }

    #[test]
    fn reuses_configured_staging_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let package = temp.path().join("web.zip");
        write_zip(&package, &[("a.txt", "a")]).expect("zip");
        let chosen = temp.path().join("chosen");
        let mut vars = Variables::new();
        vars.set(known::STAGING_DIRECTORY, chosen.to_string_lossy().to_string());
        let step = ExtractPackage::new(
            ExtractorRegistry::new(vec![Box::new(ZipExtractor)]),
            temp.path(),
        );
        let mut ctx = DeploymentContext::new(&package, vars);

        step.install(&mut ctx).expect("install");
        assert!(chosen.join("a.txt").exists());
    }

    #[test]
    fn unknown_kind_surfaces_typed_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let step = ExtractPackage::new(ExtractorRegistry::new(Vec::new()), temp.path());
        let mut ctx = DeploymentContext::new(temp.path().join("web.rpm"), Variables::new());

        let err = step.install(&mut ctx).expect_err("no extractor");
        assert!(matches!(
            err.downcast_ref::<ExtractError>(),
            Some(ExtractError::NoExtractor { kind }) if kind == "rpm"
        ));
    }
}
