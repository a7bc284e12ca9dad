use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info};

use crate::core::context::{DeploymentContext, DirectoryMode, known};
use crate::pipeline::Convention;

/// Copies the extracted package to `Convey.Action.CustomInstallationDirectory`
/// and switches the context to that directory. Does nothing when the variable
/// is unset.
pub struct CopyToCustomDirectory;

impl Convention for CopyToCustomDirectory {
    fn name(&self) -> &str {
        "copy-to-custom-directory"
    }

    fn install(&self, ctx: &mut DeploymentContext) -> Result<()> {
        let Some(custom) = ctx.custom_directory() else {
            debug!("no {} set, staying in staging", known::CUSTOM_INSTALLATION_DIRECTORY);
            return Ok(());
        };
        let staging = ctx
            .staging_directory()
            .ok_or_else(|| anyhow!("package has not been extracted"))?;
        if is_within(&custom, &staging)? {
            bail!(
                "{} {} must not be inside the staging directory {}",
                known::CUSTOM_INSTALLATION_DIRECTORY,
                custom.display(),
                staging.display()
            );
        }

        copy_dir(&staging, &custom)
            .with_context(|| format!("copy {} to {}", staging.display(), custom.display()))?;
        ctx.set_directory_mode(DirectoryMode::Custom);
        info!(directory = %custom.display(), "copied package to custom installation directory");
        Ok(())
    }
}

/// Whether `path` equals `dir` or lies below it, once both are resolved.
fn is_within(path: &Path, dir: &Path) -> Result<bool> {
    let dir = fs::canonicalize(dir).with_context(|| format!("resolve {}", dir.display()))?;
    Ok(resolve_lenient(path)?.starts_with(dir))
}

/// Canonicalize the longest existing prefix of `path` and re-append the rest.
fn resolve_lenient(path: &Path) -> Result<PathBuf> {
    let absolute =
        std::path::absolute(path).with_context(|| format!("resolve {}", path.display()))?;
    let mut existing = absolute.as_path();
    let mut rest = Vec::new();
    loop {
        if let Ok(resolved) = fs::canonicalize(existing) {
            return Ok(rest.iter().rev().fold(resolved, |acc, part| acc.join(part)));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(absolute),
        }
    }
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).with_context(|| format!("create {}", to.display()))?;
    for entry in fs::read_dir(from).with_context(|| format!("read {}", from.display()))? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}
