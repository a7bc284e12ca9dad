//! Package extraction: a read-only registry of extractors keyed by package kind.

use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::core::context::{DeploymentContext, known};
use crate::io::config::{AgentConfig, ExtractorConfig};
use crate::io::process::{ProcessOptions, run_split_command};
use crate::io::service_channel::ContextSink;
use crate::io::splitter::{OutputSplitter, StdoutConsole};

/// Extensions made of two dot-separated parts.
const DOUBLE_EXTENSIONS: &[&str] = &["tar.gz", "tar.bz2", "tar.xz", "tar.zst"];

/// Discriminator used to pick an extractor, normally the lowercased file extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageKind(String);

impl PackageKind {
    pub fn new(kind: &str) -> Self {
        Self(kind.trim().trim_start_matches('.').to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Kind derived from the file name. `None` when there is no extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if let Some(double) = DOUBLE_EXTENSIONS
            .iter()
            .find(|ext| file_name.len() > ext.len() + 1 && file_name.ends_with(&format!(".{ext}")))
        {
            return Some(Self::new(double));
        }
        let (stem, ext) = file_name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(Self::new(ext))
    }

    /// Kind for the context's package: the `Convey.Package.Kind` variable wins
    /// over the file extension.
    pub fn for_context(ctx: &DeploymentContext) -> Result<Self, ExtractError> {
        if let Some(kind) = ctx.variables.get_non_empty(known::PACKAGE_KIND) {
            return Ok(Self::new(kind));
        }
        Self::from_path(ctx.package_path()).ok_or_else(|| ExtractError::UnknownKind {
            path: ctx.package_path().to_path_buf(),
        })
    }
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no extractor registered for package kind '{kind}'")]
    NoExtractor { kind: String },
    #[error("cannot determine package kind of {} (set {var})", .path.display(), var = known::PACKAGE_KIND)]
    UnknownKind { path: PathBuf },
    #[error("extractor tool {tool} failed: {reason}")]
    ToolFailed { tool: String, reason: String },
    #[error("archive entry {name:?} escapes the destination directory")]
    UnsafeEntry { name: String },
    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl ExtractError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractReport {
    pub extractor: String,
    pub destination: PathBuf,
    /// Files written, when the extractor can tell.
    pub files: Option<usize>,
}

pub trait Extractor {
    fn name(&self) -> &str;
    fn supports(&self, kind: &PackageKind) -> bool;
    fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        ctx: &mut DeploymentContext,
    ) -> Result<ExtractReport, ExtractError>;
}

/// In-process zip extraction.
#[derive(Debug, Default)]
pub struct ZipExtractor;

impl Extractor for ZipExtractor {
    fn name(&self) -> &str {
        "zip"
    }

    fn supports(&self, kind: &PackageKind) -> bool {
        matches!(kind.as_str(), "zip" | "nupkg")
    }

    #[instrument(skip_all, fields(archive = %archive.display(), destination = %destination.display()))]
    fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        _ctx: &mut DeploymentContext,
    ) -> Result<ExtractReport, ExtractError> {
        let file = File::open(archive).map_err(|e| ExtractError::io(archive, e))?;
        let mut zip = zip::ZipArchive::new(file)?;
        fs::create_dir_all(destination).map_err(|e| ExtractError::io(destination, e))?;

        let mut files = 0usize;
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index)?;
            let Some(relative) = entry.enclosed_name() else {
                return Err(ExtractError::UnsafeEntry {
                    name: entry.name().to_string(),
                });
            };
            let target = destination.join(relative);
            if entry.is_dir() {
                fs::create_dir_all(&target).map_err(|e| ExtractError::io(&target, e))?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| ExtractError::io(parent, e))?;
            }
            let mut out = File::create(&target).map_err(|e| ExtractError::io(&target, e))?;
            std::io::copy(&mut entry, &mut out).map_err(|e| ExtractError::io(&target, e))?;
            #[cfg(unix)]
            if let Some(mode) = entry.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                    .map_err(|e| ExtractError::io(&target, e))?;
            }
            debug!(file = %target.display(), "extracted");
            files += 1;
        }

        Ok(ExtractReport {
            extractor: self.name().to_string(),
            destination: destination.to_path_buf(),
            files: Some(files),
        })
    }
}

/// Runs an external program to unpack the archive.
///
/// The program's output goes through the splitter, so a tool can report
/// variables back with service messages.
#[derive(Debug, Clone)]
pub struct ExternalToolExtractor {
    name: String,
    kinds: Vec<PackageKind>,
    command: Vec<String>,
    options: ProcessOptions,
}

impl ExternalToolExtractor {
    pub fn new(config: &ExtractorConfig, options: ProcessOptions) -> Self {
        Self {
            name: config.name.clone(),
            kinds: config.kinds.iter().map(|k| PackageKind::new(k)).collect(),
            command: config.command.clone(),
            options,
        }
    }

    fn render(&self, archive: &Path, destination: &Path) -> Vec<String> {
        let archive = archive.to_string_lossy();
        let destination = destination.to_string_lossy();
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{archive}", &archive)
                    .replace("{destination}", &destination)
            })
            .collect()
    }
}

impl Extractor for ExternalToolExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, kind: &PackageKind) -> bool {
        self.kinds.contains(kind)
    }

    #[instrument(skip_all, fields(tool = %self.name, archive = %archive.display()))]
    fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        ctx: &mut DeploymentContext,
    ) -> Result<ExtractReport, ExtractError> {
        fs::create_dir_all(destination).map_err(|e| ExtractError::io(destination, e))?;
        let archive = fs::canonicalize(archive).map_err(|e| ExtractError::io(archive, e))?;
        let argv = self.render(&archive, destination);
        let Some((program, args)) = argv.split_first() else {
            return Err(ExtractError::ToolFailed {
                tool: self.name.clone(),
                reason: "empty command".to_string(),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(destination);

        let mut splitter = OutputSplitter::new(StdoutConsole, ContextSink::new(ctx));
        let run = run_split_command(cmd, &self.options, &mut splitter).map_err(|err| {
            ExtractError::ToolFailed {
                tool: self.name.clone(),
                reason: format!("{err:#}"),
            }
        })?;

        let reason = if run.timed_out {
            Some("timed out".to_string())
        } else if run.cancelled {
            Some("cancelled".to_string())
        } else if !run.status.success() {
            Some(match run.status.code() {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            })
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(ExtractError::ToolFailed {
                tool: self.name.clone(),
                reason,
            });
        }

        Ok(ExtractReport {
            extractor: self.name.clone(),
            destination: destination.to_path_buf(),
            files: None,
        })
    }
}

/// Immutable table of extractors, searched in registration order.
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new(extractors: Vec<Box<dyn Extractor>>) -> Self {
        Self { extractors }
    }

    /// Built-in zip extractor followed by the configured external tools.
    pub fn from_config(cfg: &AgentConfig, options: &ProcessOptions) -> Self {
        let mut extractors: Vec<Box<dyn Extractor>> = vec![Box::new(ZipExtractor)];
        for tool in &cfg.extractors {
            extractors.push(Box::new(ExternalToolExtractor::new(tool, options.clone())));
        }
        Self::new(extractors)
    }

    pub fn create_extractor(&self, kind: &PackageKind) -> Result<&dyn Extractor, ExtractError> {
        let extractor = self
            .extractors
            .iter()
            .find(|e| e.supports(kind))
            .map(|e| &**e)
            .ok_or_else(|| ExtractError::NoExtractor {
                kind: kind.to_string(),
            })?;
        info!(kind = %kind, extractor = extractor.name(), "selected extractor");
        Ok(extractor)
    }

    pub fn names(&self) -> Vec<&str> {
        self.extractors.iter().map(|e| e.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::variables::Variables;
    use crate::test_support::write_zip;

    #[test]
    fn kind_from_path_handles_double_extensions() {
        assert_eq!(
            PackageKind::from_path(Path::new("/p/app.1.2.ZIP")),
            Some(PackageKind::new("zip"))
        );
        assert_eq!(
            PackageKind::from_path(Path::new("bundle.tar.gz")),
            Some(PackageKind::new("tar.gz"))
        );
        assert_eq!(PackageKind::from_path(Path::new("README")), None);
        assert_eq!(PackageKind::from_path(Path::new(".hidden")), None);
    }

    #[test]
    fn kind_variable_overrides_extension() {
        let mut vars = Variables::new();
        vars.set(known::PACKAGE_KIND, ".JAR");
        let ctx = DeploymentContext::new("app.zip", vars);
        assert_eq!(
            PackageKind::for_context(&ctx).expect("kind"),
            PackageKind::new("jar")
        );
    }

    #[test]
    fn unknown_kind_has_no_extractor() {
        let registry = ExtractorRegistry::new(vec![Box::new(ZipExtractor)]);
        let err = registry
            .create_extractor(&PackageKind::new("rpm"))
            .err()
            .expect("no extractor");
        assert!(matches!(err, ExtractError::NoExtractor { ref kind } if kind == "rpm"));
    }

    #[test]
    fn registry_prefers_first_match() {
        let tool = ExtractorConfig {
            name: "unzip".to_string(),
            kinds: vec!["zip".to_string()],
            command: vec!["unzip".to_string(), "{archive}".to_string()],
        };
        let cfg = AgentConfig {
            extractors: vec![tool],
            ..AgentConfig::default()
        };
        let registry =
            ExtractorRegistry::from_config(&cfg, &ProcessOptions::new(Duration::from_secs(5)));
        assert_eq!(registry.names(), vec!["zip", "unzip"]);
        let chosen = registry
            .create_extractor(&PackageKind::new("zip"))
            .expect("extractor");
        assert_eq!(chosen.name(), "zip");
    }

    #[test]
    fn zip_extracts_nested_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let archive = temp.path().join("app.zip");
        write_zip(&archive, &[("bin/run.sh", "echo"), ("config.json", "{}")]).expect("zip");
        let dest = temp.path().join("out");
        let mut ctx = DeploymentContext::new(&archive, Variables::new());

        let report = ZipExtractor
            .extract(&archive, &dest, &mut ctx)
            .expect("extract");
        assert_eq!(report.files, Some(2));
        assert_eq!(
            fs::read_to_string(dest.join("bin/run.sh")).expect("read"),
            "echo"
        );
    }

    #[test]
    fn zip_rejects_traversal_entries() {
        let temp = tempfile::tempdir().expect("tempdir");
        let archive = temp.path().join("evil.zip");
        write_zip(&archive, &[("../escape.txt", "boom")]).expect("zip");
        let dest = temp.path().join("out");
        let mut ctx = DeploymentContext::new(&archive, Variables::new());

        let err = ZipExtractor
            .extract(&archive, &dest, &mut ctx)
            .expect_err("unsafe");
        assert!(matches!(err, ExtractError::UnsafeEntry { .. }));
        assert!(!temp.path().join("escape.txt").exists());
    }

    #[test]
    fn corrupt_zip_is_archive_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let archive = temp.path().join("broken.zip");
        fs::write(&archive, b"not a zip").expect("write");
        let mut ctx = DeploymentContext::new(&archive, Variables::new());
        let err = ZipExtractor
            .extract(&archive, &temp.path().join("out"), &mut ctx)
            .expect_err("corrupt");
        assert!(matches!(err, ExtractError::Archive(_)));
    }

    #[cfg(unix)]
    #[test]
    fn external_tool_applies_service_messages() {
        use crate::core::service_message::ServiceMessage;

        let temp = tempfile::tempdir().expect("tempdir");
        let archive = temp.path().join("app.tgz");
        fs::write(&archive, b"payload").expect("write");
        let line = ServiceMessage::set_variable("Extracted.By", "tool", false).to_line();
        let tool = ExtractorConfig {
            name: "copy".to_string(),
            kinds: vec!["tgz".to_string()],
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("cp \"{{archive}}\" payload && echo \"{line}\""),
            ],
        };
        let extractor =
            ExternalToolExtractor::new(&tool, ProcessOptions::new(Duration::from_secs(10)));
        let dest = temp.path().join("out");
        let mut ctx = DeploymentContext::new(&archive, Variables::new());

        extractor
            .extract(&archive, &dest, &mut ctx)
            .expect("extract");
        assert!(dest.join("payload").exists());
        assert_eq!(ctx.variables.get("extracted.by"), Some("tool"));
    }

    #[cfg(unix)]
    #[test]
    fn external_tool_nonzero_exit_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let archive = temp.path().join("app.tgz");
        fs::write(&archive, b"payload").expect("write");
        let tool = ExtractorConfig {
            name: "broken".to_string(),
            kinds: vec!["tgz".to_string()],
            command: vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
        };
        let extractor =
            ExternalToolExtractor::new(&tool, ProcessOptions::new(Duration::from_secs(10)));
        let mut ctx = DeploymentContext::new(&archive, Variables::new());

        let err = extractor
            .extract(&archive, &temp.path().join("out"), &mut ctx)
            .expect_err("fails");
        match err {
            ExtractError::ToolFailed { tool, reason } => {
                assert_eq!(tool, "broken");
                assert_eq!(reason, "exit code 3");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
