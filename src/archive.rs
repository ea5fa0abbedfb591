//! Archive creation through an external command

use crate::PackagerError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tracing::debug;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArchiveBuilder: Send + Sync {
    /// Compress `input` into a new archive at `output`.
    async fn create_archive(&self, input: &Path, output: &Path) -> Result<(), PackagerError>;
}

/// Runs the configured zip command with `{input}` and `{output}` substituted.
///
/// The template is tokenized once, shell-style, and each token is
/// substituted separately, so paths never need quoting and no shell is
/// involved.
#[derive(Debug, Clone)]
pub struct CommandArchiveBuilder {
    template: Vec<String>,
}

impl CommandArchiveBuilder {
    pub fn new(template: &str) -> Result<Self, PackagerError> {
        let template = shlex::split(template)
            .filter(|parts| !parts.is_empty())
            .ok_or_else(|| {
                PackagerError::Configuration(format!("cannot parse zip command: {template}"))
            })?;
        Ok(Self { template })
    }

    pub fn command_line(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.template
            .iter()
            .map(|part| part.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }
}

#[async_trait]
impl ArchiveBuilder for CommandArchiveBuilder {
    async fn create_archive(&self, input: &Path, output: &Path) -> Result<(), PackagerError> {
        let argv = self.command_line(input, output);
        debug!("Running archive command: {}", argv.join(" "));

        let result = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PackagerError::ArchiveFailure(format!("failed to run {}: {e}", argv[0])))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(PackagerError::ArchiveFailure(format!(
                "{} exited with {}: {}",
                argv[0],
                result.status,
                stderr.trim()
            )));
        }

        if !output.exists() {
            return Err(PackagerError::ArchiveFailure(format!(
                "{} produced no archive at {}",
                argv[0],
                output.display()
            )));
        }

        Ok(())
    }
}
