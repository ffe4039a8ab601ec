// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Installer that shells out to an external executable.
//!
//! The executable is invoked as `<program> [args...] <create|update|delete>`
//! with the cluster document as JSON on stdin and `CIRRUS_CLUSTER_KEY` in its
//! environment. Exit code zero means success.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, error, info, warn};

use super::{ClusterInstaller, InstallContext, InstallerError, Workflow};

/// Environment variable carrying the cluster key to the child.
pub const CLUSTER_KEY_ENV: &str = "CIRRUS_CLUSTER_KEY";

/// Runs one child process per workflow call.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    program: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl CommandInstaller {
    /// Run `program` with no leading arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Parse a whitespace-separated command line: program followed by
    /// leading arguments.
    pub fn from_command_line(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next()?;
        Some(Self {
            program: PathBuf::from(program),
            args: parts.map(str::to_string).collect(),
            env: HashMap::new(),
        })
    }

    /// Append a leading argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an extra environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    async fn run(&self, workflow: Workflow, ctx: &InstallContext) -> Result<(), InstallerError> {
        let input = serde_json::to_vec(ctx.document())?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(workflow.as_str())
            .env(CLUSTER_KEY_ENV, ctx.key())
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        debug!(
            resource = %ctx.key(),
            workflow = workflow.as_str(),
            program = %self.program.display(),
            pid = child.id().unwrap_or_default(),
            "Installer process spawned"
        );

        // Drain stderr concurrently so a chatty child cannot fill the pipe and stall.
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        // A child that never reads its input must not block cancellation.
        tokio::select! {
            fed = feed_stdin(child.stdin.take(), &input) => fed?,
            _ = ctx.cancellation_token().cancelled() => {
                warn!(resource = %ctx.key(), workflow = workflow.as_str(), "Installation cancelled while writing input, killing process");
                let _ = child.kill().await;
                return Err(InstallerError::Cancelled);
            }
        }

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    info!(resource = %ctx.key(), workflow = workflow.as_str(), "Installer process completed");
                    return Ok(());
                }
                let stderr = match stderr_task {
                    Some(task) => task.await.unwrap_or_default().trim().to_string(),
                    None => String::new(),
                };
                let exit_code = status.code().unwrap_or(-1);
                error!(
                    resource = %ctx.key(),
                    workflow = workflow.as_str(),
                    exit_code,
                    stderr = %stderr,
                    "Installer process failed"
                );
                Err(InstallerError::ExitCode { exit_code, stderr })
            }
            _ = ctx.cancellation_token().cancelled() => {
                warn!(resource = %ctx.key(), workflow = workflow.as_str(), "Installation cancelled, killing process");
                let _ = child.kill().await;
                Err(InstallerError::Cancelled)
            }
        }
    }
}

/// Write `input` to the child and close its stdin.
///
/// A child that exits without reading its input is judged by its exit code.
async fn feed_stdin(stdin: Option<ChildStdin>, input: &[u8]) -> std::io::Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    match stdin.write_all(input).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl ClusterInstaller for CommandInstaller {
    async fn create(&self, ctx: &InstallContext) -> Result<(), InstallerError> {
        self.run(Workflow::Create, ctx).await
    }

    async fn update(&self, ctx: &InstallContext) -> Result<(), InstallerError> {
        self.run(Workflow::Update, ctx).await
    }

    async fn delete(&self, ctx: &InstallContext) -> Result<(), InstallerError> {
        self.run(Workflow::Delete, ctx).await
    }

    fn installer_type(&self) -> &'static str {
        "command"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use cirrus_store::MemoryStore;
    use tokio_util::sync::CancellationToken;

    use crate::api::{ClusterDocument, ProvisioningState};
    use crate::database::{ClusterRepository, RepositoryConfig};

    const KEY: &str =
        "/subscriptions/s/resourcegroups/rg/providers/microsoft.redhatopenshift/openshiftclusters/c";

    async fn context(cancel: CancellationToken) -> InstallContext {
        context_for(cancel, ClusterDocument::new(KEY, ProvisioningState::Creating)).await
    }

    async fn context_for(cancel: CancellationToken, doc: ClusterDocument) -> InstallContext {
        let clusters = ClusterRepository::new(
            Arc::new(MemoryStore::new()),
            "w1",
            &RepositoryConfig::default(),
        )
        .await
        .unwrap();
        InstallContext::new(cancel, doc, clusters)
    }

    fn sh(script: &str) -> CommandInstaller {
        // `sh -c <script> <$0>` receives the workflow name as $1.
        CommandInstaller::new("sh").arg("-c").arg(script).arg("installer")
    }

    #[test]
    fn test_from_command_line() {
        let installer = CommandInstaller::from_command_line("  /bin/installer --region eu ").unwrap();
        assert_eq!(installer.program, PathBuf::from("/bin/installer"));
        assert_eq!(installer.args, vec!["--region", "eu"]);
        assert!(CommandInstaller::from_command_line("   ").is_none());
    }

    #[tokio::test]
    async fn test_success_receives_workflow_key_and_document() {
        let ctx = context(CancellationToken::new()).await;
        let script = format!(
            r#"test "$1" = create && test "${CLUSTER_KEY_ENV}" = "{KEY}" && grep -q '"key":"{KEY}"'"#
        );
        sh(&script).create(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_stderr() {
        let ctx = context(CancellationToken::new()).await;
        let err = sh("echo \"cannot $1\" >&2; exit 3")
            .delete(&ctx)
            .await
            .unwrap_err();
        match err {
            InstallerError::ExitCode { exit_code, stderr } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "cannot delete");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let cancel = CancellationToken::new();
        let ctx = context(cancel.clone()).await;
        let installer = sh("sleep 30");

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let started = std::time::Instant::now();
        let err = installer.update(&ctx).await.unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, InstallerError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation_while_child_ignores_input() {
        let cancel = CancellationToken::new();
        let mut doc = ClusterDocument::new(KEY, ProvisioningState::Creating);
        // Far larger than a pipe buffer, so the write cannot complete.
        doc.extra
            .insert("padding".to_string(), serde_json::json!("x".repeat(4 << 20)));
        let ctx = context_for(cancel.clone(), doc).await;
        let installer = sh("sleep 30");

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let started = std::time::Instant::now();
        let err = installer.create(&ctx).await.unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, InstallerError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let ctx = context(CancellationToken::new()).await;
        let err = CommandInstaller::new("/nonexistent/cirrus-installer")
            .create(&ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallerError::Io(_)));
    }
}
