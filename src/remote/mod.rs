//! Running job scripts on the VM.

pub mod backoff;
pub mod shell;
pub mod ssh;

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::error::{RemoteExit, RunnerError};
use crate::logging::Diagnostics;
use crate::util::shell_join;
use shell::Shell;
use ssh::{ConnectParams, SshSession};

/// A connected transport able to place a file on the VM and run a command.
#[allow(async_fn_in_trait)]
pub trait RemoteSession {
    async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), RunnerError>;

    /// Run `command` through the remote login shell, streaming its output to
    /// ours, and report how it ended.
    async fn exec(&mut self, command: &str) -> Result<RemoteExit, RunnerError>;
}

/// Upload `script` for `stage` and run it with `shell`.
///
/// Anything but a zero exit status is a build failure.
pub async fn run_script<S: RemoteSession>(
    session: &mut S,
    shell: &dyn Shell,
    script: &Path,
    stage: &str,
    diag: Diagnostics,
) -> Result<(), RunnerError> {
    let remote_path = shell.remote_path(stage);

    diag.script_contents(script);
    session.upload(script, &remote_path).await?;

    let argv = shell.invocation(&remote_path);
    diag.command(&argv);
    match session.exec(&shell_join(&argv)).await? {
        RemoteExit::Status(0) => Ok(()),
        exit => Err(RunnerError::BuildFailure { exit }),
    }
}

/// Connect to the VM at `params.host` and run one stage script there.
pub async fn execute(
    params: &ConnectParams<'_>,
    run_config: &RunConfig,
    script: &Path,
    stage: &str,
    cancel: &CancellationToken,
    diag: Diagnostics,
) -> Result<(), RunnerError> {
    let mut session = SshSession::connect(params, cancel, diag).await?;
    let result = run_script(&mut session, run_config.shell(), script, stage, diag).await;
    session.disconnect().await;
    result
}
