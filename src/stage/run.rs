use kube::ResourceExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::ControlPlane;
use crate::cli::RunArgs;
use crate::config::{JobContext, RunConfig};
use crate::error::RunnerError;
use crate::instance::{PHASE_RUNNING, VirtualMachineInstance};
use crate::locate::find_job_vm;
use crate::logging::Diagnostics;
use crate::remote;
use crate::remote::ssh::ConnectParams;

/// The job's VM together with the run configuration it was created with.
#[derive(Debug)]
pub struct Target {
    pub vm: VirtualMachineInstance,
    pub run_config: RunConfig,
}

impl Target {
    pub fn host(&self) -> &str {
        // checked non-empty by `locate_target`
        self.vm.address().unwrap_or_default()
    }
}

/// Find the job VM and check it can take a script: it must be `Running` and
/// have an address.
pub async fn locate_target<C: ControlPlane>(
    cp: &C,
    job: &JobContext,
) -> Result<Target, RunnerError> {
    let vm = find_job_vm(cp, &job.namespace, &job.identity).await?;
    let run_config = RunConfig::from_instance(&vm)?;

    if vm.phase() != PHASE_RUNNING {
        return Err(RunnerError::NotRunning {
            name: vm.name_any(),
            phase: vm.phase().to_string(),
        });
    }
    if vm.address().is_none() {
        return Err(RunnerError::NoAddress { name: vm.name_any() });
    }
    Ok(Target { vm, run_config })
}

pub async fn run<C: ControlPlane>(
    cp: &C,
    job: &JobContext,
    args: &RunArgs,
    cancel: &CancellationToken,
    diag: Diagnostics,
) -> Result<(), RunnerError> {
    let target = locate_target(cp, job).await?;
    let params = ConnectParams {
        host: target.host(),
        ssh: &target.run_config.ssh,
        dial_timeout: args.dial_timeout,
        deadline: Instant::now() + args.retry_timeout,
    };
    remote::execute(
        &params,
        &target.run_config,
        &args.script,
        &args.stage,
        cancel,
        diag,
    )
    .await
}
