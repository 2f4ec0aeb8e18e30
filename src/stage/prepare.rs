use console::style;
use kube::ResourceExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::ControlPlane;
use crate::cli::PrepareArgs;
use crate::config::{JobContext, RunConfig};
use crate::error::RunnerError;
use crate::instance::VirtualMachineInstance;
use crate::logging::Diagnostics;
use crate::progress::Spinner;
use crate::provision::{create_job_vm, wait_until_ready};
use crate::remote::ssh::{ConnectParams, SshSession};

/// Create the job VM, wait for it to be ready, then make sure it accepts
/// ssh connections. Both waits share the `--timeout` deadline.
pub async fn run<C: ControlPlane>(
    cp: &C,
    job: JobContext,
    args: &PrepareArgs,
    cancel: &CancellationToken,
    diag: Diagnostics,
) -> Result<VirtualMachineInstance, RunnerError> {
    let deadline = Instant::now() + args.timeout;
    let (job, run_config, vm) = provision(cp, job, args, deadline, cancel).await?;
    print_summary(&vm, &job);

    let host = vm.address().ok_or_else(|| RunnerError::NoAddress {
        name: vm.name_any(),
    })?;
    eprintln!("Waiting for virtual machine to become reachable via ssh...");
    let params = ConnectParams {
        host,
        ssh: &run_config.ssh,
        dial_timeout: args.dial_timeout,
        deadline,
    };
    let spinner = Spinner::start(format!("connecting to {}", params.addr()));
    let session = SshSession::connect(&params, cancel, diag).await;
    spinner.finish();
    session?.disconnect().await;

    Ok(vm)
}

/// Everything `prepare` does before the ssh check.
pub async fn provision<C: ControlPlane>(
    cp: &C,
    mut job: JobContext,
    args: &PrepareArgs,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<(JobContext, RunConfig, VirtualMachineInstance), RunnerError> {
    job.apply_defaults(args);
    let run_config = RunConfig::from(&args.run_config);
    tracing::debug!(?run_config, namespace = %job.namespace, identity = %job.identity, "preparing");

    eprintln!("Creating Virtual Machine instance");
    let created = create_job_vm(cp, &job, &run_config).await?;
    let name = created.name_any();

    eprintln!("Waiting for Virtual Machine instance {name} to be ready...");
    let spinner = Spinner::start(format!("waiting for {name}"));
    let ready = wait_until_ready(cp, &job, &created, deadline, cancel).await;
    spinner.finish();

    Ok((job, run_config, ready?))
}

fn print_summary(vm: &VirtualMachineInstance, job: &JobContext) {
    let label = |s: &'static str| style(s).for_stderr().bold();
    eprintln!(
        "{}",
        style("Virtual Machine instance is ready.").for_stderr().green()
    );
    eprintln!("{} {}", label("Name:"), vm.name_any());
    eprintln!("{} {}", label("Image:"), job.image);
    eprintln!("{} {}", label("Node:"), vm.node_name().unwrap_or_default());
    eprintln!("{} {}", label("IP:"), vm.address().unwrap_or_default());
}
