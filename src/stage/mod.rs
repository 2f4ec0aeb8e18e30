//! The four custom-executor stages. Each invocation of the binary runs one of
//! them; they share nothing but the cluster and the job identity.

pub mod cleanup;
pub mod config;
pub mod prepare;
pub mod run;

use tokio_util::sync::CancellationToken;

use crate::backend::kubevirt::KubeVirtBackend;
use crate::cli::{Cli, Command};
use crate::config::JobContext;
use crate::error::RunnerError;
use crate::logging::Diagnostics;

pub async fn dispatch(cli: Cli, cancel: &CancellationToken) -> Result<(), RunnerError> {
    let diag = Diagnostics::new(cli.debug);
    let job = JobContext::from_args(&cli.job);
    tracing::debug!(identity = %job.identity, namespace = %job.namespace, "job context");

    match cli.command {
        Command::Config => config::run(),
        Command::Prepare(args) => {
            let cp = KubeVirtBackend::connect().await?;
            prepare::run(&cp, job, &args, cancel, diag).await?;
            Ok(())
        }
        Command::Run(args) => {
            let cp = KubeVirtBackend::connect().await?;
            run::run(&cp, &job, &args, cancel, diag).await
        }
        Command::Cleanup(args) => {
            let cp = KubeVirtBackend::connect().await?;
            cleanup::run(&cp, &job, &args, cancel).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use kube::ResourceExt;

    use super::*;
    use crate::backend::WatchEvent;
    use crate::backend::memory::MemoryControlPlane;
    use crate::cli::{CleanupArgs, PrepareArgs};
    use crate::deprovision::CleanupOutcome;
    use crate::error::RemoteExit;
    use crate::config::RunConfig;
    use crate::exit;
    use crate::instance::VirtualMachineInstance;
    use crate::instance::tests::with_status;
    use crate::remote::run_script;
    use crate::remote::tests::RecordingSession;

    const JOB: [&str; 11] = [
        "gitlab-runner-kubevirt",
        "--runner-id",
        "r1",
        "--project-id",
        "p1",
        "--concurrent-id",
        "c1",
        "--job-id",
        "j1",
        "--image",
        "img:latest",
    ];

    fn parse(stage: &[&str]) -> Cli {
        Cli::try_parse_from(JOB.iter().chain(stage)).unwrap()
    }

    fn prepare_args(cli: &Cli) -> &PrepareArgs {
        match &cli.command {
            Command::Prepare(args) => args,
            _ => unreachable!(),
        }
    }

    fn no_overrides(_: &str) -> Option<String> {
        None
    }

    /// Make the created instance look like KubeVirt booted it.
    fn boot(cp: &MemoryControlPlane, ip: &str) -> VirtualMachineInstance {
        let mut vm = cp.created().remove(0);
        vm.status = with_status(&vm.name_any(), "Running", Some(ip), true).status;
        cp.put(vm.clone());
        vm
    }

    #[tokio::test(start_paused = true)]
    async fn provision_run_and_build_failure() {
        let cp = MemoryControlPlane::new();
        cp.push_watch_session(vec![Ok(WatchEvent::Modified(with_status(
            "runner-r1-project-p1-concurrent-c1-00001",
            "Running",
            Some("10.1.2.3"),
            true,
        )))]);
        let cancel = CancellationToken::new();

        // prepare
        let cli = parse(&["prepare", "--shell", "bash", "--ssh-user", "runner", "--ssh-password", "pw"]);
        let job = JobContext::from_args(&cli.job);
        let args = prepare_args(&cli);
        let deadline = tokio::time::Instant::now() + args.timeout;
        let (job, _, ready) = prepare::provision(&cp, job, args, deadline, &cancel)
            .await
            .unwrap();
        assert_eq!(ready.address(), Some("10.1.2.3"));

        let created = cp.created().remove(0);
        assert!(created
            .name_any()
            .starts_with("runner-r1-project-p1-concurrent-c1-"));
        assert_eq!(
            created.labels()[crate::instance::ID_LABEL],
            crate::identity::JobIdentity::for_job("r1", "p1", "c1", "j1").as_str()
        );
        let resources = &created.spec.domain.resources;
        assert_eq!(resources.requests["cpu"].0, "1");
        assert_eq!(resources.limits["memory"].0, "1Gi");
        assert!(!resources.requests.contains_key("ephemeral-storage"));
        assert_eq!(
            created.spec.volumes[0].container_disk.as_ref().unwrap().image,
            "img:latest"
        );

        // run, as a later process would: look the VM up from scratch
        boot(&cp, "10.1.2.3");
        let target = run::locate_target(&cp, &job).await.unwrap();
        assert_eq!(target.host(), "10.1.2.3");
        assert_eq!(target.run_config.ssh.user, "runner");

        let mut session = RecordingSession {
            exit: Some(RemoteExit::Status(1)),
            ..Default::default()
        };
        let err = run_script(
            &mut session,
            target.run_config.shell(),
            std::path::Path::new("/builds/script"),
            "build_script",
            Diagnostics::default(),
        )
        .await
        .unwrap_err();

        assert_eq!(session.uploads[0].1, "build_script.bash");
        assert_eq!(session.commands, vec!["bash build_script.bash"]);
        assert_eq!(exit::resolve(err.class(), no_overrides), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn provisioning_timeout_is_a_system_failure() {
        let cp = MemoryControlPlane::new();
        let cancel = CancellationToken::new();

        let cli = parse(&["prepare", "--shell", "bash", "--timeout", "30s"]);
        let job = JobContext::from_args(&cli.job);
        let args = prepare_args(&cli);
        let deadline = tokio::time::Instant::now() + args.timeout;
        let err = prepare::provision(&cp, job, args, deadline, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::WatchTimeout { .. }));
        assert_eq!(exit::resolve(err.class(), no_overrides), 2);
    }

    #[tokio::test]
    async fn run_rejects_vm_that_is_not_running() {
        let cp = MemoryControlPlane::new();
        let cli = parse(&["prepare", "--shell", "bash"]);
        let mut job = JobContext::from_args(&cli.job);
        job.apply_defaults(prepare_args(&cli));
        crate::provision::create_job_vm(&cp, &job, &RunConfig::from(&prepare_args(&cli).run_config))
            .await
            .unwrap();

        let mut vm = cp.created().remove(0);
        vm.status = with_status(&vm.name_any(), "Scheduled", None, false).status;
        cp.put(vm);

        let err = run::locate_target(&cp, &job).await.unwrap_err();
        assert!(matches!(err, RunnerError::NotRunning { ref phase, .. } if phase == "Scheduled"));

        boot(&cp, "");
        let err = run::locate_target(&cp, &job).await.unwrap_err();
        assert!(matches!(err, RunnerError::NoAddress { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_after_success() {
        let cp = MemoryControlPlane::new();
        let cli = parse(&["prepare", "--shell", "bash"]);
        let mut job = JobContext::from_args(&cli.job);
        job.apply_defaults(prepare_args(&cli));
        crate::provision::create_job_vm(&cp, &job, &RunConfig::from(&prepare_args(&cli).run_config))
            .await
            .unwrap();
        let vm = boot(&cp, "10.1.2.3");
        cp.push_watch_session(vec![Ok(WatchEvent::Deleted(vm))]);

        let cli = parse(&["cleanup", "--skip-if", "Failed"]);
        let Command::Cleanup(args) = &cli.command else {
            unreachable!()
        };
        let args: &CleanupArgs = args;
        let cancel = CancellationToken::new();
        let outcome = cleanup::run(&cp, &job, args, &cancel).await.unwrap();

        assert!(matches!(outcome, CleanupOutcome::Deleted { .. }));
        assert!(cp.instances().is_empty());
    }
}
