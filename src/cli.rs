use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{Method, ShellKind};
use crate::util::parse_duration;

#[derive(Parser, Debug)]
#[command(
    name = "gitlab-runner-kubevirt",
    version,
    about = "GitLab Runner custom executor that runs each job in a KubeVirt virtual machine"
)]
pub struct Cli {
    #[command(flatten)]
    pub job: JobArgs,

    /// Echo connection attempts, uploaded scripts and remote commands
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Job coordinates and per-job overrides, bound from the runner environment.
#[derive(Args, Debug, Clone, Default)]
pub struct JobArgs {
    #[arg(long, env = "CUSTOM_ENV_CI_RUNNER_ID", default_value = "", global = true)]
    pub runner_id: String,

    #[arg(long, env = "CUSTOM_ENV_CI_PROJECT_ID", default_value = "", global = true)]
    pub project_id: String,

    #[arg(
        long,
        env = "CUSTOM_ENV_CI_CONCURRENT_PROJECT_ID",
        default_value = "",
        global = true
    )]
    pub concurrent_id: String,

    #[arg(long, env = "CUSTOM_ENV_CI_JOB_ID", default_value = "", global = true)]
    pub job_id: String,

    /// Container disk image holding the VM root filesystem
    #[arg(long, env = "CUSTOM_ENV_CI_JOB_IMAGE", default_value = "", global = true)]
    pub image: String,

    /// Namespace the VirtualMachineInstances live in
    #[arg(
        long,
        env = "KUBEVIRT_NAMESPACE",
        default_value = "gitlab-runner",
        global = true
    )]
    pub namespace: String,

    #[arg(long, env = "CUSTOM_ENV_VM_IMAGE_PULL_POLICY", default_value = "", global = true)]
    pub image_pull_policy: String,

    #[arg(long, env = "CUSTOM_ENV_VM_MACHINE_TYPE", default_value = "", global = true)]
    pub machine_type: String,

    #[arg(long, env = "CUSTOM_ENV_VM_CPU_REQUEST", default_value = "", global = true)]
    pub cpu_request: String,

    #[arg(long, env = "CUSTOM_ENV_VM_CPU_LIMIT", default_value = "", global = true)]
    pub cpu_limit: String,

    #[arg(long, env = "CUSTOM_ENV_VM_MEMORY_REQUEST", default_value = "", global = true)]
    pub memory_request: String,

    #[arg(long, env = "CUSTOM_ENV_VM_MEMORY_LIMIT", default_value = "", global = true)]
    pub memory_limit: String,

    #[arg(
        long,
        env = "CUSTOM_ENV_VM_EPHEMERAL_STORAGE_REQUEST",
        default_value = "",
        global = true
    )]
    pub ephemeral_storage_request: String,

    #[arg(
        long,
        env = "CUSTOM_ENV_VM_EPHEMERAL_STORAGE_LIMIT",
        default_value = "",
        global = true
    )]
    pub ephemeral_storage_limit: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Describe the driver to the runner
    Config,

    /// Create the job VM and wait until it accepts connections
    Prepare(PrepareArgs),

    /// Upload a script to the job VM and execute it
    Run(RunArgs),

    /// Delete the job VM
    Cleanup(CleanupArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PrepareArgs {
    #[arg(long, default_value = "")]
    pub default_image: String,

    #[arg(long, default_value = "")]
    pub default_image_pull_policy: String,

    #[arg(long, default_value = "")]
    pub default_image_pull_secret: String,

    #[arg(long, default_value = "")]
    pub default_machine_type: String,

    #[arg(long, default_value = "1")]
    pub default_cpu_request: String,

    #[arg(long, default_value = "1")]
    pub default_cpu_limit: String,

    #[arg(long, default_value = "1Gi")]
    pub default_memory_request: String,

    #[arg(long, default_value = "1Gi")]
    pub default_memory_limit: String,

    #[arg(long, default_value = "")]
    pub default_ephemeral_storage_request: String,

    #[arg(long, default_value = "")]
    pub default_ephemeral_storage_limit: String,

    #[arg(long, env = "CUSTOM_ENV_VM_TIMEZONE", default_value = "Etc/UTC")]
    pub default_timezone: String,

    /// How long to wait for the VM to become ready
    #[arg(long, default_value = "1h", value_parser = parse_duration)]
    pub timeout: Duration,

    /// Timeout of a single SSH connection attempt
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub dial_timeout: Duration,

    #[command(flatten)]
    pub run_config: RunConfigArgs,
}

/// How later stages reach the VM. Persisted on the instance at creation.
#[derive(Args, Debug, Clone)]
pub struct RunConfigArgs {
    /// Shell used to execute job scripts
    #[arg(long, value_enum)]
    pub shell: ShellKind,

    /// Method used to execute job scripts
    #[arg(long, value_enum, default_value_t = Method::Ssh)]
    pub method: Method,

    /// Port to ssh to
    #[arg(long = "ssh-port", default_value_t = 22)]
    pub ssh_port: u16,

    /// ssh username
    #[arg(long = "ssh-user", default_value = "")]
    pub ssh_user: String,

    /// ssh password
    #[arg(long = "ssh-password", conflicts_with = "ssh_private_key_file")]
    pub ssh_password: Option<String>,

    /// ssh private key
    #[arg(long = "ssh-private-key-file")]
    pub ssh_private_key_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Local path of the script the runner generated
    pub script: PathBuf,

    /// Name of the job stage being run
    pub stage: String,

    /// How long to keep retrying the SSH connection
    #[arg(long, default_value = "5m", value_parser = parse_duration)]
    pub retry_timeout: Duration,

    /// Timeout of a single SSH connection attempt
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub dial_timeout: Duration,
}

#[derive(Args, Debug, Clone)]
pub struct CleanupArgs {
    /// How long to wait for the VM to go away
    #[arg(long, default_value = "1h", value_parser = parse_duration)]
    pub timeout: Duration,

    /// Keep the VM when its phase matches (`Failed`) or does not match
    /// (`!Succeeded`); comma-separated, first match wins
    #[arg(long, value_delimiter = ',')]
    pub skip_if: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_prepare_flags() {
        let cli = Cli::try_parse_from([
            "gitlab-runner-kubevirt",
            "--namespace",
            "ci",
            "prepare",
            "--shell",
            "pwsh",
            "--ssh-user",
            "runner",
            "--ssh-password",
            "hunter2",
            "--timeout",
            "30m",
        ])
        .unwrap();
        assert_eq!(cli.job.namespace, "ci");
        let Command::Prepare(args) = cli.command else {
            panic!("expected prepare");
        };
        assert_eq!(args.run_config.shell, ShellKind::Pwsh);
        assert_eq!(args.run_config.method, Method::Ssh);
        assert_eq!(args.run_config.ssh_port, 22);
        assert_eq!(args.timeout, Duration::from_secs(1800));
        assert_eq!(args.dial_timeout, Duration::from_secs(10));
        assert_eq!(args.default_memory_limit, "1Gi");
    }

    #[test]
    fn password_and_key_are_exclusive() {
        let result = Cli::try_parse_from([
            "gitlab-runner-kubevirt",
            "prepare",
            "--shell",
            "bash",
            "--ssh-password",
            "x",
            "--ssh-private-key-file",
            "/id_ed25519",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn parse_cleanup_skip_list() {
        let cli = Cli::try_parse_from([
            "gitlab-runner-kubevirt",
            "cleanup",
            "--skip-if",
            "Failed,!Succeeded",
        ])
        .unwrap();
        let Command::Cleanup(args) = cli.command else {
            panic!("expected cleanup");
        };
        assert_eq!(args.skip_if, vec!["Failed", "!Succeeded"]);
        assert_eq!(args.timeout, Duration::from_secs(3600));
    }

    #[test]
    fn parse_run_positionals() {
        let cli = Cli::try_parse_from([
            "gitlab-runner-kubevirt",
            "run",
            "/tmp/script",
            "build_script",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.script, PathBuf::from("/tmp/script"));
        assert_eq!(args.stage, "build_script");
        assert_eq!(args.retry_timeout, Duration::from_secs(300));
    }
}
