use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::cli::{JobArgs, PrepareArgs, RunConfigArgs};
use crate::error::RunnerError;
use crate::identity::JobIdentity;
use crate::instance::{RUN_CONFIG_ANNOTATION, VirtualMachineInstance};
use crate::remote::shell::Shell;

// ── JobContext ────────────────────────────────────────────

/// Working configuration for one job, owned by a single stage invocation.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub identity: JobIdentity,
    /// `generateName` prefix; the API server appends a random suffix.
    pub base_name: String,
    pub image: String,
    pub image_pull_policy: String,
    pub image_pull_secret: String,
    pub namespace: String,
    pub machine_type: String,
    pub timezone: String,
    pub resources: ResourceBounds,
}

/// Request/limit strings as given by the operator. Empty means "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceBounds {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
    pub ephemeral_storage_request: String,
    pub ephemeral_storage_limit: String,
}

impl JobContext {
    pub fn from_args(args: &JobArgs) -> Self {
        Self {
            identity: JobIdentity::for_job(
                &args.runner_id,
                &args.project_id,
                &args.concurrent_id,
                &args.job_id,
            ),
            base_name: format!(
                "runner-{}-project-{}-concurrent-{}-",
                args.runner_id, args.project_id, args.concurrent_id
            ),
            image: args.image.clone(),
            image_pull_policy: args.image_pull_policy.clone(),
            image_pull_secret: String::new(),
            namespace: args.namespace.clone(),
            machine_type: args.machine_type.clone(),
            timezone: String::new(),
            resources: ResourceBounds {
                cpu_request: args.cpu_request.clone(),
                cpu_limit: args.cpu_limit.clone(),
                memory_request: args.memory_request.clone(),
                memory_limit: args.memory_limit.clone(),
                ephemeral_storage_request: args.ephemeral_storage_request.clone(),
                ephemeral_storage_limit: args.ephemeral_storage_limit.clone(),
            },
        }
    }

    /// Fill every field the job left empty from the prepare stage's defaults.
    pub fn apply_defaults(&mut self, defaults: &PrepareArgs) {
        fn fill(field: &mut String, default: &str) {
            if field.is_empty() {
                *field = default.to_string();
            }
        }

        let r = &mut self.resources;
        fill(&mut r.cpu_request, &defaults.default_cpu_request);
        fill(&mut r.cpu_limit, &defaults.default_cpu_limit);
        fill(&mut r.memory_request, &defaults.default_memory_request);
        fill(&mut r.memory_limit, &defaults.default_memory_limit);
        fill(
            &mut r.ephemeral_storage_request,
            &defaults.default_ephemeral_storage_request,
        );
        fill(
            &mut r.ephemeral_storage_limit,
            &defaults.default_ephemeral_storage_limit,
        );
        fill(&mut self.image_pull_policy, &defaults.default_image_pull_policy);
        fill(&mut self.image_pull_secret, &defaults.default_image_pull_secret);
        fill(&mut self.image, &defaults.default_image);
        fill(&mut self.machine_type, &defaults.default_machine_type);
        fill(&mut self.timezone, &defaults.default_timezone);
    }
}

// ── RunConfig ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Bash,
    Pwsh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Ssh,
}

/// How to reach and drive the VM. Written onto the instance by `prepare` so
/// that `run` uses exactly what the VM was created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub shell: ShellKind,
    pub method: Method,
    pub ssh: SshConfig,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
}

impl std::fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConfig")
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key_path", &self.private_key_path)
            .finish()
    }
}

impl From<&RunConfigArgs> for RunConfig {
    fn from(args: &RunConfigArgs) -> Self {
        Self {
            shell: args.shell,
            method: args.method,
            ssh: SshConfig {
                port: args.ssh_port,
                user: args.ssh_user.clone(),
                password: args.ssh_password.clone(),
                private_key_path: args.ssh_private_key_file.clone(),
            },
        }
    }
}

impl RunConfig {
    /// Serialized form stored in the instance annotation.
    pub fn to_annotation(&self) -> Result<String, RunnerError> {
        serde_json::to_string(self).map_err(|e| RunnerError::Validation {
            message: format!("cannot serialize run configuration: {e}"),
        })
    }

    /// Recover the configuration the instance was created with.
    pub fn from_instance(vm: &VirtualMachineInstance) -> Result<Self, RunnerError> {
        use kube::ResourceExt;

        let name = vm.name_any();
        let raw = vm
            .annotations()
            .get(RUN_CONFIG_ANNOTATION)
            .ok_or_else(|| RunnerError::MissingRunConfig { name: name.clone() })?;
        serde_json::from_str(raw).map_err(|source| RunnerError::InvalidRunConfig { name, source })
    }

    pub fn shell(&self) -> &dyn Shell {
        &self.shell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::VirtualMachineInstanceSpec;

    fn prepare_defaults() -> PrepareArgs {
        use clap::Parser;
        let cli = crate::cli::Cli::try_parse_from([
            "gitlab-runner-kubevirt",
            "prepare",
            "--shell",
            "bash",
            "--default-image",
            "registry.example.com/vm:latest",
            "--default-timezone",
            "Europe/Paris",
        ])
        .unwrap();
        match cli.command {
            crate::cli::Command::Prepare(args) => args,
            _ => unreachable!(),
        }
    }

    fn sample_run_config() -> RunConfig {
        RunConfig {
            shell: ShellKind::Bash,
            method: Method::Ssh,
            ssh: SshConfig {
                port: 2222,
                user: "runner".into(),
                password: Some("hunter2".into()),
                private_key_path: None,
            },
        }
    }

    #[test]
    fn base_name_and_identity_from_args() {
        let args = JobArgs {
            runner_id: "r1".into(),
            project_id: "p1".into(),
            concurrent_id: "c1".into(),
            job_id: "j1".into(),
            namespace: "ci".into(),
            ..Default::default()
        };
        let job = JobContext::from_args(&args);
        assert_eq!(job.base_name, "runner-r1-project-p1-concurrent-c1-");
        assert_eq!(job.identity, JobIdentity::for_job("r1", "p1", "c1", "j1"));
        assert_eq!(job.namespace, "ci");
    }

    #[test]
    fn defaults_fill_only_empty_fields() {
        let mut job = JobContext {
            image: "custom:1".into(),
            resources: ResourceBounds {
                memory_limit: "4Gi".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        job.apply_defaults(&prepare_defaults());

        assert_eq!(job.image, "custom:1");
        assert_eq!(job.resources.memory_limit, "4Gi");
        assert_eq!(job.resources.memory_request, "1Gi");
        assert_eq!(job.resources.cpu_request, "1");
        assert_eq!(job.resources.cpu_limit, "1");
        assert_eq!(job.resources.ephemeral_storage_request, "");
        assert_eq!(job.timezone, "Europe/Paris");
    }

    #[test]
    fn default_image_used_when_job_has_none() {
        let mut job = JobContext::default();
        job.apply_defaults(&prepare_defaults());
        assert_eq!(job.image, "registry.example.com/vm:latest");
    }

    #[test]
    fn run_config_wire_shape() {
        let json = sample_run_config().to_annotation().unwrap();
        assert_eq!(
            json,
            r#"{"shell":"bash","method":"ssh","ssh":{"port":2222,"user":"runner","password":"hunter2"}}"#
        );
    }

    #[test]
    fn run_config_round_trips_through_instance() {
        let rc = RunConfig {
            shell: ShellKind::Pwsh,
            ssh: SshConfig {
                password: None,
                private_key_path: Some("/etc/runner/id_ed25519".into()),
                ..sample_run_config().ssh
            },
            ..sample_run_config()
        };
        let mut vm = VirtualMachineInstance::new("vm", VirtualMachineInstanceSpec::default());
        vm.metadata.annotations = Some(
            [(RUN_CONFIG_ANNOTATION.to_string(), rc.to_annotation().unwrap())].into(),
        );
        assert_eq!(RunConfig::from_instance(&vm).unwrap(), rc);
    }

    #[test]
    fn missing_annotation_is_reported() {
        let vm = VirtualMachineInstance::new("vm-x", VirtualMachineInstanceSpec::default());
        let err = RunConfig::from_instance(&vm).unwrap_err();
        assert!(matches!(err, RunnerError::MissingRunConfig { ref name } if name == "vm-x"));
    }

    #[test]
    fn debug_redacts_password() {
        let rendered = format!("{:?}", sample_run_config());
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
