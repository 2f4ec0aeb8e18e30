use std::collections::BTreeMap;

use kube::ResourceExt;
use kube::api::ObjectMeta;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{ControlPlane, WatchEvent};
use crate::config::{JobContext, ResourceBounds, RunConfig};
use crate::error::{Bound, RunnerError};
use crate::instance::{
    Clock, ContainerDiskSource, Devices, Disk, DomainSpec, ID_LABEL, Machine,
    RUN_CONFIG_ANNOTATION, ResourceRequirements, VirtualMachineInstance,
    VirtualMachineInstanceSpec, Volume,
};
use crate::quantity::parse_quantity;
use crate::watch::{Control, REPLAY_CURSOR, Watcher};

const ROOT_DISK: &str = "root";

/// Turn the operator's request/limit strings into resource requirements.
///
/// Empty strings leave the bound unset. Anything else must be a valid
/// quantity; the error names the resource and which bound was wrong.
pub fn build_resources(bounds: &ResourceBounds) -> Result<ResourceRequirements, RunnerError> {
    let entries: [(&'static str, Bound, &str); 6] = [
        ("cpu", Bound::Request, &bounds.cpu_request),
        ("cpu", Bound::Limit, &bounds.cpu_limit),
        ("memory", Bound::Request, &bounds.memory_request),
        ("memory", Bound::Limit, &bounds.memory_limit),
        ("ephemeral-storage", Bound::Request, &bounds.ephemeral_storage_request),
        ("ephemeral-storage", Bound::Limit, &bounds.ephemeral_storage_limit),
    ];

    let mut resources = ResourceRequirements::default();
    for (resource, bound, value) in entries {
        if value.is_empty() {
            continue;
        }
        let quantity =
            parse_quantity(value).map_err(|source| RunnerError::InvalidResourceQuantity {
                resource,
                bound,
                value: value.to_string(),
                source,
            })?;
        let list = match bound {
            Bound::Request => &mut resources.requests,
            Bound::Limit => &mut resources.limits,
        };
        list.insert(resource.to_string(), quantity);
    }
    Ok(resources)
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// The instance template for a job, ready to submit.
pub fn build_instance(
    job: &JobContext,
    run_config: &RunConfig,
) -> Result<VirtualMachineInstance, RunnerError> {
    let resources = build_resources(&job.resources)?;
    if job.image.is_empty() {
        return Err(RunnerError::MissingImage);
    }

    let metadata = ObjectMeta {
        generate_name: Some(job.base_name.clone()),
        namespace: Some(job.namespace.clone()),
        labels: Some(BTreeMap::from([(
            ID_LABEL.to_string(),
            job.identity.to_string(),
        )])),
        annotations: Some(BTreeMap::from([(
            RUN_CONFIG_ANNOTATION.to_string(),
            run_config.to_annotation()?,
        )])),
        ..Default::default()
    };

    let spec = VirtualMachineInstanceSpec {
        domain: DomainSpec {
            resources,
            machine: non_empty(&job.machine_type).map(|machine_type| Machine { machine_type }),
            clock: non_empty(&job.timezone).map(|tz| Clock { timezone: Some(tz) }),
            devices: Devices {
                disks: vec![Disk {
                    name: ROOT_DISK.to_string(),
                }],
            },
        },
        volumes: vec![Volume {
            name: ROOT_DISK.to_string(),
            container_disk: Some(ContainerDiskSource {
                image: job.image.clone(),
                image_pull_policy: non_empty(&job.image_pull_policy),
                image_pull_secret: non_empty(&job.image_pull_secret),
            }),
        }],
    };

    Ok(VirtualMachineInstance {
        metadata,
        spec,
        status: None,
    })
}

/// Submit the job's instance and return it as stored by the control plane.
pub async fn create_job_vm<C: ControlPlane>(
    cp: &C,
    job: &JobContext,
    run_config: &RunConfig,
) -> Result<VirtualMachineInstance, RunnerError> {
    let instance = build_instance(job, run_config)?;
    let created = cp.create(&job.namespace, &instance).await?;
    tracing::debug!(name = %created.name_any(), "created Virtual Machine instance");
    Ok(created)
}

/// Follow `created` until it has an address and reports `Ready`.
///
/// Watch errors are treated as recoverable and replay from scratch. A
/// deletion means the instance is gone for good.
pub async fn wait_until_ready<C: ControlPlane>(
    cp: &C,
    job: &JobContext,
    created: &VirtualMachineInstance,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<VirtualMachineInstance, RunnerError> {
    let name = created.name_any();
    let cursor = created.cursor().unwrap_or_else(|| REPLAY_CURSOR.to_string());
    let what = format!("Virtual Machine instance {name} to be ready");

    let mut latest = created.clone();
    Watcher::new(cp, &job.namespace, &job.identity, cancel)
        .run(&cursor, deadline, &what, |event| match event {
            WatchEvent::Error(failure) => {
                tracing::warn!(
                    "Error watching Virtual Machine instance, retrying. Reason: {}, Message: {}",
                    failure.reason,
                    failure.message
                );
                Ok(Control::Continue)
            }
            WatchEvent::Deleted(_) => Err(RunnerError::InstanceVanished {
                namespace: job.namespace.clone(),
                identity: job.identity.to_string(),
            }),
            WatchEvent::Added(vm) | WatchEvent::Modified(vm) => {
                latest = vm.clone();
                if vm.is_ready() {
                    Ok(Control::Done)
                } else {
                    tracing::debug!(phase = vm.phase(), "Virtual Machine instance not ready yet");
                    Ok(Control::Continue)
                }
            }
            WatchEvent::Bookmark { .. } => Ok(Control::Continue),
        })
        .await?;
    Ok(latest)
}
