use crate::backend::{ControlPlane, identity_selector};
use crate::error::RunnerError;
use crate::identity::JobIdentity;
use crate::instance::VirtualMachineInstance;

/// Find the single instance carrying `identity` in `namespace`.
///
/// No match means the VM went away under the job. More than one is a
/// conflict the driver cannot resolve, so it is reported rather than retried.
pub async fn find_job_vm<C: ControlPlane>(
    cp: &C,
    namespace: &str,
    identity: &JobIdentity,
) -> Result<VirtualMachineInstance, RunnerError> {
    let mut found = cp.list(namespace, &identity_selector(identity)).await?;
    match found.len() {
        0 => Err(RunnerError::InstanceVanished {
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }),
        1 => Ok(found.remove(0)),
        count => Err(RunnerError::AmbiguousIdentity {
            count,
            identity: identity.to_string(),
        }),
    }
}
