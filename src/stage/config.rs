use kube::Resource;
use serde::Serialize;

use crate::error::RunnerError;
use crate::instance::VirtualMachineInstance;

pub const DRIVER_NAME: &str = "gitlab-runner-kubevirt";

#[derive(Debug, Serialize)]
pub struct Descriptor {
    pub driver: Driver,
}

#[derive(Debug, Serialize)]
pub struct Driver {
    pub name: &'static str,
    pub version: String,
}

/// Crate version, the git revision when the build provided `GIT_REVISION`,
/// and the KubeVirt API version the driver speaks.
pub fn driver_version() -> String {
    let mut version = env!("CARGO_PKG_VERSION").to_string();
    if let Some(rev) = option_env!("GIT_REVISION").filter(|r| !r.is_empty()) {
        version.push('+');
        version.push_str(rev);
    }
    format!("{version} ({})", VirtualMachineInstance::api_version(&()))
}

pub fn descriptor() -> Descriptor {
    Descriptor {
        driver: Driver {
            name: DRIVER_NAME,
            version: driver_version(),
        },
    }
}

/// Print the driver description the runner reads at startup.
pub fn run() -> Result<(), RunnerError> {
    let json = serde_json::to_string(&descriptor()).map_err(|e| RunnerError::Validation {
        message: format!("cannot serialize driver description: {e}"),
    })?;
    println!("{json}");
    Ok(())
}
