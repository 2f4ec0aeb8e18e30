pub mod kubevirt;
pub mod memory;

use futures_util::stream::BoxStream;

use crate::error::RunnerError;
use crate::instance::VirtualMachineInstance;

/// A change observed on a watched instance. Each kind carries its own payload.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(VirtualMachineInstance),
    Modified(VirtualMachineInstance),
    Deleted(VirtualMachineInstance),
    /// Progress marker with no object change; only moves the cursor.
    Bookmark { resource_version: String },
    /// The control plane reported a failure on the subscription itself.
    Error(WatchFailure),
}

#[cfg(test)]
impl WatchEvent {
    /// The object the event is about, for kinds that carry one.
    pub fn object(&self) -> Option<&VirtualMachineInstance> {
        match self {
            WatchEvent::Added(vm) | WatchEvent::Modified(vm) | WatchEvent::Deleted(vm) => Some(vm),
            WatchEvent::Bookmark { .. } | WatchEvent::Error(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchFailure {
    pub code: u16,
    pub reason: String,
    pub message: String,
}

/// One item of a change stream. `Err` is an item that could not be decoded
/// into an event; the watcher treats it like a dropped connection.
pub type WatchItem = Result<WatchEvent, String>;

pub type WatchStream = BoxStream<'static, WatchItem>;

/// The cluster operations the driver needs, all scoped to a namespace and to
/// the identity label selector.
#[allow(async_fn_in_trait)]
pub trait ControlPlane {
    async fn list(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<VirtualMachineInstance>, RunnerError>;

    async fn create(
        &self,
        namespace: &str,
        instance: &VirtualMachineInstance,
    ) -> Result<VirtualMachineInstance, RunnerError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), RunnerError>;

    /// Open a change stream for instances matching `selector`, starting after
    /// `resource_version` (`"0"` replays from whatever the server has).
    async fn watch(
        &self,
        namespace: &str,
        selector: &str,
        resource_version: &str,
    ) -> Result<WatchStream, RunnerError>;
}

/// Label selector matching the instance of one job.
pub fn identity_selector(identity: &crate::identity::JobIdentity) -> String {
    format!("{}={}", crate::instance::ID_LABEL, identity)
}
