use futures_util::StreamExt;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams, WatchEvent as ApiWatchEvent, WatchParams};

use super::{ControlPlane, WatchEvent, WatchFailure, WatchStream};
use crate::error::RunnerError;
use crate::instance::VirtualMachineInstance;

/// `ControlPlane` backed by the Kubernetes API server running KubeVirt.
pub struct KubeVirtBackend {
    client: Client,
}

impl KubeVirtBackend {
    /// Connect with the inferred cluster configuration: in-cluster service
    /// account, then `KUBECONFIG`, then `~/.kube/config`.
    pub async fn connect() -> Result<Self, RunnerError> {
        let client = Client::try_default()
            .await
            .map_err(|e| RunnerError::kube("failed to load cluster configuration", e))?;
        Ok(Self { client })
    }

    fn api(&self, namespace: &str) -> Api<VirtualMachineInstance> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl ControlPlane for KubeVirtBackend {
    async fn list(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<VirtualMachineInstance>, RunnerError> {
        let list = self
            .api(namespace)
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| {
                RunnerError::kube(
                    format!("listing Virtual Machine instances in namespace {namespace}"),
                    e,
                )
            })?;
        Ok(list.items)
    }

    async fn create(
        &self,
        namespace: &str,
        instance: &VirtualMachineInstance,
    ) -> Result<VirtualMachineInstance, RunnerError> {
        self.api(namespace)
            .create(&PostParams::default(), instance)
            .await
            .map_err(|e| {
                RunnerError::kube(
                    format!("creating Virtual Machine instance in namespace {namespace}"),
                    e,
                )
            })
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), RunnerError> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| RunnerError::kube(format!("deleting Virtual Machine instance {name}"), e))?;
        Ok(())
    }

    async fn watch(
        &self,
        namespace: &str,
        selector: &str,
        resource_version: &str,
    ) -> Result<WatchStream, RunnerError> {
        let params = WatchParams::default().labels(selector);
        let stream = self
            .api(namespace)
            .watch(&params, resource_version)
            .await
            .map_err(|e| {
                RunnerError::kube(
                    format!("watching Virtual Machine instances in namespace {namespace}"),
                    e,
                )
            })?;

        Ok(stream
            .map(|item| match item {
                Ok(event) => Ok(convert(event)),
                Err(e) => Err(e.to_string()),
            })
            .boxed())
    }
}

fn convert(event: ApiWatchEvent<VirtualMachineInstance>) -> WatchEvent {
    match event {
        ApiWatchEvent::Added(vm) => WatchEvent::Added(vm),
        ApiWatchEvent::Modified(vm) => WatchEvent::Modified(vm),
        ApiWatchEvent::Deleted(vm) => WatchEvent::Deleted(vm),
        ApiWatchEvent::Bookmark(bookmark) => WatchEvent::Bookmark {
            resource_version: bookmark.metadata.resource_version,
        },
        ApiWatchEvent::Error(status) => WatchEvent::Error(WatchFailure {
            code: status.code,
            reason: status.reason,
            message: status.message,
        }),
    }
}
