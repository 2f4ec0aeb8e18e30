//! In-memory control plane for tests and local runs.
//!
//! Objects live in a `Vec` behind a mutex. Watch subscriptions replay
//! scripted sessions in order; once the script is exhausted a subscription
//! never yields, so a waiting caller runs into its deadline.

use std::collections::VecDeque;
use std::sync::Mutex;

use futures_util::StreamExt;
use futures_util::stream;
use kube::ResourceExt;

use super::{ControlPlane, WatchItem, WatchStream};
use crate::error::RunnerError;
use crate::instance::VirtualMachineInstance;

#[derive(Default)]
struct State {
    objects: Vec<VirtualMachineInstance>,
    sessions: VecDeque<Vec<WatchItem>>,
    next_version: u64,
    created: Vec<VirtualMachineInstance>,
    deleted: Vec<String>,
    watch_cursors: Vec<String>,
}

impl State {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

#[derive(Default)]
pub struct MemoryControlPlane {
    state: Mutex<State>,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with the given objects already stored.
    pub fn with_instances(instances: impl IntoIterator<Item = VirtualMachineInstance>) -> Self {
        let backend = Self::default();
        backend.lock().objects.extend(instances);
        backend
    }

    /// Queue the items a future `watch` call will replay. Sessions are
    /// consumed one per subscription, oldest first.
    pub fn push_watch_session(&self, items: Vec<WatchItem>) {
        self.lock().sessions.push_back(items);
    }

    /// Insert or replace an object by name.
    pub fn put(&self, instance: VirtualMachineInstance) {
        let mut state = self.lock();
        let name = instance.name_any();
        state.objects.retain(|vm| vm.name_any() != name);
        state.objects.push(instance);
    }

    pub fn instances(&self) -> Vec<VirtualMachineInstance> {
        self.lock().objects.clone()
    }

    /// Every object passed to `create`, as stored.
    pub fn created(&self) -> Vec<VirtualMachineInstance> {
        self.lock().created.clone()
    }

    /// Names passed to `delete`, in call order.
    pub fn deleted(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    /// Resource versions passed to `watch`, in call order.
    pub fn watch_cursors(&self) -> Vec<String> {
        self.lock().watch_cursors.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn matches_selector(vm: &VirtualMachineInstance, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => vm.labels().get(key).is_some_and(|v| v == value),
            None => vm.labels().contains_key(term),
        })
}

fn not_found(name: &str) -> RunnerError {
    RunnerError::kube(
        format!("deleting Virtual Machine instance {name}"),
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: format!("virtualmachineinstances.kubevirt.io \"{name}\" not found"),
            reason: "NotFound".into(),
            code: 404,
        }),
    )
}

impl ControlPlane for MemoryControlPlane {
    async fn list(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<VirtualMachineInstance>, RunnerError> {
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|vm| vm.namespace().as_deref().unwrap_or(namespace) == namespace)
            .filter(|vm| matches_selector(vm, selector))
            .cloned()
            .collect())
    }

    async fn create(
        &self,
        namespace: &str,
        instance: &VirtualMachineInstance,
    ) -> Result<VirtualMachineInstance, RunnerError> {
        let mut state = self.lock();
        let version = state.bump_version();

        let mut stored = instance.clone();
        if stored.metadata.name.is_none() {
            let prefix = stored.metadata.generate_name.clone().unwrap_or_default();
            stored.metadata.name = Some(format!("{prefix}{:05x}", state.next_version));
        }
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.uid = Some(format!("uid-{version}"));
        stored.metadata.resource_version = Some(version);

        state.objects.push(stored.clone());
        state.created.push(stored.clone());
        Ok(stored)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), RunnerError> {
        let mut state = self.lock();
        state.deleted.push(name.to_string());
        let before = state.objects.len();
        state.objects.retain(|vm| {
            !(vm.name_any() == name && vm.namespace().as_deref().unwrap_or(namespace) == namespace)
        });
        if state.objects.len() == before {
            return Err(not_found(name));
        }
        Ok(())
    }

    async fn watch(
        &self,
        _namespace: &str,
        _selector: &str,
        resource_version: &str,
    ) -> Result<WatchStream, RunnerError> {
        let mut state = self.lock();
        state.watch_cursors.push(resource_version.to_string());
        Ok(match state.sessions.pop_front() {
            Some(items) => stream::iter(items).boxed(),
            None => stream::pending().boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::backend::WatchEvent;
    use crate::instance::{ID_LABEL, VirtualMachineInstanceSpec};

    fn labelled(name: &str, id: &str) -> VirtualMachineInstance {
        let mut vm = VirtualMachineInstance::new(name, VirtualMachineInstanceSpec::default());
        vm.metadata.labels = Some(BTreeMap::from([(ID_LABEL.to_string(), id.to_string())]));
        vm
    }

    #[tokio::test]
    async fn list_filters_on_label() {
        let cp = MemoryControlPlane::with_instances([labelled("a", "x"), labelled("b", "y")]);
        let found = cp.list("ns", &format!("{ID_LABEL}=y")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name_any(), "b");
    }

    #[tokio::test]
    async fn create_assigns_name_and_version() {
        let cp = MemoryControlPlane::new();
        let mut vm = labelled("", "x");
        vm.metadata.name = None;
        vm.metadata.generate_name = Some("runner-1-".into());

        let created = cp.create("ns", &vm).await.unwrap();
        assert!(created.name_any().starts_with("runner-1-"));
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));
        assert_eq!(cp.instances().len(), 1);
    }

    #[tokio::test]
    async fn delete_missing_is_an_error() {
        let cp = MemoryControlPlane::new();
        assert!(cp.delete("ns", "ghost").await.is_err());
        assert_eq!(cp.deleted(), vec!["ghost"]);
    }

    #[tokio::test]
    async fn watch_replays_sessions_in_order() {
        let cp = MemoryControlPlane::new();
        cp.push_watch_session(vec![Ok(WatchEvent::Bookmark {
            resource_version: "7".into(),
        })]);

        let first: Vec<_> = cp.watch("ns", "", "0").await.unwrap().collect().await;
        assert_eq!(first.len(), 1);
        assert_eq!(cp.watch_cursors(), vec!["0"]);
    }
}
