use std::fmt;

use kube::ResourceExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{ControlPlane, WatchEvent};
use crate::error::RunnerError;
use crate::identity::JobIdentity;
use crate::instance::VirtualMachineInstance;
use crate::locate::find_job_vm;
use crate::watch::{Control, REPLAY_CURSOR, Watcher};

/// A `--skip-if` term: `Failed` matches that phase, `!Succeeded` matches any
/// other phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhasePredicate {
    Is(String),
    IsNot(String),
}

impl PhasePredicate {
    pub fn matches(&self, phase: &str) -> bool {
        match self {
            PhasePredicate::Is(p) => phase == p,
            PhasePredicate::IsNot(p) => phase != p,
        }
    }
}

impl From<&str> for PhasePredicate {
    fn from(s: &str) -> Self {
        match s.strip_prefix('!') {
            Some(phase) => PhasePredicate::IsNot(phase.to_string()),
            None => PhasePredicate::Is(s.to_string()),
        }
    }
}

impl fmt::Display for PhasePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhasePredicate::Is(p) => f.write_str(p),
            PhasePredicate::IsNot(p) => write!(f, "!{p}"),
        }
    }
}

pub fn parse_predicates<S: AsRef<str>>(terms: &[S]) -> Vec<PhasePredicate> {
    terms
        .iter()
        .map(|t| PhasePredicate::from(t.as_ref()))
        .collect()
}

/// First predicate matching `phase`, in the order given.
pub fn skip_reason<'a>(phase: &str, predicates: &'a [PhasePredicate]) -> Option<&'a PhasePredicate> {
    predicates.iter().find(|p| p.matches(phase))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Left in place because `predicate` matched its phase.
    Skipped { name: String, predicate: PhasePredicate },
    /// Deletion requested and observed.
    Deleted { name: String },
    /// Deletion requested, but the watch failed before the deletion was
    /// observed. The instance is assumed to be going away.
    Abandoned { name: String },
}

/// Delete the job's instance unless a skip predicate matches, then wait for
/// the control plane to report it gone.
pub async fn cleanup<C: ControlPlane>(
    cp: &C,
    namespace: &str,
    identity: &JobIdentity,
    skip_if: &[PhasePredicate],
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<CleanupOutcome, RunnerError> {
    let vm = find_job_vm(cp, namespace, identity).await?;
    let name = vm.name_any();

    if let Some(predicate) = skip_reason(vm.phase(), skip_if) {
        eprintln!(
            "Skipping cleanup of Virtual Machine instance {name} because of --skip-if={predicate}"
        );
        return Ok(CleanupOutcome::Skipped {
            name,
            predicate: predicate.clone(),
        });
    }

    eprintln!("Deleting Virtual Machine instance {name}");
    cp.delete(namespace, &name).await?;

    let abandoned = wait_for_deletion(cp, namespace, identity, &vm, deadline, cancel).await?;
    Ok(if abandoned {
        CleanupOutcome::Abandoned { name }
    } else {
        CleanupOutcome::Deleted { name }
    })
}

/// Returns `true` when the wait was abandoned on a watch error.
///
/// Unlike provisioning, a watch error is not retried: the instance may
/// already be gone, and a replay would then never see its deletion.
async fn wait_for_deletion<C: ControlPlane>(
    cp: &C,
    namespace: &str,
    identity: &JobIdentity,
    vm: &VirtualMachineInstance,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<bool, RunnerError> {
    let cursor = vm.cursor().unwrap_or_else(|| REPLAY_CURSOR.to_string());
    let what = format!("Virtual Machine instance {} to be deleted", vm.name_any());

    let mut abandoned = false;
    Watcher::new(cp, namespace, identity, cancel)
        .run(&cursor, deadline, &what, |event| {
            Ok(match event {
                WatchEvent::Deleted(_) => Control::Done,
                WatchEvent::Error(failure) => {
                    tracing::debug!(reason = %failure.reason, "{}", failure.message);
                    eprintln!(
                        "Couldn't wait for Virtual Machine instance to go away, abandoning it"
                    );
                    abandoned = true;
                    Control::Done
                }
                _ => Control::Continue,
            })
        })
        .await?;
    Ok(abandoned)
}
