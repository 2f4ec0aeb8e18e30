//! Job identity derivation.
//!
//! Every stage of a job runs in its own process, so the only thing tying a
//! `prepare` to its later `run` and `cleanup` is a value all of them can
//! recompute from the runner environment. That value ends up as a label on
//! the VirtualMachineInstance.

use std::fmt;

use sha1::{Digest, Sha1};

/// Stable identity of one CI job, rendered as a 40-char lowercase hex digest.
///
/// 40 characters keeps it under the 63-character limit on Kubernetes label
/// values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct JobIdentity(String);

impl JobIdentity {
    /// Identity of the job described by the runner's four job coordinates.
    pub fn for_job(runner_id: &str, project_id: &str, concurrent_id: &str, job_id: &str) -> Self {
        derive(&[runner_id, project_id, concurrent_id, job_id])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash an ordered list of fields into an identity.
///
/// The field count goes in first, then each field as its byte length followed
/// by its bytes (lengths are big-endian u64). `["ab", "c"]` and `["a", "bc"]`
/// therefore hash different byte streams even though they concatenate to the
/// same string.
pub fn derive(fields: &[&str]) -> JobIdentity {
    let mut hasher = Sha1::new();
    hasher.update((fields.len() as u64).to_be_bytes());
    for field in fields {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    JobIdentity(hex::encode(hasher.finalize()))
}
