#![allow(unused_assignments)]

use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::quantity::QuantityError;

/// How a failure is reported to the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Infrastructure or transport problem; the runner may retry the job.
    System,
    /// The job's own script failed on the VM.
    Build,
}

/// Which side of a resource bound a quantity was given for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Request,
    Limit,
}

impl std::fmt::Display for Bound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Bound::Request => "request",
            Bound::Limit => "limit",
        })
    }
}

/// How the remote command ended when it did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteExit {
    Status(u32),
    Signal(String),
}

impl std::fmt::Display for RemoteExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteExit::Status(code) => write!(f, "command exited with status {code}"),
            RemoteExit::Signal(sig) => write!(f, "command crashed with signal {sig}"),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    #[error("{context}")]
    #[diagnostic(help("check that the cluster is reachable and the service account may manage VirtualMachineInstances"))]
    Kube {
        context: String,
        #[source]
        source: kube::Error,
    },

    #[error("Virtual Machine instance disappeared while the job was running! (no instance labelled {identity} in namespace {namespace})")]
    InstanceVanished { namespace: String, identity: String },

    #[error("Virtual Machine instance has ambiguous ID! {count} instances found with ID {identity}")]
    AmbiguousIdentity { count: usize, identity: String },

    #[error("must specify a containerdisk image")]
    #[diagnostic(help("set `image:` in the job or pass --default-image to prepare"))]
    MissingImage,

    #[error("parsing {resource} {bound} quantity '{value}'")]
    InvalidResourceQuantity {
        resource: &'static str,
        bound: Bound,
        value: String,
        #[source]
        source: QuantityError,
    },

    #[error("timed out after {waited:?} waiting for {what}")]
    WatchTimeout { what: String, waited: Duration },

    #[error("cancelled while {what}")]
    Cancelled { what: String },

    #[error("Virtual Machine instance {name} has no run configuration annotation")]
    MissingRunConfig { name: String },

    #[error("Virtual Machine instance {name} has an unreadable run configuration")]
    InvalidRunConfig {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Virtual Machine instance {name} is not running (phase: {phase})")]
    NotRunning { name: String, phase: String },

    #[error("Virtual Machine instance {name} has no IP; is it running?")]
    NoAddress { name: String },

    #[error("could not connect to {addr} within {waited:?}")]
    ConnectTimeout {
        addr: String,
        waited: Duration,
        #[source]
        last_error: Option<std::io::Error>,
    },

    #[error("ssh {context}")]
    Ssh {
        context: String,
        #[source]
        source: russh::Error,
    },

    #[error("ssh authentication rejected for user '{user}' at {addr}")]
    #[diagnostic(help("check --ssh-user and --ssh-password / --ssh-private-key-file"))]
    SshAuth { user: String, addr: String },

    #[error("failed to load ssh private key {path}")]
    SshKey {
        path: String,
        #[source]
        source: russh::keys::Error,
    },

    #[error("sftp {context}")]
    Sftp {
        context: String,
        #[source]
        source: russh_sftp::client::error::Error,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("remote command on {addr} ended without reporting an exit status")]
    ExitMissing { addr: String },

    #[error("{exit}")]
    BuildFailure { exit: RemoteExit },

    #[error("validation error: {message}")]
    Validation { message: String },
}

impl RunnerError {
    pub fn class(&self) -> FailureClass {
        match self {
            RunnerError::BuildFailure { .. } => FailureClass::Build,
            _ => FailureClass::System,
        }
    }

    pub(crate) fn kube(context: impl Into<String>, source: kube::Error) -> Self {
        RunnerError::Kube {
            context: context.into(),
            source,
        }
    }
}
