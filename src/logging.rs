use std::path::Path;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the stderr subscriber.
///
/// Everything ends up in the job log, so lines carry neither timestamps nor
/// targets. `RUST_LOG` is honoured; `--debug` raises this crate to `debug`.
pub fn init(debug: bool) {
    let rust_log_set = std::env::var_os(EnvFilter::DEFAULT_ENV).is_some();
    let mut filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::WARN.into())
        .from_env_lossy();
    if let Some(directive) = crate_directive(debug, rust_log_set) {
        filter = filter.add_directive(directive.parse().expect("valid log directive"));
    }

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .with_filter(filter);

    tracing_subscriber::registry().with(stderr_layer).init();
}

/// Level this crate logs at on top of `RUST_LOG`. Without `--debug`, a
/// `RUST_LOG` that is set decides on its own.
fn crate_directive(debug: bool, rust_log_set: bool) -> Option<&'static str> {
    match (debug, rust_log_set) {
        (true, _) => Some("gitlab_runner_kubevirt=debug"),
        (false, false) => Some("gitlab_runner_kubevirt=info"),
        (false, true) => None,
    }
}

/// Switch for the verbose diagnostic stream: connection attempts, uploaded
/// script contents and the exact remote command.
///
/// Passed explicitly to the components that emit diagnostics so the choice is
/// made once, at startup, by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    enabled: bool,
}

impl Diagnostics {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn connect_attempt(self, addr: &str, attempt: u32) {
        if self.enabled {
            tracing::info!(addr, attempt, "attempting to connect to {addr}...");
        }
    }

    pub fn dial_failed(self, addr: &str, err: &std::io::Error) {
        if self.enabled {
            tracing::info!(addr, "{err}");
        }
    }

    /// Echo a script before it is uploaded. Reads the file only when enabled.
    pub fn script_contents(self, path: &Path) {
        if !self.enabled {
            return;
        }
        tracing::info!("uploading script {}", path.display());
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!("contents of {}:\n{contents}\n---", path.display());
            }
            Err(e) => tracing::info!("contents of {}: <ERROR: {e}>", path.display()),
        }
    }

    pub fn command(self, argv: &[String]) {
        if self.enabled {
            tracing::info!("executing {argv:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_decides_without_debug() {
        assert_eq!(crate_directive(false, true), None);
        assert_eq!(
            crate_directive(false, false),
            Some("gitlab_runner_kubevirt=info")
        );
    }

    #[test]
    fn debug_always_raises_crate_level() {
        for rust_log_set in [false, true] {
            assert_eq!(
                crate_directive(true, rust_log_set),
                Some("gitlab_runner_kubevirt=debug")
            );
        }
    }
}
