//! Process exit codes the runner interprets.
//!
//! The runner tells system failures (retry-worthy) from build failures (the
//! job's fault) by exit code, and lets the operator pick both codes through
//! environment variables.

use crate::error::FailureClass;

pub const SYSTEM_FAILURE_ENV: &str = "SYSTEM_FAILURE_EXIT_CODE";
pub const BUILD_FAILURE_ENV: &str = "BUILD_FAILURE_EXIT_CODE";

const DEFAULT_SYSTEM_FAILURE: i32 = 2;
const DEFAULT_BUILD_FAILURE: i32 = 1;

/// Exit code for a failure class, read from the process environment.
pub fn exit_code(class: FailureClass) -> i32 {
    resolve(class, |key| std::env::var(key).ok())
}

/// Exit code for a failure class with an explicit variable lookup.
///
/// An override that is not an integer is reported on stderr and the
/// compiled-in default is used.
pub fn resolve(class: FailureClass, lookup: impl Fn(&str) -> Option<String>) -> i32 {
    let (env, default) = match class {
        FailureClass::System => (SYSTEM_FAILURE_ENV, DEFAULT_SYSTEM_FAILURE),
        FailureClass::Build => (BUILD_FAILURE_ENV, DEFAULT_BUILD_FAILURE),
    };

    match lookup(env) {
        Some(code) if !code.is_empty() => match code.trim().parse::<i32>() {
            Ok(val) => val,
            Err(e) => {
                eprintln!("{env}={code} is not a valid exit code: {e}");
                default
            }
        },
        _ => default,
    }
}
