use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::ControlPlane;
use crate::cli::CleanupArgs;
use crate::config::JobContext;
use crate::deprovision::{CleanupOutcome, cleanup, parse_predicates};
use crate::error::RunnerError;

pub async fn run<C: ControlPlane>(
    cp: &C,
    job: &JobContext,
    args: &CleanupArgs,
    cancel: &CancellationToken,
) -> Result<CleanupOutcome, RunnerError> {
    let predicates = parse_predicates(&args.skip_if);
    let deadline = Instant::now() + args.timeout;

    let outcome = cleanup(cp, &job.namespace, &job.identity, &predicates, deadline, cancel).await?;
    tracing::debug!(?outcome, "cleanup finished");
    Ok(outcome)
}
