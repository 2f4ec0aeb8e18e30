use clap::Parser;
use tokio_util::sync::CancellationToken;

use gitlab_runner_kubevirt::cli::Cli;
use gitlab_runner_kubevirt::{exit, logging, stage};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.debug);

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    if let Err(err) = stage::dispatch(cli, &cancel).await {
        let class = err.class();
        let prog = std::env::args()
            .next()
            .unwrap_or_else(|| "gitlab-runner-kubevirt".to_string());
        eprintln!("{prog}: {:?}", miette::Report::new(err));
        std::process::exit(exit::exit_code(class));
    }
}

/// Cancel in-flight waits on SIGINT or SIGTERM. The runner sends SIGTERM
/// when a job is cancelled or times out.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::debug!("cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::warn!("interrupted, cancelling");
    cancel.cancel();
}
