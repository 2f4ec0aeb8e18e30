//! Follow the job instance's change stream until a caller-supplied predicate
//! is satisfied.
//!
//! The control plane closes watch connections whenever it likes, so the
//! stream ending is not an error: the watcher resubscribes from the last
//! resource version it saw. Only the deadline, cancellation, a predicate
//! failure or a failure to open the subscription end the wait early.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::backend::{ControlPlane, WatchEvent, identity_selector};
use crate::error::RunnerError;
use crate::identity::JobIdentity;

/// What the predicate wants after seeing an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Done,
}

/// Cursor that asks the server to replay from whatever state it holds.
pub const REPLAY_CURSOR: &str = "0";

const RESUBSCRIBE_DELAY_INITIAL: Duration = Duration::from_millis(100);
const RESUBSCRIBE_DELAY_MAX: Duration = Duration::from_secs(2);

pub struct Watcher<'a, C> {
    cp: &'a C,
    namespace: &'a str,
    selector: String,
    cancel: &'a CancellationToken,
}

enum Wake<T> {
    Cancelled,
    Deadline,
    Ready(T),
}

impl<'a, C: ControlPlane> Watcher<'a, C> {
    pub fn new(
        cp: &'a C,
        namespace: &'a str,
        identity: &JobIdentity,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            cp,
            namespace,
            selector: identity_selector(identity),
            cancel,
        }
    }

    /// Watch from `initial_cursor` until `on_event` returns `Done`.
    ///
    /// Object events are handed to `on_event` and move the cursor to the
    /// object's resource version. Bookmarks only move the cursor. An error
    /// event is handed to `on_event` too: `Continue` resets the cursor to
    /// [`REPLAY_CURSOR`] and resubscribes, `Done` ends the wait successfully.
    pub async fn run<F>(
        &self,
        initial_cursor: &str,
        deadline: Instant,
        what: &str,
        mut on_event: F,
    ) -> Result<(), RunnerError>
    where
        F: FnMut(&WatchEvent) -> Result<Control, RunnerError>,
    {
        let started = Instant::now();
        let mut cursor = initial_cursor.to_string();
        let mut idle_rounds: u32 = 0;

        loop {
            let opened = self
                .wake(deadline, self.cp.watch(self.namespace, &self.selector, &cursor))
                .await;
            let mut stream = match opened {
                Wake::Ready(result) => result?,
                Wake::Cancelled => return Err(cancelled(what)),
                Wake::Deadline => return Err(timed_out(what, started, deadline)),
            };

            let mut progressed = false;
            loop {
                let item = match self.wake(deadline, stream.next()).await {
                    Wake::Ready(item) => item,
                    Wake::Cancelled => return Err(cancelled(what)),
                    Wake::Deadline => return Err(timed_out(what, started, deadline)),
                };

                let event = match item {
                    None => break,
                    Some(Err(e)) => {
                        tracing::debug!(cursor = %cursor, "watch stream interrupted: {e}");
                        break;
                    }
                    Some(Ok(event)) => event,
                };

                match &event {
                    WatchEvent::Bookmark { resource_version } => {
                        cursor.clone_from(resource_version);
                        progressed = true;
                    }
                    WatchEvent::Error(failure) => {
                        tracing::debug!(
                            code = failure.code,
                            reason = %failure.reason,
                            "watch error: {}",
                            failure.message
                        );
                        match on_event(&event)? {
                            Control::Done => return Ok(()),
                            Control::Continue => {
                                cursor = REPLAY_CURSOR.to_string();
                                break;
                            }
                        }
                    }
                    WatchEvent::Added(vm) | WatchEvent::Modified(vm) | WatchEvent::Deleted(vm) => {
                        let control = on_event(&event)?;
                        if let Some(version) = vm.cursor() {
                            cursor = version;
                        }
                        progressed = true;
                        if control == Control::Done {
                            return Ok(());
                        }
                    }
                }
            }

            if progressed {
                idle_rounds = 0;
                continue;
            }
            idle_rounds = idle_rounds.saturating_add(1);
            let delay = resubscribe_delay(idle_rounds);
            tracing::debug!(cursor = %cursor, ?delay, "resubscribing");
            match self.wake(deadline, sleep(delay)).await {
                Wake::Ready(()) => {}
                Wake::Cancelled => return Err(cancelled(what)),
                Wake::Deadline => return Err(timed_out(what, started, deadline)),
            }
        }
    }

    async fn wake<T>(&self, deadline: Instant, fut: impl Future<Output = T>) -> Wake<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Wake::Cancelled,
            _ = sleep_until(deadline) => Wake::Deadline,
            value = fut => Wake::Ready(value),
        }
    }
}

/// Delay before the `round`th consecutive resubscription that saw no event.
fn resubscribe_delay(round: u32) -> Duration {
    let shift = round.saturating_sub(1).min(8);
    RESUBSCRIBE_DELAY_INITIAL
        .saturating_mul(1 << shift)
        .min(RESUBSCRIBE_DELAY_MAX)
}

fn cancelled(what: &str) -> RunnerError {
    RunnerError::Cancelled {
        what: what.to_string(),
    }
}

fn timed_out(what: &str, started: Instant, deadline: Instant) -> RunnerError {
    RunnerError::WatchTimeout {
        what: what.to_string(),
        waited: deadline.saturating_duration_since(started),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::backend::WatchFailure;
    use crate::backend::memory::MemoryControlPlane;
    use crate::instance::tests::with_status;

    fn modified(version: &str, ready: bool) -> WatchEvent {
        let mut vm = with_status("vm-a", "Running", Some("10.0.0.2"), ready);
        vm.metadata.resource_version = Some(version.into());
        WatchEvent::Modified(vm)
    }

    fn until_ready(event: &WatchEvent) -> Result<Control, RunnerError> {
        match event.object() {
            Some(vm) if vm.is_ready() => Ok(Control::Done),
            _ => Ok(Control::Continue),
        }
    }

    fn id() -> JobIdentity {
        JobIdentity::for_job("1", "2", "0", "3")
    }

    #[tokio::test(start_paused = true)]
    async fn done_on_first_matching_event() {
        let cp = MemoryControlPlane::new();
        cp.push_watch_session(vec![Ok(modified("11", false)), Ok(modified("12", true))]);
        let cancel = CancellationToken::new();
        let id = id();
        let watcher = Watcher::new(&cp, "ci", &id, &cancel);

        let calls = Cell::new(0);
        watcher
            .run("10", Instant::now() + Duration::from_secs(60), "vm", |e| {
                calls.set(calls.get() + 1);
                until_ready(e)
            })
            .await
            .unwrap();
        assert_eq!(calls.get(), 2);
        assert_eq!(cp.watch_cursors(), vec!["10"]);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribes_from_last_seen_version() {
        let cp = MemoryControlPlane::new();
        cp.push_watch_session(vec![
            Ok(modified("11", false)),
            Ok(WatchEvent::Bookmark {
                resource_version: "15".into(),
            }),
        ]);
        cp.push_watch_session(vec![Err("unexpected EOF".into())]);
        cp.push_watch_session(vec![Ok(modified("16", true))]);
        let cancel = CancellationToken::new();
        let id = id();

        let calls = Cell::new(0);
        Watcher::new(&cp, "ci", &id, &cancel)
            .run("10", Instant::now() + Duration::from_secs(60), "vm", |e| {
                calls.set(calls.get() + 1);
                until_ready(e)
            })
            .await
            .unwrap();
        assert_eq!(cp.watch_cursors(), vec!["10", "15", "15"]);
        assert_eq!(calls.get(), 2, "bookmarks are not delivered");
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_error_replays_from_zero() {
        let cp = MemoryControlPlane::new();
        cp.push_watch_session(vec![
            Ok(modified("11", false)),
            Ok(WatchEvent::Error(WatchFailure {
                code: 410,
                reason: "Expired".into(),
                message: "too old resource version".into(),
            })),
        ]);
        cp.push_watch_session(vec![Ok(modified("40", true))]);
        let cancel = CancellationToken::new();
        let id = id();

        Watcher::new(&cp, "ci", &id, &cancel)
            .run("10", Instant::now() + Duration::from_secs(60), "vm", until_ready)
            .await
            .unwrap();
        assert_eq!(cp.watch_cursors(), vec!["10", REPLAY_CURSOR]);
    }

    #[tokio::test(start_paused = true)]
    async fn error_event_can_end_the_wait() {
        let cp = MemoryControlPlane::new();
        cp.push_watch_session(vec![Ok(WatchEvent::Error(WatchFailure::default()))]);
        let cancel = CancellationToken::new();
        let id = id();

        Watcher::new(&cp, "ci", &id, &cancel)
            .run("10", Instant::now() + Duration::from_secs(60), "vm", |e| {
                Ok(match e {
                    WatchEvent::Error(_) => Control::Done,
                    _ => Control::Continue,
                })
            })
            .await
            .unwrap();
        assert_eq!(cp.watch_cursors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_failure_propagates() {
        let cp = MemoryControlPlane::new();
        cp.push_watch_session(vec![Ok(modified("11", false))]);
        let cancel = CancellationToken::new();
        let id = id();

        let err = Watcher::new(&cp, "ci", &id, &cancel)
            .run("10", Instant::now() + Duration::from_secs(60), "vm", |_| {
                Err(RunnerError::Validation {
                    message: "boom".into(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Validation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_times_out() {
        let cp = MemoryControlPlane::new();
        let cancel = CancellationToken::new();
        let id = id();

        let err = Watcher::new(&cp, "ci", &id, &cancel)
            .run("10", Instant::now() + Duration::from_secs(30), "vm ready", until_ready)
            .await
            .unwrap_err();
        match err {
            RunnerError::WatchTimeout { what, waited } => {
                assert_eq!(what, "vm ready");
                assert_eq!(waited, Duration::from_secs(30));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_sessions_back_off_until_deadline() {
        let cp = MemoryControlPlane::new();
        for _ in 0..3 {
            cp.push_watch_session(Vec::new());
        }
        let cancel = CancellationToken::new();
        let id = id();
        let started = Instant::now();

        let err = Watcher::new(&cp, "ci", &id, &cancel)
            .run("10", started + Duration::from_secs(5), "vm", until_ready)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::WatchTimeout { .. }));
        // three empty sessions, then the fourth subscription hangs
        assert_eq!(cp.watch_cursors(), vec!["10"; 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins() {
        let cp = MemoryControlPlane::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let id = id();

        let err = Watcher::new(&cp, "ci", &id, &cancel)
            .run("10", Instant::now() + Duration::from_secs(30), "vm", until_ready)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Cancelled { .. }));
    }

    #[test]
    fn resubscribe_delay_is_capped() {
        assert_eq!(resubscribe_delay(1), Duration::from_millis(100));
        assert_eq!(resubscribe_delay(2), Duration::from_millis(200));
        assert_eq!(resubscribe_delay(30), RESUBSCRIBE_DELAY_MAX);
    }
}
