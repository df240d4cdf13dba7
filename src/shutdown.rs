//! Drain-aware shutdown
//!
//! [ServerState] counts the requests being served and holds the `closed`
//! flag. A warm close flips the flag, asks the control channel to close,
//! then waits for the active-work counter to reach zero. A cold close
//! gives up on in-flight work.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::info;
use tokio::sync::watch;

pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(1);
pub const DEFAULT_DRAIN_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Stop right away, discarding in-flight work
    Cold,
    /// Stop admitting work, then drain what is in flight
    Warm,
}

/// What the process should do once [ServerState::request_close] returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Work was drained, exit cleanly
    Drained,
    /// Exit abruptly
    Abort,
}

#[derive(Debug, Default)]
struct Drain {
    active: usize,
    closed: bool,
}

/// Process-wide drain state
#[derive(Debug)]
pub struct ServerState {
    drain: Mutex<Drain>,
    closing: watch::Sender<bool>,
    grace: Duration,
    poll: Duration,
}

impl Default for ServerState {
    fn default() -> Self {
        ServerState::new(DEFAULT_DRAIN_GRACE, DEFAULT_DRAIN_POLL)
    }
}

impl ServerState {
    pub fn new(grace: Duration, poll: Duration) -> ServerState {
        let (closing, _) = watch::channel(false);
        ServerState {
            drain: Mutex::new(Drain::default()),
            closing,
            grace,
            poll,
        }
    }

    fn drain(&self) -> std::sync::MutexGuard<'_, Drain> {
        self.drain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the start of a unit of work. The work ends when the returned
    /// guard is dropped, error paths and panics included
    pub fn begin_work(self: &Arc<Self>) -> WorkGuard {
        self.drain().active += 1;
        WorkGuard {
            state: self.clone(),
        }
    }

    fn end_work(&self) {
        let mut drain = self.drain();
        drain.active = drain.active.saturating_sub(1);
    }

    pub fn active_work(&self) -> usize {
        self.drain().active
    }

    pub fn is_closed(&self) -> bool {
        self.drain().closed
    }

    /// Receiver flipped to `true` when a close starts. The peer control
    /// client drops its connection to the master on it
    pub fn subscribe_close(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    /// Mode a new close signal should use: warm the first time, cold once a
    /// close is already under way
    pub fn next_close_mode(&self) -> CloseMode {
        if self.is_closed() {
            CloseMode::Cold
        } else {
            CloseMode::Warm
        }
    }

    /// Cold returns [CloseOutcome::Abort] immediately. Warm sets `closed`,
    /// closes the control channel, waits the grace interval and then polls
    /// until no work is active
    pub async fn request_close(&self, mode: CloseMode) -> CloseOutcome {
        {
            let mut drain = self.drain();
            drain.closed = true;
        }
        self.closing.send_replace(true);

        if mode == CloseMode::Cold {
            return CloseOutcome::Abort;
        }

        tokio::time::sleep(self.grace).await;
        loop {
            let active = self.active_work();
            if active == 0 {
                break;
            }
            info!(active:% = active; "Waiting for active downloads");
            tokio::time::sleep(self.poll).await;
        }
        CloseOutcome::Drained
    }
}

/// Scoped unit of work on a [ServerState]
#[derive(Debug)]
pub struct WorkGuard {
    state: Arc<ServerState>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.state.end_work();
    }
}

#[cfg(unix)]
struct Signals {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> std::io::Result<Signals> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Signals {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.hangup.recv() => "SIGHUP",
        }
    }
}

/// Waits for termination signals and closes `state` accordingly
///
/// The first signal starts a warm close. A second signal arriving while
/// the drain is still running turns it into a cold close
#[cfg(unix)]
pub async fn wait_for_signals(state: Arc<ServerState>) -> std::io::Result<CloseOutcome> {
    let mut signals = Signals::install()?;

    let received = signals.recv().await;
    info!(signal:% = received; "Received signal, warm close, waiting");
    let warm_close = state.request_close(state.next_close_mode());
    tokio::pin!(warm_close);

    let outcome = tokio::select! {
        outcome = &mut warm_close => outcome,
        received = signals.recv() => {
            info!(signal:% = received; "Received signal, cold close");
            state.request_close(CloseMode::Cold).await
        }
    };
    Ok(outcome)
}

#[cfg(not(unix))]
pub async fn wait_for_signals(state: Arc<ServerState>) -> std::io::Result<CloseOutcome> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, warm close, waiting");
    let warm_close = state.request_close(state.next_close_mode());
    tokio::pin!(warm_close);

    let outcome = tokio::select! {
        outcome = &mut warm_close => outcome,
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received Ctrl+C, cold close");
            state.request_close(CloseMode::Cold).await
        }
    };
    Ok(outcome)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn fast_state() -> Arc<ServerState> {
        Arc::new(ServerState::new(
            Duration::from_millis(10),
            Duration::from_millis(10),
        ))
    }

    #[test]
    fn guard_pairs_begin_and_end() {
        let state = fast_state();
        let first = state.begin_work();
        let second = state.begin_work();
        assert_eq!(state.active_work(), 2);
        drop(first);
        assert_eq!(state.active_work(), 1);
        drop(second);
        assert_eq!(state.active_work(), 0);
    }

    #[test]
    fn guard_is_released_on_error_path() {
        let state = fast_state();
        let handler = |state: &Arc<ServerState>| -> Result<(), String> {
            let _work = state.begin_work();
            Err("origin failure".to_string())
        };
        assert!(handler(&state).is_err());
        assert_eq!(state.active_work(), 0);
    }

    #[tokio::test]
    async fn warm_close_waits_for_all_work() {
        let state = fast_state();
        let finished = Arc::new(AtomicUsize::new(0));
        let n = 8;

        for i in 0..n {
            let work = state.begin_work();
            let finished = finished.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50 + 10 * i)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                drop(work);
            });
        }

        let outcome = state.request_close(CloseMode::Warm).await;
        assert_eq!(outcome, CloseOutcome::Drained);
        assert_eq!(finished.load(Ordering::SeqCst), n as usize);
        assert_eq!(state.active_work(), 0);
        assert!(state.is_closed());
    }

    #[tokio::test]
    async fn cold_close_returns_with_outstanding_work() {
        let state = Arc::new(ServerState::new(
            Duration::from_secs(60),
            Duration::from_secs(60),
        ));
        let _work = state.begin_work();

        let t0 = Instant::now();
        let outcome = state.request_close(CloseMode::Cold).await;
        assert_eq!(outcome, CloseOutcome::Abort);
        assert!(t0.elapsed() < Duration::from_secs(1));
        assert_eq!(state.active_work(), 1);
    }

    #[tokio::test]
    async fn close_notifies_subscribers() {
        let state = fast_state();
        let mut closing = state.subscribe_close();
        assert!(!*closing.borrow());
        assert_eq!(state.next_close_mode(), CloseMode::Warm);

        state.request_close(CloseMode::Warm).await;
        closing.changed().await.unwrap();
        assert!(*closing.borrow());
        assert_eq!(state.next_close_mode(), CloseMode::Cold);
    }
}
