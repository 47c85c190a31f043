use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::OnlineState;
use crate::error::StoreError;
use crate::util::async_queue::{box_queue_future, AsyncQueue, DelayedOperation, TimerId};

/// Failures tolerated before the state flips to `Offline`. Kept at one so a
/// single broken attempt sends listeners to cache quickly; transient blips
/// recover through the next successful message.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// How long a freshly started stream may stay silent before the client is
/// presumed offline.
const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

pub type OnlineStateCallback = Box<dyn Fn(OnlineState) + Send + Sync>;

/// Derives the [`OnlineState`] from watch stream lifecycle events and
/// broadcasts transitions.
///
/// Lives behind the remote store; every method is called from the worker
/// queue, so the internal lock only guards against the delayed timeout
/// operation.
pub struct OnlineStateTracker {
    queue: AsyncQueue,
    state: Mutex<TrackerState>,
    on_change: OnlineStateCallback,
}

struct TrackerState {
    state: OnlineState,
    /// Consecutive stream failures since the last success or explicit set.
    watch_stream_failures: u32,
    /// Pending silence timeout, armed when a stream starts from a clean
    /// slate.
    online_state_timer: Option<DelayedOperation>,
    /// The first offline transition warns at error level; later ones only
    /// log at debug until the client has been online again.
    should_warn_client_is_offline: bool,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, on_change: OnlineStateCallback) -> Self {
        OnlineStateTracker {
            queue,
            state: Mutex::new(TrackerState {
                state: OnlineState::Unknown,
                watch_stream_failures: 0,
                online_state_timer: None,
                should_warn_client_is_offline: true,
            }),
            on_change,
        }
    }

    /// Called when the watch stream starts connecting. Arms the silence
    /// timeout unless this attempt follows earlier failures, in which case
    /// the failure path already decided the state.
    pub fn handle_watch_stream_start(self: &Arc<Self>) {
        let broadcast = {
            let mut state = self.state.lock().unwrap();
            if state.watch_stream_failures != 0 {
                return;
            }
            let broadcast = transition(&mut state, OnlineState::Unknown);
            debug_assert!(
                state.online_state_timer.is_none(),
                "online state timer already armed"
            );
            let this = Arc::clone(self);
            state.online_state_timer = Some(self.queue.enqueue_after_delay(
                TimerId::OnlineStateTimeout,
                ONLINE_STATE_TIMEOUT,
                move || {
                    box_queue_future(async move {
                        this.handle_online_state_timeout();
                        Ok(())
                    })
                },
            ));
            broadcast
        };
        self.broadcast(broadcast);
    }

    /// Called every time the watch stream closes with an error while targets
    /// are still active.
    ///
    /// A failure while `Online` only drops the state back to `Unknown`; the
    /// next failure (without an intervening message) flips it to `Offline`.
    pub fn handle_watch_stream_failure(&self, error: &StoreError) {
        let broadcast = {
            let mut state = self.state.lock().unwrap();
            if state.state == OnlineState::Online {
                debug_assert!(state.watch_stream_failures == 0, "stale failure count");
                debug_assert!(state.online_state_timer.is_none(), "stale online state timer");
                transition(&mut state, OnlineState::Unknown)
            } else {
                state.watch_stream_failures += 1;
                if state.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
                    clear_timer(&mut state);
                    log_offline_warning(
                        &mut state,
                        format!(
                            "Connection failed {MAX_WATCH_STREAM_FAILURES} times. \
                             Most recent error: {error}"
                        ),
                    );
                    transition(&mut state, OnlineState::Offline)
                } else {
                    None
                }
            }
        };
        self.broadcast(broadcast);
    }

    /// Sets the state directly, bypassing the failure heuristics. Used when
    /// the network is toggled, a message proves the stream healthy, or the
    /// client shuts down.
    pub fn set(&self, new_state: OnlineState) {
        let broadcast = {
            let mut state = self.state.lock().unwrap();
            clear_timer(&mut state);
            state.watch_stream_failures = 0;
            if new_state == OnlineState::Online {
                // A healthy connection re-arms the error-level warning for
                // the next offline transition.
                state.should_warn_client_is_offline = false;
            }
            transition(&mut state, new_state)
        };
        self.broadcast(broadcast);
    }

    fn handle_online_state_timeout(&self) {
        let broadcast = {
            let mut state = self.state.lock().unwrap();
            state.online_state_timer = None;
            debug_assert!(
                state.state == OnlineState::Unknown,
                "online state timer fired outside Unknown"
            );
            log_offline_warning(
                &mut state,
                format!(
                    "Backend didn't respond within {} seconds.",
                    ONLINE_STATE_TIMEOUT.as_secs()
                ),
            );
            // Failures during later retries keep counting, but the timer is
            // never re-armed; only a real message brings the state back.
            transition(&mut state, OnlineState::Offline)
        };
        self.broadcast(broadcast);
    }

    fn broadcast(&self, changed: Option<OnlineState>) {
        if let Some(state) = changed {
            (self.on_change)(state);
        }
    }
}

/// Applies the transition and reports whether it needs broadcasting. The
/// callback runs outside the lock.
fn transition(state: &mut TrackerState, new_state: OnlineState) -> Option<OnlineState> {
    if state.state == new_state {
        return None;
    }
    state.state = new_state;
    Some(new_state)
}

fn clear_timer(state: &mut TrackerState) {
    if let Some(timer) = state.online_state_timer.take() {
        timer.cancel();
    }
}

fn log_offline_warning(state: &mut TrackerState, details: String) {
    let message = format!(
        "Could not reach the sync backend. {details}\n\
         This typically indicates that your device does not have a healthy \
         Internet connection at the moment. The client will operate in \
         offline mode until it is able to successfully connect to the \
         backend."
    );
    if state.should_warn_client_is_offline {
        log::error!("{message}");
        state.should_warn_client_is_offline = false;
    } else {
        log::debug!("OnlineStateTracker: {message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::unavailable;

    fn tracker_with_log() -> (Arc<OnlineStateTracker>, Arc<Mutex<Vec<OnlineState>>>, AsyncQueue) {
        let queue = AsyncQueue::new();
        let log: Arc<Mutex<Vec<OnlineState>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let tracker = Arc::new(OnlineStateTracker::new(
            queue.clone(),
            Box::new(move |state| sink.lock().unwrap().push(state)),
        ));
        (tracker, log, queue)
    }

    #[tokio::test]
    async fn stays_unknown_until_timeout_then_goes_offline() {
        let (tracker, log, queue) = tracker_with_log();

        tracker.handle_watch_stream_start();
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        assert!(log.lock().unwrap().is_empty());

        queue
            .run_delayed_operations_early(TimerId::OnlineStateTimeout)
            .await;
        queue.drain().await;
        assert_eq!(*log.lock().unwrap(), vec![OnlineState::Offline]);
    }

    #[tokio::test]
    async fn single_failure_flips_offline() {
        let (tracker, log, queue) = tracker_with_log();

        tracker.handle_watch_stream_start();
        tracker.handle_watch_stream_failure(&unavailable("connection reset"));

        assert_eq!(*log.lock().unwrap(), vec![OnlineState::Offline]);
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
    }

    #[tokio::test]
    async fn failure_while_online_drops_to_unknown_first() {
        let (tracker, log, _queue) = tracker_with_log();

        tracker.set(OnlineState::Online);
        tracker.handle_watch_stream_failure(&unavailable("connection reset"));
        assert_eq!(
            *log.lock().unwrap(),
            vec![OnlineState::Online, OnlineState::Unknown]
        );

        // The next failure counts for real.
        tracker.handle_watch_stream_failure(&unavailable("connection reset"));
        assert_eq!(
            *log.lock().unwrap(),
            vec![OnlineState::Online, OnlineState::Unknown, OnlineState::Offline]
        );
    }

    #[tokio::test]
    async fn explicit_set_cancels_pending_timeout() {
        let (tracker, log, queue) = tracker_with_log();

        tracker.handle_watch_stream_start();
        tracker.set(OnlineState::Offline);
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        assert_eq!(*log.lock().unwrap(), vec![OnlineState::Offline]);

        // A healthy message brings the state back without heuristics.
        tracker.set(OnlineState::Online);
        assert_eq!(
            *log.lock().unwrap(),
            vec![OnlineState::Offline, OnlineState::Online]
        );
    }

    #[tokio::test]
    async fn repeat_starts_after_failures_do_not_rearm_timer() {
        let (tracker, _log, queue) = tracker_with_log();

        tracker.handle_watch_stream_start();
        tracker.handle_watch_stream_failure(&unavailable("connection reset"));
        tracker.handle_watch_stream_start();
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
    }
}
