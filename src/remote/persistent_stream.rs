use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::auth::{AuthToken, CredentialsProviderArc};
use crate::error::{unknown_error, StoreError, StoreErrorCode, StoreResult};
use crate::platform::runtime;
use crate::util::assert::{fail, hard_assert};
use crate::util::async_queue::{box_queue_future, AsyncQueue, DelayedOperation, TimerId};
use crate::util::backoff::ExponentialBackoff;

use super::connection::{WireReceiver, WireSender, WireStream};

/// How long an open stream may sit without traffic before it is closed to
/// free backend resources. Reconnecting is cheap compared to holding an
/// idle slot.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle states of a persistent stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Not running, no backoff owed. `start` connects immediately.
    Initial,
    /// Fetching credentials and opening the transport stream.
    Starting,
    /// Waiting out the backoff delay before the next attempt.
    Backoff,
    /// Connected; requests and responses flow.
    Open,
    /// Closed after an error. `start` goes through backoff first.
    Error,
    /// Explicitly stopped. `start` treats this like `Initial`.
    Stopped,
}

fn flow_is_started(flow: StreamState) -> bool {
    matches!(
        flow,
        StreamState::Starting | StreamState::Open | StreamState::Backoff
    )
}

/// Stream-specific behavior plugged into [`PersistentStream`].
///
/// Hook futures run as queue operations, so implementations may assume they
/// never overlap with other queue work.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamHooks: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// Short name used in log lines.
    fn label(&self) -> &'static str;

    /// Opens the transport stream with the given credentials.
    async fn open_rpc(
        &self,
        token: Option<AuthToken>,
    ) -> StoreResult<WireStream<Self::Request, Self::Response>>;

    /// Runs once the stream is open, before any response is handled.
    async fn on_open(&self) -> StoreResult<()>;

    /// Handles one inbound frame.
    async fn on_message(&self, response: Self::Response) -> StoreResult<()>;

    /// Last chance to send trailing requests during a close. The machine
    /// state has already left `Open`, so only the raw sender works here.
    async fn tear_down(&self, sender: &WireSender<Self::Request>);

    /// Runs after every close, with the stream error if there was one.
    async fn on_close(&self, error: Option<StoreError>) -> StoreResult<()>;
}

struct MachineState<Req> {
    flow: StreamState,
    /// Bumped on every close. Dispatched callbacks capture the value and
    /// no-op once it has moved on, so events from a torn-down connection
    /// cannot touch its successor.
    close_count: u64,
    sender: Option<WireSender<Req>>,
    idle_timer: Option<DelayedOperation>,
}

/// Generic retrying stream: credential fetch, connect, backoff, idle
/// shutdown and close bookkeeping, with the protocol handled by [`H`].
///
/// Listen and write streams wrap this with their request/response types.
pub struct PersistentStream<H: StreamHooks> {
    queue: AsyncQueue,
    credentials: CredentialsProviderArc,
    /// Shared with the hooks so protocol code can reset the delay when the
    /// backend proves healthy.
    backoff: Arc<ExponentialBackoff>,
    idle_timer_id: TimerId,
    hooks: Arc<H>,
    state: Mutex<MachineState<H::Request>>,
}

impl<H: StreamHooks> PersistentStream<H> {
    pub fn new(
        queue: AsyncQueue,
        credentials: CredentialsProviderArc,
        backoff: Arc<ExponentialBackoff>,
        idle_timer_id: TimerId,
        hooks: Arc<H>,
    ) -> Arc<Self> {
        Arc::new(PersistentStream {
            queue,
            credentials,
            backoff,
            idle_timer_id,
            hooks,
            state: Mutex::new(MachineState {
                flow: StreamState::Initial,
                close_count: 0,
                sender: None,
                idle_timer: None,
            }),
        })
    }

    /// Whether `start` has been called and `stop` has not. A started stream
    /// may still be connecting or waiting out backoff.
    pub fn is_started(&self) -> bool {
        flow_is_started(self.state.lock().unwrap().flow)
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().flow == StreamState::Open
    }

    /// Starts the stream, waiting out the backoff first when the previous
    /// connection ended in an error.
    pub fn start(self: &Arc<Self>) {
        let close_count = {
            let mut state = self.state.lock().unwrap();
            if state.flow == StreamState::Error {
                drop(state);
                self.perform_backoff();
                return;
            }
            hard_assert(
                matches!(state.flow, StreamState::Initial | StreamState::Stopped),
                "Already started",
            );
            state.flow = StreamState::Starting;
            state.close_count
        };
        self.start_with_credentials(close_count);
    }

    /// Stops the stream if it is running, notifying the hooks without an
    /// error. Waiting backoff and idle timers are cancelled.
    pub async fn stop(self: &Arc<Self>) -> StoreResult<()> {
        if self.is_started() {
            self.close(StreamState::Stopped, None).await?;
        }
        Ok(())
    }

    /// Clears the backoff owed from a previous failure so the next `start`
    /// connects immediately. Only valid while the stream is not running.
    pub fn inhibit_backoff(&self) {
        hard_assert(
            !self.is_started(),
            "Can only inhibit backoff in a stopped state",
        );
        self.state.lock().unwrap().flow = StreamState::Initial;
        self.backoff.reset();
    }

    /// Arms the idle timer. If no request or response touches the stream
    /// before it fires, the stream closes cleanly back to `Initial`.
    pub fn mark_idle(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if state.flow == StreamState::Open && state.idle_timer.is_none() {
            let this = Arc::clone(self);
            state.idle_timer = Some(self.queue.enqueue_after_delay(
                self.idle_timer_id,
                IDLE_TIMEOUT,
                move || box_queue_future(async move { this.handle_idle_close_timer().await }),
            ));
        }
    }

    /// Sends a request on the open stream. Callers check `is_open` first;
    /// sending on a non-open stream is a programming error.
    pub async fn send_request(&self, request: H::Request) -> StoreResult<()> {
        let sender = {
            let mut state = self.state.lock().unwrap();
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            match &state.sender {
                Some(sender) => sender.clone(),
                None => fail(format!("{}: sending on a non-open stream", self.hooks.label())),
            }
        };
        if sender.send(request).await.is_err() {
            // The transport is gone; its close event is already on the way.
            log::debug!(
                "{}: dropped request on a disconnecting stream",
                self.hooks.label()
            );
        }
        Ok(())
    }

    fn start_with_credentials(self: &Arc<Self>, close_count: u64) {
        let this = Arc::clone(self);
        runtime::spawn_detached(async move {
            let token = this.credentials.get_token().await;
            let stream = Arc::clone(&this);
            this.queue.enqueue_and_forget(move || {
                box_queue_future(
                    async move { stream.resume_start_with_token(close_count, token).await },
                )
            });
        });
    }

    async fn resume_start_with_token(
        self: &Arc<Self>,
        close_count: u64,
        token: StoreResult<Option<AuthToken>>,
    ) -> StoreResult<()> {
        if self.skipped_after_close(close_count) {
            return Ok(());
        }

        let token = match token {
            Ok(token) => token,
            Err(error) => {
                let message = format!("Fetching auth token failed: {}", error.message());
                return self
                    .close(StreamState::Error, Some(unknown_error(message)))
                    .await;
            }
        };

        {
            let state = self.state.lock().unwrap();
            hard_assert(
                state.flow == StreamState::Starting,
                format!("Expected stream to be in state Starting, but was {:?}", state.flow),
            );
        }

        match self.hooks.open_rpc(token).await {
            Ok(wire) => {
                let (sender, receiver) = wire.split();
                {
                    let mut state = self.state.lock().unwrap();
                    state.sender = Some(sender);
                    state.flow = StreamState::Open;
                }
                self.spawn_read_loop(close_count, receiver);
                self.hooks.on_open().await
            }
            Err(error) => self.handle_stream_close(Some(error)).await,
        }
    }

    /// Forwards stream events onto the worker queue until the stream ends.
    fn spawn_read_loop(self: &Arc<Self>, close_count: u64, receiver: WireReceiver<H::Response>) {
        let this = Arc::clone(self);
        runtime::spawn_detached(async move {
            loop {
                match receiver.recv().await {
                    Some(Ok(response)) => {
                        let stream = Arc::clone(&this);
                        this.queue.enqueue_and_forget(move || {
                            box_queue_future(async move {
                                stream.handle_message(close_count, response).await
                            })
                        });
                    }
                    Some(Err(error)) => {
                        let stream = Arc::clone(&this);
                        this.queue.enqueue_and_forget(move || {
                            box_queue_future(async move {
                                stream.handle_close_event(close_count, Some(error)).await
                            })
                        });
                        break;
                    }
                    None => {
                        let stream = Arc::clone(&this);
                        this.queue.enqueue_and_forget(move || {
                            box_queue_future(async move {
                                stream.handle_close_event(close_count, None).await
                            })
                        });
                        break;
                    }
                }
            }
        });
    }

    async fn handle_message(
        self: &Arc<Self>,
        close_count: u64,
        response: H::Response,
    ) -> StoreResult<()> {
        if self.skipped_after_close(close_count) {
            return Ok(());
        }
        self.hooks.on_message(response).await
    }

    async fn handle_close_event(
        self: &Arc<Self>,
        close_count: u64,
        error: Option<StoreError>,
    ) -> StoreResult<()> {
        if self.skipped_after_close(close_count) {
            return Ok(());
        }
        self.handle_stream_close(error).await
    }

    async fn handle_stream_close(
        self: &Arc<Self>,
        error: Option<StoreError>,
    ) -> StoreResult<()> {
        hard_assert(
            self.is_started(),
            "Can't handle server close on non-started stream",
        );
        log::debug!("{}: close with error: {:?}", self.hooks.label(), error);
        // Every server close lands in Error, clean ones included: if the
        // stream is still wanted, the restart must go through backoff.
        self.close(StreamState::Error, error).await
    }

    /// Tears the stream down and settles it in `final_state`.
    ///
    /// Callback re-entrancy is expected: `on_close` may call `start` again,
    /// so no lock is held while the hooks run.
    async fn close(
        self: &Arc<Self>,
        final_state: StreamState,
        error: Option<StoreError>,
    ) -> StoreResult<()> {
        let sender = {
            let mut state = self.state.lock().unwrap();
            hard_assert(
                flow_is_started(state.flow),
                "Only started streams should be closed.",
            );
            hard_assert(
                final_state == StreamState::Error || error.is_none(),
                "Can't provide an error when not in an error state.",
            );

            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            self.backoff.cancel();
            state.close_count += 1;

            if final_state != StreamState::Error {
                // Clean close: nothing is owed on the next connect.
                self.backoff.reset();
            } else if let Some(error) = &error {
                match error.code() {
                    StoreErrorCode::ResourceExhausted => {
                        log::error!("{error}");
                        log::error!(
                            "Using maximum backoff delay to prevent overloading the backend."
                        );
                        self.backoff.reset_to_max();
                    }
                    StoreErrorCode::Unauthenticated => {
                        // The token was rejected; fetch a fresh one on the
                        // next attempt.
                        self.credentials.invalidate_token();
                    }
                    _ => {}
                }
            }

            state.flow = final_state;
            state.sender.take()
        };

        if let Some(sender) = sender {
            self.hooks.tear_down(&sender).await;
            sender.close();
        }

        self.hooks.on_close(error).await
    }

    fn perform_backoff(self: &Arc<Self>) {
        let close_count = {
            let mut state = self.state.lock().unwrap();
            hard_assert(
                state.flow == StreamState::Error,
                "Should only perform backoff when in Error state",
            );
            state.flow = StreamState::Backoff;
            state.close_count
        };
        let this = Arc::clone(self);
        self.backoff.backoff_and_run(move || {
            box_queue_future(async move {
                {
                    let mut state = this.state.lock().unwrap();
                    if state.close_count != close_count {
                        log::debug!("{}: backoff elapsed after close", this.hooks.label());
                        return Ok(());
                    }
                    hard_assert(
                        state.flow == StreamState::Backoff,
                        "Backoff elapsed but state is not Backoff",
                    );
                    state.flow = StreamState::Initial;
                }
                this.start();
                Ok(())
            })
        });
    }

    async fn handle_idle_close_timer(self: &Arc<Self>) -> StoreResult<()> {
        let open = {
            let mut state = self.state.lock().unwrap();
            state.idle_timer = None;
            state.flow == StreamState::Open
        };
        if open {
            self.close(StreamState::Initial, None).await
        } else {
            Ok(())
        }
    }

    fn skipped_after_close(&self, close_count: u64) -> bool {
        let skipped = self.state.lock().unwrap().close_count != close_count;
        if skipped {
            log::debug!(
                "{}: stream callback skipped after close",
                self.hooks.label()
            );
        }
        skipped
    }
}
