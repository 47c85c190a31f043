use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::channel::oneshot;
use futures::FutureExt;

use crate::error::{cancelled, StoreError, StoreErrorCode, StoreResult};
use crate::platform::runtime;
use crate::util::assert::{fail, hard_assert};
use crate::util::backoff::{self, BackoffConfig};

/// Well-known timers scheduled on the queue. At most one operation per timer
/// id may be pending at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerId {
    /// Matches every timer id in [`AsyncQueue::run_delayed_operations_early`].
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    GarbageCollectionDelay,
    RetryTransaction,
}

#[cfg(target_arch = "wasm32")]
pub type QueueFuture<T> = futures::future::LocalBoxFuture<'static, T>;
#[cfg(not(target_arch = "wasm32"))]
pub type QueueFuture<T> = futures::future::BoxFuture<'static, T>;

#[cfg(target_arch = "wasm32")]
pub fn box_queue_future<F, T>(future: F) -> QueueFuture<T>
where
    F: Future<Output = T> + 'static,
{
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub fn box_queue_future<F, T>(future: F) -> QueueFuture<T>
where
    F: Future<Output = T> + Send + 'static,
{
    future.boxed()
}

#[cfg(target_arch = "wasm32")]
type QueueOp = Box<dyn FnOnce() -> QueueFuture<()> + 'static>;
#[cfg(not(target_arch = "wasm32"))]
type QueueOp = Box<dyn FnOnce() -> QueueFuture<()> + Send + 'static>;

#[cfg(target_arch = "wasm32")]
type RetryableOp = Box<dyn FnMut() -> QueueFuture<StoreResult<()>> + 'static>;
#[cfg(not(target_arch = "wasm32"))]
type RetryableOp = Box<dyn FnMut() -> QueueFuture<StoreResult<()>> + Send + 'static>;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Serialized operation queue.
///
/// Every piece of client state is only touched from operations submitted
/// here, which run strictly in submission order and to completion before the
/// next one starts. A failed operation poisons the queue: the failure is
/// logged and any later attempt to enqueue panics, so that bugs surface
/// instead of silently corrupting local state.
#[derive(Clone)]
pub struct AsyncQueue {
    core: Arc<QueueCore>,
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded::<QueueOp>();
        runtime::spawn_detached(async move {
            while let Ok(op) = receiver.recv().await {
                op().await;
            }
        });
        Self {
            core: Arc::new(QueueCore {
                sender,
                poisoned: AtomicBool::new(false),
                delayed: Mutex::new(Vec::new()),
                next_sequence: AtomicU64::new(0),
                retryable: Mutex::new(VecDeque::new()),
                retry_base_millis: Mutex::new(0.0),
                retry_timer: Mutex::new(None),
            }),
        }
    }

    /// Runs the operation on the queue and resolves with its result.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn enqueue<O, T>(&self, op: O) -> impl Future<Output = StoreResult<T>>
    where
        O: FnOnce() -> QueueFuture<StoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel::<StoreResult<T>>();
        let core = Arc::clone(&self.core);
        self.core.submit(Box::new(move || {
            box_queue_future(async move {
                let result = op().await;
                if let Err(err) = &result {
                    core.record_failure(err);
                }
                let _ = sender.send(result);
            })
        }));
        async move {
            match receiver.await {
                Ok(result) => result,
                Err(_) => Err(cancelled("operation queue dropped the operation")),
            }
        }
    }

    /// Runs the operation on the queue and resolves with its result.
    #[cfg(target_arch = "wasm32")]
    pub fn enqueue<O, T>(&self, op: O) -> impl Future<Output = StoreResult<T>>
    where
        O: FnOnce() -> QueueFuture<StoreResult<T>> + 'static,
        T: 'static,
    {
        let (sender, receiver) = oneshot::channel::<StoreResult<T>>();
        let core = Arc::clone(&self.core);
        self.core.submit(Box::new(move || {
            box_queue_future(async move {
                let result = op().await;
                if let Err(err) = &result {
                    core.record_failure(err);
                }
                let _ = sender.send(result);
            })
        }));
        async move {
            match receiver.await {
                Ok(result) => result,
                Err(_) => Err(cancelled("operation queue dropped the operation")),
            }
        }
    }

    /// Runs the operation on the queue without waiting for its result.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn enqueue_and_forget<O>(&self, op: O)
    where
        O: FnOnce() -> QueueFuture<StoreResult<()>> + Send + 'static,
    {
        let core = Arc::clone(&self.core);
        self.core.submit(Box::new(move || {
            box_queue_future(async move {
                if let Err(err) = op().await {
                    core.record_failure(&err);
                }
            })
        }));
    }

    /// Runs the operation on the queue without waiting for its result.
    #[cfg(target_arch = "wasm32")]
    pub fn enqueue_and_forget<O>(&self, op: O)
    where
        O: FnOnce() -> QueueFuture<StoreResult<()>> + 'static,
    {
        let core = Arc::clone(&self.core);
        self.core.submit(Box::new(move || {
            box_queue_future(async move {
                if let Err(err) = op().await {
                    core.record_failure(&err);
                }
            })
        }));
    }

    /// Schedules an operation to be submitted after the delay elapses.
    ///
    /// The returned handle can cancel the timer or fire it immediately.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn enqueue_after_delay<O>(&self, timer_id: TimerId, delay: Duration, op: O) -> DelayedOperation
    where
        O: FnOnce() -> QueueFuture<StoreResult<()>> + Send + 'static,
    {
        let core = Arc::clone(&self.core);
        self.core.schedule(
            timer_id,
            delay,
            Box::new(move || {
                box_queue_future(async move {
                    if let Err(err) = op().await {
                        core.record_failure(&err);
                    }
                })
            }),
        )
    }

    /// Schedules an operation to be submitted after the delay elapses.
    ///
    /// The returned handle can cancel the timer or fire it immediately.
    #[cfg(target_arch = "wasm32")]
    pub fn enqueue_after_delay<O>(&self, timer_id: TimerId, delay: Duration, op: O) -> DelayedOperation
    where
        O: FnOnce() -> QueueFuture<StoreResult<()>> + 'static,
    {
        let core = Arc::clone(&self.core);
        self.core.schedule(
            timer_id,
            delay,
            Box::new(move || {
                box_queue_future(async move {
                    if let Err(err) = op().await {
                        core.record_failure(&err);
                    }
                })
            }),
        )
    }

    /// Runs the operation on the queue, retrying with exponential backoff as
    /// long as it fails with [`StoreErrorCode::Unavailable`].
    ///
    /// Local persistence reports transient storage faults with that code, so
    /// operations submitted here survive flaky storage without losing their
    /// relative order. Retryable operations never run ahead of one another.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn enqueue_retryable<O>(&self, op: O)
    where
        O: FnMut() -> QueueFuture<StoreResult<()>> + Send + 'static,
    {
        self.core.enqueue_retryable_boxed(Box::new(op));
    }

    /// Runs the operation on the queue, retrying with exponential backoff as
    /// long as it fails with [`StoreErrorCode::Unavailable`].
    #[cfg(target_arch = "wasm32")]
    pub fn enqueue_retryable<O>(&self, op: O)
    where
        O: FnMut() -> QueueFuture<StoreResult<()>> + 'static,
    {
        self.core.enqueue_retryable_boxed(Box::new(op));
    }

    /// Waits until every operation submitted so far has completed.
    ///
    /// Pending delayed operations are not run; use
    /// [`Self::run_delayed_operations_early`] for those.
    pub async fn drain(&self) {
        let _ = self.enqueue(|| box_queue_future(async { Ok(()) })).await;
    }

    /// Returns whether a timer with the given id is pending.
    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.core.contains_delayed(timer_id)
    }

    /// Fires pending delayed operations ahead of schedule, in target-time
    /// order, stopping after the first one matching `last_timer_id`.
    /// `TimerId::All` fires everything. Intended for tests.
    pub async fn run_delayed_operations_early(&self, last_timer_id: TimerId) {
        self.drain().await;
        let mut pending = self.core.delayed.lock().unwrap().clone();
        pending.sort_by_key(|state| (state.target_time_millis, state.sequence));
        for state in pending {
            let timer_id = state.timer_id;
            state.fire();
            if last_timer_id != TimerId::All && timer_id == last_timer_id {
                break;
            }
        }
        self.drain().await;
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

struct QueueCore {
    sender: async_channel::Sender<QueueOp>,
    poisoned: AtomicBool,
    delayed: Mutex<Vec<Arc<DelayedState>>>,
    next_sequence: AtomicU64,
    retryable: Mutex<VecDeque<RetryableOp>>,
    retry_base_millis: Mutex<f64>,
    retry_timer: Mutex<Option<DelayedOperation>>,
}

impl QueueCore {
    fn submit(&self, op: QueueOp) {
        if self.poisoned.load(Ordering::SeqCst) {
            fail("AsyncQueue is already failed: cannot enqueue new operations");
        }
        if self.sender.try_send(op).is_err() {
            log::warn!("AsyncQueue: dropped operation submitted after shutdown");
        }
    }

    fn record_failure(&self, error: &StoreError) {
        self.poisoned.store(true, Ordering::SeqCst);
        log::error!("AsyncQueue: INTERNAL UNHANDLED ERROR: {error}");
    }

    fn schedule(self: &Arc<Self>, timer_id: TimerId, delay: Duration, op: QueueOp) -> DelayedOperation {
        hard_assert(
            !self.contains_delayed(timer_id),
            format!("attempted to schedule multiple operations with timer id {timer_id:?}"),
        );
        let state = Arc::new(DelayedState {
            timer_id,
            target_time_millis: now_millis() + delay.as_millis() as i64,
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            op: Mutex::new(Some(op)),
            core: Arc::downgrade(self),
        });
        self.delayed.lock().unwrap().push(Arc::clone(&state));
        let timer_state = Arc::clone(&state);
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            timer_state.fire();
        });
        DelayedOperation { state }
    }

    fn contains_delayed(&self, timer_id: TimerId) -> bool {
        self.delayed
            .lock()
            .unwrap()
            .iter()
            .any(|state| state.timer_id == timer_id)
    }

    fn remove_delayed(&self, target: &DelayedState) {
        let mut delayed = self.delayed.lock().unwrap();
        delayed.retain(|state| !std::ptr::eq(state.as_ref(), target));
    }

    fn enqueue_retryable_boxed(self: &Arc<Self>, op: RetryableOp) {
        self.retryable.lock().unwrap().push_back(op);
        let core = Arc::clone(self);
        self.submit(Box::new(move || core.retry_next_op()));
    }

    fn retry_next_op(self: Arc<Self>) -> QueueFuture<()> {
        box_queue_future(async move {
            let mut op = match self.retryable.lock().unwrap().pop_front() {
                Some(op) => op,
                None => return,
            };
            match op().await {
                Ok(()) => {
                    *self.retry_base_millis.lock().unwrap() = 0.0;
                }
                Err(err) if err.code() == StoreErrorCode::Unavailable => {
                    log::debug!("AsyncQueue: operation failed with retryable error: {err}");
                    self.retryable.lock().unwrap().push_front(op);
                }
                Err(err) => {
                    self.record_failure(&err);
                    return;
                }
            }

            if self.retryable.lock().unwrap().is_empty() {
                return;
            }
            let delay_millis = {
                let mut base = self.retry_base_millis.lock().unwrap();
                let delay = backoff::jittered_delay_millis(*base);
                *base = backoff::next_base_millis(*base, &BackoffConfig::default());
                delay
            };
            if let Some(timer) = self.retry_timer.lock().unwrap().take() {
                timer.cancel();
            }
            let core = Arc::clone(&self);
            let handle = self.schedule(
                TimerId::RetryTransaction,
                Duration::from_millis(delay_millis),
                Box::new(move || core.retry_next_op()),
            );
            *self.retry_timer.lock().unwrap() = Some(handle);
        })
    }
}

struct DelayedState {
    timer_id: TimerId,
    target_time_millis: i64,
    sequence: u64,
    op: Mutex<Option<QueueOp>>,
    core: Weak<QueueCore>,
}

impl DelayedState {
    fn fire(&self) {
        let op = self.op.lock().unwrap().take();
        let core = match self.core.upgrade() {
            Some(core) => core,
            None => return,
        };
        core.remove_delayed(self);
        if let Some(op) = op {
            if core.poisoned.load(Ordering::SeqCst) {
                log::error!("AsyncQueue: dropping delayed operation on a failed queue");
                return;
            }
            core.submit(op);
        }
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
pub struct DelayedOperation {
    state: Arc<DelayedState>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.state.timer_id
    }

    /// Cancels the timer. Does nothing if the operation already fired.
    pub fn cancel(&self) {
        let op = self.state.op.lock().unwrap().take();
        if op.is_some() {
            if let Some(core) = self.state.core.upgrade() {
                core.remove_delayed(&self.state);
            }
        }
    }

    /// Submits the operation immediately instead of waiting for the delay.
    pub fn skip_delay(&self) {
        self.state.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{internal_error, unavailable};
    use std::sync::atomic::AtomicU32;

    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..50 {
            if check() {
                return;
            }
            runtime::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn operations_run_in_submission_order() {
        let queue = AsyncQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for value in 0..3 {
            let order = Arc::clone(&order);
            queue.enqueue_and_forget(move || {
                box_queue_future(async move {
                    order.lock().unwrap().push(value);
                    Ok(())
                })
            });
        }
        queue.drain().await;
        assert_eq!(order.lock().unwrap().as_slice(), &[0, 1, 2]);
    }

    #[tokio::test]
    async fn enqueue_resolves_with_operation_result() {
        let queue = AsyncQueue::new();
        let result = queue
            .enqueue(|| box_queue_future(async { Ok(41 + 1) }))
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn failed_operation_poisons_the_queue() {
        let queue = AsyncQueue::new();
        let result: StoreResult<()> = queue
            .enqueue(|| box_queue_future(async { Err(internal_error("boom")) }))
            .await;
        assert!(result.is_err());

        let queue_clone = queue.clone();
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            queue_clone.enqueue_and_forget(|| box_queue_future(async { Ok(()) }));
        }));
        assert!(panicked.is_err());
    }

    #[tokio::test]
    async fn delayed_operation_fires_after_delay() {
        let queue = AsyncQueue::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        queue.enqueue_after_delay(TimerId::OnlineStateTimeout, Duration::from_millis(10), move || {
            box_queue_future(async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
        });
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        wait_until(|| fired.load(Ordering::SeqCst)).await;
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
    }

    #[tokio::test]
    async fn cancelled_operation_never_runs() {
        let queue = AsyncQueue::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let handle = queue.enqueue_after_delay(
            TimerId::ListenStreamIdle,
            Duration::from_millis(20),
            move || {
                box_queue_future(async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                })
            },
        );
        handle.cancel();
        assert!(!queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        runtime::sleep(Duration::from_millis(60)).await;
        queue.drain().await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn run_delayed_operations_early_stops_at_timer_id() {
        let queue = AsyncQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        queue.enqueue_after_delay(
            TimerId::ListenStreamConnectionBackoff,
            Duration::from_secs(10),
            move || {
                box_queue_future(async move {
                    first.lock().unwrap().push("backoff");
                    Ok(())
                })
            },
        );
        let second = Arc::clone(&order);
        queue.enqueue_after_delay(TimerId::WriteStreamIdle, Duration::from_secs(20), move || {
            box_queue_future(async move {
                second.lock().unwrap().push("idle");
                Ok(())
            })
        });

        queue
            .run_delayed_operations_early(TimerId::ListenStreamConnectionBackoff)
            .await;
        assert_eq!(order.lock().unwrap().as_slice(), &["backoff"]);
        assert!(queue.contains_delayed_operation(TimerId::WriteStreamIdle));

        queue.run_delayed_operations_early(TimerId::All).await;
        assert_eq!(order.lock().unwrap().as_slice(), &["backoff", "idle"]);
    }

    #[tokio::test]
    async fn retryable_operation_retries_transient_failures() {
        let queue = AsyncQueue::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        queue.enqueue_retryable(move || {
            let counter = Arc::clone(&counter);
            box_queue_future(async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(unavailable("storage hiccup"))
                } else {
                    Ok(())
                }
            })
        });
        wait_until(|| attempts.load(Ordering::SeqCst) == 2).await;
        queue.drain().await;
        assert!(!queue.contains_delayed_operation(TimerId::RetryTransaction));
    }

    #[tokio::test]
    async fn retryable_operations_keep_submission_order() {
        let queue = AsyncQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let failed_once = Arc::new(AtomicBool::new(false));

        let first_order = Arc::clone(&order);
        let first_flag = Arc::clone(&failed_once);
        queue.enqueue_retryable(move || {
            let order = Arc::clone(&first_order);
            let flag = Arc::clone(&first_flag);
            box_queue_future(async move {
                if !flag.swap(true, Ordering::SeqCst) {
                    return Err(unavailable("not yet"));
                }
                order.lock().unwrap().push("first");
                Ok(())
            })
        });
        let second_order = Arc::clone(&order);
        queue.enqueue_retryable(move || {
            let order = Arc::clone(&second_order);
            box_queue_future(async move {
                order.lock().unwrap().push("second");
                Ok(())
            })
        });

        wait_until(|| order.lock().unwrap().len() == 2).await;
        assert_eq!(order.lock().unwrap().as_slice(), &["first", "second"]);
    }
}
