use std::future::Future;
use std::time::Duration;

/// Spawns an async task that runs in the background on the current platform.
#[cfg(target_arch = "wasm32")]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Spawns an async task that runs in the background on the current platform.
///
/// Outside of a tokio context the task runs on a lazily started
/// current-thread runtime so that callers never need to manage one.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use once_cell::sync::Lazy;
    use tokio::runtime::{Builder, Handle, Runtime};

    static BACKGROUND_RUNTIME: Lazy<Runtime> = Lazy::new(|| {
        Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build background tokio runtime")
    });

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else {
        let _ = BACKGROUND_RUNTIME.spawn(future);
    }
}

/// Waits for the given duration without blocking the executor.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    sleep_impl(duration).await;
}

#[cfg(target_arch = "wasm32")]
async fn sleep_impl(duration: Duration) {
    gloo_timers::future::sleep(duration).await;
}

#[cfg(not(target_arch = "wasm32"))]
async fn sleep_impl(duration: Duration) {
    tokio::time::sleep(duration).await;
}
