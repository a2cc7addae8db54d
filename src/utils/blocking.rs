//! Timed waits on tokio primitives from plain worker threads
//!
//! The sensor, sequencer and compressor run on dedicated OS threads. They
//! share tokio channels, semaphores and watches, and wait on them through
//! [`block_on_timeout`]. The future is polled on the calling thread; only
//! its deadline lives on a small shared timer runtime. Async code should
//! reach the blocking camera calls through `spawn_blocking`.

use futures::FutureExt;
use std::future::Future;
use std::pin::pin;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::error;

static TIMER_RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();

fn timer() -> Option<&'static Handle> {
    TIMER_RUNTIME
        .get_or_init(|| {
            Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("camera-timer")
                .enable_time()
                .build()
                .map_err(|e| error!("Failed to build timer runtime: {}", e))
                .ok()
        })
        .as_ref()
        .map(Runtime::handle)
}

/// Drive `fut` on the calling thread for at most `timeout`.
///
/// Returns `None` on timeout. A future that is already ready completes
/// without a timer, so a zero timeout acts as a poll.
pub fn block_on_timeout<F: Future>(timeout: Duration, fut: F) -> Option<F::Output> {
    let mut fut = pin!(fut);
    if let Some(output) = fut.as_mut().now_or_never() {
        return Some(output);
    }
    if timeout.is_zero() {
        return None;
    }
    let bounded = {
        let _timer = timer()?.enter();
        tokio::time::timeout(timeout, fut)
    };
    futures::executor::block_on(bounded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tokio::sync::Notify;

    #[test]
    fn test_ready_future_needs_no_time() {
        assert_eq!(block_on_timeout(Duration::ZERO, async { 7 }), Some(7));
    }

    #[test]
    fn test_timeout_is_none() {
        let notify = Notify::new();
        assert!(block_on_timeout(Duration::from_millis(10), notify.notified()).is_none());
        assert!(block_on_timeout(Duration::ZERO, notify.notified()).is_none());
    }

    #[test]
    fn test_woken_from_another_thread() {
        let notify = Arc::new(Notify::new());
        let waker = {
            let notify = notify.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                notify.notify_one();
            })
        };
        assert!(block_on_timeout(Duration::from_secs(5), notify.notified()).is_some());
        waker.join().unwrap();
    }
}
