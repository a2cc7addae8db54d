//! Bounded FIFO handoff between worker threads
//!
//! A tokio `mpsc` channel carries the items and a `watch` flag carries
//! close. Producers and consumers are plain threads and wait through
//! [`block_on_timeout`]; every wait is bounded and a timeout is an outcome,
//! never an error. Used for the capacity-1 sensor handoff, the staged
//! request queue, and underneath the in-flight queue.

use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

use super::blocking::block_on_timeout;

/// Bounded queue with timed push and pop
pub struct BoundedQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    closed: watch::Sender<bool>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (closed, _) = watch::channel(false);
        Self {
            tx,
            rx: Mutex::new(rx),
            closed,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items queued, counting slots reserved by a producer mid-push
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the queue is closed
    pub async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Wait for a free slot and keep it reserved
    async fn reserve(&self) -> Option<mpsc::Permit<'_, T>> {
        tokio::select! {
            biased;
            _ = self.closed() => None,
            permit = self.tx.reserve() => permit.ok(),
        }
    }

    /// Push without waiting. Hands the item back if full or closed.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        if self.is_closed() {
            return Err(item);
        }
        self.tx.try_send(item).map_err(|e| e.into_inner())
    }

    /// Push, waiting up to `timeout` for room. Hands the item back on
    /// timeout or close.
    pub fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
        match block_on_timeout(timeout, self.reserve()).flatten() {
            Some(permit) => {
                permit.send(item);
                Ok(())
            }
            None => Err(item),
        }
    }

    /// Wait until a push would not block. Returns `false` on timeout or close.
    pub fn wait_for_room(&self, timeout: Duration) -> bool {
        block_on_timeout(timeout, self.reserve()).flatten().is_some()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Pop, waiting up to `timeout`. A closed queue still yields what it
    /// holds, then returns `None` at once.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        block_on_timeout(timeout, async {
            let mut rx = self.rx.lock().await;
            tokio::select! {
                biased;
                item = rx.recv() => item,
                _ = self.closed() => rx.try_recv().ok(),
            }
        })
        .flatten()
    }

    /// Take everything queued without waiting
    pub fn drain(&self) -> Vec<T> {
        match self.rx.try_lock() {
            Ok(mut rx) => std::iter::from_fn(|| rx.try_recv().ok()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Refuse new items and wake every waiter
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn reopen(&self) {
        self.closed.send_replace(false);
    }
}
