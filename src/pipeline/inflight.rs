//! In-flight request queue
//!
//! Holds requests whose buffers have been handed to the sensor, oldest
//! first. The request being read out still counts against the capacity
//! until its result is out, so admission blocks until a frame has been
//! fully drained rather than just popped.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::metadata::Metadata;
use crate::sensor::StreamBuffer;
use crate::utils::{block_on_timeout, BoundedQueue};

/// A request waiting for its frame
pub struct InFlightRequest {
    pub frame_number: u32,
    /// Settings after 3A, echoed into the result
    pub settings: Metadata,
    /// Reprocess source, returned untouched with the result
    pub input_buffer: Option<StreamBuffer>,
    pub jpeg_quality: u8,
}

impl fmt::Debug for InFlightRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightRequest")
            .field("frame_number", &self.frame_number)
            .field("settings", &self.settings.len())
            .field("jpeg_quality", &self.jpeg_quality)
            .finish()
    }
}

/// A queued request and the capacity slot it occupies
struct Slot {
    request: InFlightRequest,
    permit: OwnedSemaphorePermit,
}

/// In-flight queue. Each request holds a semaphore permit from admission
/// until [`InFlightQueue::finish`], so the request being read out still
/// takes a slot.
pub struct InFlightQueue {
    slots: Arc<Semaphore>,
    queue: BoundedQueue<Slot>,
    /// Frame being read out and its slot
    active: Mutex<Option<(u32, OwnedSemaphorePermit)>>,
    released: Notify,
    capacity: usize,
}

impl InFlightQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            queue: BoundedQueue::new(capacity),
            active: Mutex::new(None),
            released: Notify::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued requests plus the one being read out
    pub fn len(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nothing queued and nothing mid-readout
    pub fn is_idle(&self) -> bool {
        self.is_empty()
    }

    fn acquire(&self, timeout: Duration) -> Option<OwnedSemaphorePermit> {
        block_on_timeout(timeout, async {
            tokio::select! {
                biased;
                _ = self.queue.closed() => None,
                permit = self.slots.clone().acquire_owned() => permit.ok(),
            }
        })
        .flatten()
    }

    /// Wait until a request can be queued. Returns `false` on timeout or close.
    pub fn wait_for_room(&self, timeout: Duration) -> bool {
        self.acquire(timeout).is_some()
    }

    /// Append a request, waiting up to `timeout` for room. Hands the request
    /// back on timeout or close.
    pub fn push(&self, request: InFlightRequest, timeout: Duration) -> Result<(), InFlightRequest> {
        let Some(permit) = self.acquire(timeout) else {
            return Err(request);
        };
        // The permit guarantees a free slot in the queue
        self.queue.try_push(Slot { request, permit }).map_err(|slot| slot.request)
    }

    /// Take the oldest request for readout, waiting up to `timeout`.
    ///
    /// The request stays counted until [`InFlightQueue::finish`]. Only one
    /// request may be mid-readout at a time.
    pub fn begin_readout(&self, timeout: Duration) -> Option<InFlightRequest> {
        if self.active.lock().is_some() {
            return None;
        }
        let Slot { request, permit } = self.queue.pop_timeout(timeout)?;
        *self.active.lock() = Some((request.frame_number, permit));
        Some(request)
    }

    /// The request being read out has been delivered or failed
    pub fn finish(&self) {
        let released = self.active.lock().take();
        drop(released);
        self.released.notify_waiters();
    }

    /// Frame number of the request being read out
    pub fn active(&self) -> Option<u32> {
        self.active.lock().as_ref().map(|(frame_number, _)| *frame_number)
    }

    /// Wait until the queue is idle. Returns `false` on timeout.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        block_on_timeout(timeout, async {
            loop {
                let released = self.released.notified();
                if self.is_idle() {
                    return;
                }
                released.await;
            }
        })
        .is_some()
    }

    /// Reject further requests and wake every waiter
    pub fn close(&self) {
        self.queue.close();
    }

    pub fn reopen(&self) {
        self.queue.reopen();
    }

    /// Remove every queued request; the one mid-readout is left alone
    pub fn drain(&self) -> Vec<InFlightRequest> {
        let drained: Vec<_> = self.queue.drain().into_iter().map(|slot| slot.request).collect();
        self.released.notify_waiters();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn request(frame_number: u32) -> InFlightRequest {
        InFlightRequest {
            frame_number,
            settings: Metadata::new(),
            input_buffer: None,
            jpeg_quality: 80,
        }
    }

    #[test]
    fn test_readout_counts_until_finished() {
        let queue = InFlightQueue::new(2);
        queue.push(request(1), Duration::ZERO).unwrap();
        queue.push(request(2), Duration::ZERO).unwrap();
        assert!(!queue.wait_for_room(Duration::from_millis(10)));

        let first = queue.begin_readout(Duration::ZERO).unwrap();
        assert_eq!(first.frame_number, 1);
        assert_eq!(queue.active(), Some(1));
        // Popped but not delivered: still full
        assert!(queue.push(request(3), Duration::from_millis(10)).is_err());
        // A second readout may not start while one is active
        assert!(queue.begin_readout(Duration::from_millis(10)).is_none());

        queue.finish();
        assert!(queue.wait_for_room(Duration::ZERO));
        assert!(!queue.is_idle());
    }

    #[test]
    fn test_third_request_blocks_until_drained() {
        let queue = Arc::new(InFlightQueue::new(2));
        queue.push(request(1), Duration::ZERO).unwrap();
        queue.push(request(2), Duration::ZERO).unwrap();

        let drained = Arc::new(AtomicUsize::new(0));
        let consumer = {
            let queue = queue.clone();
            let drained = drained.clone();
            thread::spawn(move || {
                let first = queue.begin_readout(Duration::from_secs(1)).unwrap();
                thread::sleep(Duration::from_millis(50));
                drained.fetch_add(1, Ordering::SeqCst);
                queue.finish();
                first.frame_number
            })
        };

        queue.push(request(3), Duration::from_secs(2)).unwrap();
        assert_eq!(drained.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.join().unwrap(), 1);
        assert!(queue.len() <= queue.capacity());
    }

    #[test]
    fn test_len_never_exceeds_capacity() {
        for capacity in 2..=4 {
            let queue = Arc::new(InFlightQueue::new(capacity));
            let producers: Vec<_> = (0..3)
                .map(|p| {
                    let queue = queue.clone();
                    thread::spawn(move || {
                        for i in 0..20 {
                            assert!(queue.push(request(p * 100 + i), Duration::from_secs(5)).is_ok());
                            assert!(queue.len() <= capacity);
                        }
                    })
                })
                .collect();

            let consumer = {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut delivered = 0;
                    while delivered < 60 {
                        match queue.begin_readout(Duration::from_millis(500)) {
                            Some(_) => {
                                assert!(queue.len() <= capacity);
                                queue.finish();
                                delivered += 1;
                            }
                            None => break,
                        }
                    }
                    delivered
                })
            };

            for producer in producers {
                producer.join().unwrap();
            }
            assert_eq!(consumer.join().unwrap(), 60);
            assert!(queue.wait_until_idle(Duration::from_secs(1)));
        }
    }

    #[test]
    fn test_close_wakes_waiters() {
        let queue = Arc::new(InFlightQueue::new(2));
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.begin_readout(Duration::from_secs(5)).is_none())
        };
        queue.close();
        assert!(waiter.join().unwrap());
        assert!(queue.push(request(1), Duration::ZERO).is_err());

        queue.reopen();
        assert!(queue.push(request(1), Duration::ZERO).is_ok());
        assert_eq!(queue.drain().len(), 1);
    }
}
