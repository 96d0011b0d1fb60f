//! Bounded FIFO that drops the oldest item instead of blocking producers.
//!
//! Used between every producer/consumer pair of a streaming session. Under
//! sustained overload audio is lost rather than memory or latency growing
//! without bound.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

pub struct BackpressureQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T> BackpressureQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        // A panic while holding the lock leaves the deque itself intact
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an item, evicting the oldest one if the queue is full.
    ///
    /// Never blocks and never fails. Wakes a pending `get`.
    pub fn put(&self, item: T) {
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                items.pop_front();
                trace!("BackpressureQueue full ({}), dropped oldest item", self.capacity);
            }
            items.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Wait until an item is available and remove the oldest one.
    ///
    /// Cancel safe: dropping the future before it resolves loses no item.
    pub async fn get(&self) -> T {
        loop {
            if let Some(item) = self.try_get() {
                return item;
            }
            // notify_one stores a permit when nobody is waiting, so a put
            // racing with this check is not lost
            self.notify.notified().await;
        }
    }

    pub fn try_get(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
