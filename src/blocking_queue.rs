//! Unbounded FIFO with a "wait for at least N items" dequeue.
//!
//! A satisfied `dequeue` drains the *whole* queue, not just `min` items, so a
//! consumer always picks up everything that piled up while it was busy.
//! Waiters are woken first-registered-first; once one waiter drains the
//! queue the remaining ones keep waiting for the next `enqueue`.
//!
//! `clear` starts a new generation and releases every parked waiter with
//! nothing, so items enqueued afterwards are never handed to a consumer
//! that was waiting on the old contents.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

struct Waiter<T> {
    id: u64,
    min: usize,
    tx: oneshot::Sender<Vec<T>>,
}

struct Inner<T> {
    items: VecDeque<T>,
    waiters: Vec<Waiter<T>>,
    next_id: u64,
    generation: u64,
}

impl<T> Inner<T> {
    fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    fn restore(&mut self, items: Vec<T>) {
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
    }

    fn wake(&mut self) {
        let mut i = 0;
        while i < self.waiters.len() {
            // The dequeue future was dropped while waiting.
            if self.waiters[i].tx.is_closed() {
                self.waiters.remove(i);
                continue;
            }
            if self.items.len() >= self.waiters[i].min {
                let waiter = self.waiters.remove(i);
                let items = self.drain();
                if let Err(items) = waiter.tx.send(items) {
                    self.restore(items);
                }
                continue;
            }
            i += 1;
        }
    }
}

pub struct BlockingQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                waiters: Vec::new(),
                next_id: 0,
                generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append items in order and wake every waiter whose threshold is now met.
    pub fn enqueue<I: IntoIterator<Item = T>>(&self, items: I) {
        let mut inner = self.lock();
        let before = inner.items.len();
        inner.items.extend(items);
        if inner.items.len() > before {
            inner.wake();
        }
    }

    pub fn push(&self, item: T) {
        self.enqueue(std::iter::once(item));
    }

    /// Wait until at least `min` items are queued, then drain everything.
    ///
    /// With `timeout`, gives up after the deadline and returns whatever is
    /// queued at that point (possibly nothing).
    pub async fn dequeue(&self, min: usize, timeout: Option<Duration>) -> Vec<T> {
        self.dequeue_with(min, timeout, |_| {}).await
    }

    /// Like [`dequeue`](Self::dequeue), calling `on_timeout` with the number
    /// of items observed when the deadline fires.
    pub async fn dequeue_with<F>(&self, min: usize, timeout: Option<Duration>, on_timeout: F) -> Vec<T>
    where
        F: FnOnce(usize),
    {
        self.wait(None, min, timeout, on_timeout).await
    }

    /// Like [`dequeue`](Self::dequeue), but only hands out items belonging to
    /// `generation`. Returns nothing once the queue has been cleared since.
    pub async fn dequeue_in(&self, generation: u64, min: usize, timeout: Option<Duration>) -> Vec<T> {
        self.wait(Some(generation), min, timeout, |_| {}).await
    }

    async fn wait<F>(&self, generation: Option<u64>, min: usize, timeout: Option<Duration>, on_timeout: F) -> Vec<T>
    where
        F: FnOnce(usize),
    {
        let min = min.max(1);
        let (id, mut rx) = {
            let mut inner = self.lock();
            if generation.is_some_and(|g| g != inner.generation) {
                return Vec::new();
            }
            if inner.items.len() >= min {
                return inner.drain();
            }
            let (tx, rx) = oneshot::channel();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.waiters.push(Waiter { id, min, tx });
            (id, rx)
        };

        let Some(limit) = timeout else {
            return rx.await.unwrap_or_default();
        };

        match tokio::time::timeout(limit, &mut rx).await {
            Ok(items) => items.unwrap_or_default(),
            Err(_) => {
                let expired = {
                    let mut inner = self.lock();
                    match inner.waiters.iter().position(|w| w.id == id) {
                        Some(pos) => {
                            inner.waiters.remove(pos);
                            let count = inner.items.len();
                            Ok((count, inner.drain()))
                        }
                        // Woken or released between the deadline and taking the lock.
                        None => Err(rx.try_recv().unwrap_or_default()),
                    }
                };
                match expired {
                    Ok((count, items)) => {
                        on_timeout(count);
                        items
                    }
                    Err(items) => items,
                }
            }
        }
    }

    /// Take whatever is queued right now without waiting.
    pub fn try_drain(&self) -> Vec<T> {
        self.lock().drain()
    }

    /// [`try_drain`](Self::try_drain) restricted to `generation`.
    pub fn try_drain_in(&self, generation: u64) -> Vec<T> {
        let mut inner = self.lock();
        if inner.generation != generation {
            return Vec::new();
        }
        inner.drain()
    }

    /// Drop everything queued and release parked waiters empty-handed.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.items.clear();
        inner.waiters.clear();
        inner.generation += 1;
    }

    /// Bumped by every [`clear`](Self::clear).
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}
