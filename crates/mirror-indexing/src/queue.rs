//! Bounded-concurrency work queue.
//!
//! Items are handed to an async handler with at most `concurrency` handlers
//! running at once; the rest wait in FIFO order. `size` counts waiting
//! items, `pending` counts running handlers, and `on_idle`/`wait_below`
//! let producers apply backpressure and callers await a full drain.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Notify;
use tracing::error;

type Handler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct State<T> {
    waiting: VecDeque<T>,
    running: usize,
}

struct Inner<T> {
    name: String,
    concurrency: usize,
    handler: Handler<T>,
    state: Mutex<State<T>>,
    changed: Notify,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Create a queue running `handler` on at most `concurrency` items at a time.
    pub fn new<F, Fut>(name: impl Into<String>, concurrency: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler<T> = Arc::new(move |item| handler(item).boxed());
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                concurrency: concurrency.max(1),
                handler,
                state: Mutex::new(State {
                    waiting: VecDeque::new(),
                    running: 0,
                }),
                changed: Notify::new(),
            }),
        }
    }

    /// Enqueue an item. Must be called from within a tokio runtime.
    pub fn push(&self, item: T) {
        let mut state = self.inner.lock();
        if state.running < self.inner.concurrency {
            state.running += 1;
            drop(state);
            self.spawn_worker(item);
        } else {
            state.waiting.push_back(item);
        }
    }

    fn spawn_worker(&self, first: T) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut next = Some(first);
            while let Some(item) = next {
                let run = AssertUnwindSafe((inner.handler)(item)).catch_unwind();
                if run.await.is_err() {
                    error!(queue = %inner.name, "Queue handler panicked");
                }

                let mut state = inner.lock();
                next = state.waiting.pop_front();
                if next.is_none() {
                    state.running -= 1;
                }
                drop(state);
                inner.changed.notify_waiters();
            }
        });
    }

    /// Number of items waiting for a free slot.
    pub fn size(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// Number of items currently being handled.
    pub fn pending(&self) -> usize {
        self.inner.lock().running
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    pub fn is_idle(&self) -> bool {
        let state = self.inner.lock();
        state.running == 0 && state.waiting.is_empty()
    }

    /// Drop every waiting item and return them. Running handlers are left
    /// to finish.
    pub fn clear(&self) -> Vec<T> {
        let cleared: Vec<T> = self.inner.lock().waiting.drain(..).collect();
        self.inner.changed.notify_waiters();
        cleared
    }

    /// Resolve once nothing is waiting or running.
    pub async fn on_idle(&self) {
        self.wait_until(|state| state.running == 0 && state.waiting.is_empty())
            .await
    }

    /// Resolve once fewer than `limit` items are waiting.
    pub async fn wait_below(&self, limit: usize) {
        self.wait_until(|state| state.waiting.len() < limit).await
    }

    async fn wait_until(&self, done: impl Fn(&State<T>) -> bool) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let reached = done(&self.inner.lock());
            if reached {
                return;
            }
            notified.await;
        }
    }
}
