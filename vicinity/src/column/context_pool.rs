//! Pool of reusable engine search contexts.
//!
//! Each concurrent query borrows one context; when all are in use the
//! caller blocks until a context returns, capping per-column concurrency.

use std::collections::VecDeque;

use instant_distance::Search;
use parking_lot::{Condvar, Mutex};

pub struct ContextPool {
    contexts: Mutex<VecDeque<Search>>,
    not_empty: Condvar,
}

impl ContextPool {
    pub fn new(concurrency: usize) -> Self {
        let mut contexts = VecDeque::with_capacity(concurrency.max(1));
        for _ in 0..concurrency.max(1) {
            contexts.push_back(Search::default());
        }
        Self {
            contexts: Mutex::new(contexts),
            not_empty: Condvar::new(),
        }
    }

    /// Borrows a context, blocking while the pool is empty. The guard
    /// returns it on drop.
    pub fn acquire(&self) -> PooledContext<'_> {
        let mut contexts = self.contexts.lock();
        while contexts.is_empty() {
            self.not_empty.wait(&mut contexts);
        }
        let context = contexts.pop_front().unwrap();
        PooledContext {
            pool: self,
            context: Some(context),
        }
    }

    fn release(&self, context: Search) {
        self.contexts.lock().push_back(context);
        self.not_empty.notify_one();
    }
}

/// RAII guard over a borrowed search context.
pub struct PooledContext<'a> {
    pool: &'a ContextPool,
    context: Option<Search>,
}

impl PooledContext<'_> {
    pub fn search(&mut self) -> &mut Search {
        self.context.as_mut().unwrap()
    }
}

impl Drop for PooledContext<'_> {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.pool.release(context);
        }
    }
}
