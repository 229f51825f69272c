//! Single-queue task scheduler: each queue owns one worker that runs
//! submitted closures serially in enqueue order. The collection uses one
//! queue for background dumps and the rest for per-segment query fan-out.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Submissions past this depth busy-wait until the worker drains.
const MAX_QUEUE_LENGTH: usize = 4096;

struct QueueState {
    jobs: VecDeque<Job>,
    stopped: bool,
}

struct TaskQueue {
    state: Mutex<QueueState>,
    signal: Condvar,
}

impl TaskQueue {
    fn new() -> Arc<TaskQueue> {
        Arc::new(TaskQueue {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                stopped: false,
            }),
            signal: Condvar::new(),
        })
    }

    fn push(&self, job: Job) {
        loop {
            {
                let mut state = self.state.lock();
                if state.stopped {
                    return;
                }
                if state.jobs.len() < MAX_QUEUE_LENGTH {
                    state.jobs.push_back(job);
                    self.signal.notify_one();
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn run_worker(&self) {
        loop {
            let job = {
                let mut state = self.state.lock();
                loop {
                    if let Some(job) = state.jobs.pop_front() {
                        break job;
                    }
                    if state.stopped {
                        return;
                    }
                    self.signal.wait(&mut state);
                }
            };
            job();
        }
    }

    fn stop(&self) {
        self.state.lock().stopped = true;
        self.signal.notify_all();
    }
}

/// A fixed set of serial queues, one worker thread each.
pub struct TaskScheduler {
    queues: Vec<Arc<TaskQueue>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(queue_count: usize) -> TaskScheduler {
        let queue_count = queue_count.max(1);
        let mut queues = Vec::with_capacity(queue_count);
        let mut workers = Vec::with_capacity(queue_count);
        for i in 0..queue_count {
            let queue = TaskQueue::new();
            let worker_queue = queue.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("vicinity-queue-{i}"))
                    .spawn(move || worker_queue.run_worker())
                    .expect("spawn scheduler worker"),
            );
            queues.push(queue);
        }
        TaskScheduler {
            queues,
            workers: Mutex::new(workers),
        }
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Enqueues `job` on the queue owning `slot` (wrapped into range).
    pub fn submit(&self, slot: usize, job: impl FnOnce() + Send + 'static) {
        self.queues[slot % self.queues.len()].push(Box::new(job));
    }

    /// Stops accepting work and joins the workers; queued jobs still run.
    pub fn shutdown(&self) {
        for queue in &self.queues {
            let mut state = queue.state.lock();
            while !state.jobs.is_empty() {
                let _ = queue.signal.wait_for(&mut state, Duration::from_millis(10));
            }
        }
        for queue in &self.queues {
            queue.stop();
        }
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        for queue in &self.queues {
            queue.stop();
        }
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
    }
}
