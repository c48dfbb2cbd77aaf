use crate::fault::{self, Fault};
use crossbeam::channel::{self, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread;
use tracing::{event, Level};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of named worker threads fed from a shared queue.
///
/// Tasks that may block for arbitrary periods (admission waits, platform
/// accept calls) run here so the thread that submitted them stays free. A
/// panicking task is reported to the fault sink and the worker carries on.
///
/// `shutdown` closes the queue; workers finish whatever they hold and exit
/// on their own. They are deliberately not joined, so a task wedged in a
/// platform call cannot wedge the caller.
pub struct WorkerPool {
    // Taken on shutdown; workers exit once the queue disconnects and drains.
    queue: Mutex<Option<Sender<Task>>>,
}

impl WorkerPool {
    pub fn new(threads: usize, name: &str) -> Self {
        assert!(threads > 0, "worker pool needs at least one thread");

        let (queue, tasks) = channel::unbounded::<Task>();

        for index in 0..threads {
            let tasks: Receiver<Task> = tasks.clone();
            let thread_name = format!("{name}-{index}");

            thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    while let Ok(task) = tasks.recv() {
                        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                            fault::report(Fault::from_panic("worker task", payload.as_ref()));
                        }
                    }

                    event!(Level::TRACE, message = "worker exiting", name = thread_name);
                })
                .expect("spawning a worker thread should never fail unless the OS is critically out of resources");
        }

        Self {
            queue: Mutex::new(Some(queue)),
        }
    }

    /// Queues a task. Silently drops it when the pool has shut down; by then
    /// every submitter is itself winding down.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let queue = self
            .queue
            .lock()
            .expect("worker pool queue lock poisoned")
            .clone();

        match queue {
            Some(queue) => {
                if queue.send(Box::new(task)).is_err() {
                    event!(Level::TRACE, "task dropped, worker pool already shut down");
                }
            }
            None => {
                event!(Level::TRACE, "task dropped, worker pool already shut down");
            }
        }
    }

    /// Closes the queue. Idempotent. Workers drain outstanding tasks and
    /// terminate without being joined.
    pub fn shutdown(&self) {
        self.queue
            .lock()
            .expect("worker pool queue lock poisoned")
            .take();
    }
}
