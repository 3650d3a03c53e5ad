//! Single-worker execution queue for everything that touches the connection.
//!
//! Units of work run one at a time, in submission order, on a dedicated thread.
//! The worker tags itself in a thread-local, so a unit that calls back into the
//! same queue runs inline instead of waiting on itself.

use std::any::Any;
use std::cell::Cell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Mutex};
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;
use tracing::error;

type Job = Box<dyn FnOnce() + Send + 'static>;
type Outcome<T> = Result<T, Box<dyn Any + Send + 'static>>;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_QUEUE: Cell<Option<u64>> = const { Cell::new(None) };
}

pub struct AccessSerializer {
    id: u64,
    label: String,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AccessSerializer {
    pub fn new(label: impl Into<String>) -> io::Result<Self> {
        let label = label.into();
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name(format!("{label}-worker"))
            .spawn(move || {
                CURRENT_QUEUE.with(|current| current.set(Some(id)));
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })?;

        Ok(Self {
            id,
            label,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// True when the calling thread is this queue's worker.
    pub fn is_current(&self) -> bool {
        CURRENT_QUEUE.with(|current| current.get() == Some(self.id))
    }

    /// Run `work` on the worker and block until it finishes.
    ///
    /// Meant for startup and maintenance paths that have no event loop; do not
    /// call it from async code, use [`AccessSerializer::run`] there.
    ///
    /// # Panics
    /// Re-raises a panic from `work` on the calling thread.
    pub fn run_sync<T, F>(&self, work: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_current() {
            return work();
        }
        let (tx, rx) = mpsc::sync_channel::<Outcome<T>>(1);
        self.dispatch(Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(work));
            let _ = tx.send(outcome);
        }));
        match rx.recv() {
            Ok(outcome) => unwrap_outcome(outcome),
            Err(_) => panic!("storage worker '{}' dropped a unit of work", self.label),
        }
    }

    /// Run `work` on the worker; the caller suspends until it finishes.
    pub async fn run<T, F>(&self, work: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_current() {
            return work();
        }
        let (tx, rx) = oneshot::channel::<Outcome<T>>();
        self.dispatch(Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(work));
            let _ = tx.send(outcome);
        }));
        match rx.await {
            Ok(outcome) => unwrap_outcome(outcome),
            Err(_) => panic!("storage worker '{}' dropped a unit of work", self.label),
        }
    }

    /// Fire-and-forget. Runs inline when already on the worker.
    pub fn submit<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_current() {
            work();
            return;
        }
        self.defer(work);
    }

    /// Enqueue `work` at the tail even when called from the worker, so it only
    /// starts after the current unit has fully returned.
    pub fn defer<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let label = self.label.clone();
        self.dispatch(Box::new(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
                error!(
                    target: "pantry",
                    event = "serializer_job_panicked",
                    queue = %label,
                    message = %panic_message(payload.as_ref())
                );
            }
        }));
    }

    fn dispatch(&self, job: Job) {
        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let sent = match guard.as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            panic!("storage worker '{}' is not running", self.label);
        }
    }
}

impl Drop for AccessSerializer {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            if !self.is_current() {
                let _ = worker.join();
            }
        }
    }
}

fn unwrap_outcome<T>(outcome: Outcome<T>) -> T {
    match outcome {
        Ok(value) => value,
        Err(payload) => panic::resume_unwind(payload),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
