use crate::error::{ProtocolError, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::{self, ThreadId};
use tokio::sync::mpsc;
use tracing::{error, trace, warn};

/// A unit of work marshaled onto the owning context.
pub type Work = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Continuation run after [`Work`] with its outcome (including a caught panic).
pub type Completion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Marshals work onto the designated owning execution context.
///
/// Work already on the owning context runs inline; everything else is queued
/// and runs in FIFO order.
pub trait Dispatcher: Send + Sync {
    fn dispatch_if_needed(&self, work: Work);

    /// Like [`Dispatcher::dispatch_if_needed`], then runs `after` with the work's outcome.
    fn dispatch_if_needed_then(&self, work: Work, after: Completion);
}

/// Run `work`, turning a panic into [`ProtocolError::HandlerPanicked`].
pub fn run_guarded(work: Work) -> Result<()> {
    panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|p| Err(ProtocolError::from_panic(p)))
}

fn execute(job: Job) {
    let outcome = run_guarded(job.work);
    match job.after {
        Some(after) => {
            if let Err(p) = panic::catch_unwind(AssertUnwindSafe(|| after(outcome))) {
                error!(error = %ProtocolError::from_panic(p), "Dispatch completion panicked");
            }
        }
        None => {
            if let Err(e) = outcome {
                error!(error = %e, "Dispatched work failed");
            }
        }
    }
}

struct Job {
    work: Work,
    after: Option<Completion>,
}

/// Every call site is treated as the owning context.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch_if_needed(&self, work: Work) {
        execute(Job { work, after: None });
    }

    fn dispatch_if_needed_then(&self, work: Work, after: Completion) {
        execute(Job {
            work,
            after: Some(after),
        });
    }
}

/// Dispatcher bound to one owning thread (e.g. the game loop).
///
/// Other threads enqueue; the owning thread calls [`QueueDispatcher::run_pending`]
/// once per tick to drain the queue.
pub struct QueueDispatcher {
    owner: ThreadId,
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<mpsc::UnboundedReceiver<Job>>,
    queued: AtomicUsize,
}

impl QueueDispatcher {
    /// Dispatcher owned by the calling thread
    pub fn new() -> Self {
        Self::for_thread(thread::current().id())
    }

    /// Dispatcher owned by `owner`
    pub fn for_thread(owner: ThreadId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            owner,
            tx,
            rx: Mutex::new(rx),
            queued: AtomicUsize::new(0),
        }
    }

    pub fn is_owning_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Jobs waiting for the owning thread
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Run every queued job in FIFO order. Returns how many ran.
    ///
    /// Does nothing off the owning thread or when called re-entrantly from a job.
    pub fn run_pending(&self) -> usize {
        if !self.is_owning_thread() {
            warn!("run_pending called off the owning thread");
            return 0;
        }
        let Ok(mut rx) = self.rx.try_lock() else {
            return 0;
        };

        let mut ran = 0;
        while let Ok(job) = rx.try_recv() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            execute(job);
            ran += 1;
        }
        if ran > 0 {
            trace!(ran, "Drained dispatch queue");
        }
        ran
    }

    fn enqueue(&self, job: Job) {
        if self.is_owning_thread() {
            execute(job);
            return;
        }
        self.queued.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(job).is_err() {
            // receiver lives as long as self, so this only happens mid-teardown
            self.queued.fetch_sub(1, Ordering::AcqRel);
            error!("Dispatch queue closed; dropping work");
        }
    }
}

impl Default for QueueDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for QueueDispatcher {
    fn dispatch_if_needed(&self, work: Work) {
        self.enqueue(Job { work, after: None });
    }

    fn dispatch_if_needed_then(&self, work: Work, after: Completion) {
        self.enqueue(Job {
            work,
            after: Some(after),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn inline_runs_immediately_and_reports_outcome() {
        let seen = Arc::new(StdMutex::new(None));
        let sink = Arc::clone(&seen);
        InlineDispatcher.dispatch_if_needed_then(
            Box::new(|| -> Result<()> { Err(ProtocolError::Custom("nope".into())) }),
            Box::new(move |r: Result<()>| *sink.lock().unwrap() = Some(r.is_err())),
        );
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    #[test]
    fn panics_become_errors() {
        let outcome = run_guarded(Box::new(|| -> Result<()> { panic!("subscriber bug") }));
        assert!(matches!(outcome, Err(ProtocolError::HandlerPanicked(ref m)) if m == "subscriber bug"));
    }

    #[test]
    fn owning_thread_runs_inline() {
        let dispatcher = QueueDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        dispatcher.dispatch_if_needed(Box::new(move || -> Result<()> {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn foreign_threads_queue_in_fifo_order() {
        let dispatcher = Arc::new(QueueDispatcher::new());
        let order = Arc::new(StdMutex::new(Vec::new()));

        let d = Arc::clone(&dispatcher);
        let o = Arc::clone(&order);
        thread::spawn(move || {
            for i in 0..5 {
                let o = Arc::clone(&o);
                d.dispatch_if_needed(Box::new(move || -> Result<()> {
                    o.lock().unwrap().push(i);
                    Ok(())
                }));
            }
        })
        .join()
        .unwrap();

        assert!(order.lock().unwrap().is_empty());
        assert_eq!(dispatcher.pending(), 5);
        assert_eq!(dispatcher.run_pending(), 5);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn completion_runs_on_owner_after_work() {
        let dispatcher = Arc::new(QueueDispatcher::new());
        let log = Arc::new(StdMutex::new(Vec::new()));

        let d = Arc::clone(&dispatcher);
        let (l1, l2) = (Arc::clone(&log), Arc::clone(&log));
        thread::spawn(move || {
            d.dispatch_if_needed_then(
                Box::new(move || -> Result<()> {
                    l1.lock().unwrap().push("work");
                    panic!("boom")
                }),
                Box::new(move |r: Result<()>| {
                    l2.lock().unwrap().push(if r.is_err() { "after:err" } else { "after:ok" })
                }),
            );
        })
        .join()
        .unwrap();

        dispatcher.run_pending();
        assert_eq!(*log.lock().unwrap(), vec!["work", "after:err"]);
    }

    #[test]
    fn run_pending_off_owner_is_refused() {
        let dispatcher = Arc::new(QueueDispatcher::new());
        let d = Arc::clone(&dispatcher);
        let ran = thread::spawn(move || d.run_pending()).join().unwrap();
        assert_eq!(ran, 0);
    }
}
