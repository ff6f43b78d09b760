//! Execution domains.
//!
//! A socket runs on two domains: the transport domain that owns the socket
//! and delivers callbacks, and the engine domain that calls into the TLS
//! engine and may block. Both are expressed as [`TaskRunner`]s; they may be
//! the same runner.

use std::collections::VecDeque;
use std::io;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};

/// A unit of work posted to a runner.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A FIFO task queue bound to one thread.
pub trait TaskRunner: Send + Sync {
    /// Queues `task`. Returns `false` if the runner no longer accepts work.
    fn post_task(&self, task: Task) -> bool;

    /// Whether the calling thread is the one that runs this runner's tasks.
    fn runs_tasks_on_current_thread(&self) -> bool;
}

pub(crate) fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// ThreadRunner
// ---------------------------------------------------------------------------

/// Runs tasks on a dedicated OS thread.
pub struct ThreadRunner {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadRunner {
    pub fn spawn(name: &str) -> io::Result<Arc<Self>> {
        let (tx, rx) = mpsc::channel::<Task>();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
            })?;
        Ok(Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            thread_id: join.thread().id(),
            join: Mutex::new(Some(join)),
        }))
    }

    /// Stops accepting tasks and waits for queued ones to finish.
    ///
    /// Called from the runner's own thread it only stops accepting tasks.
    pub fn shutdown(&self) {
        lock(&self.sender).take();
        if self.runs_tasks_on_current_thread() {
            return;
        }
        if let Some(join) = lock(&self.join).take() {
            if join.join().is_err() {
                log::warn!("runner thread panicked");
            }
        }
    }
}

impl TaskRunner for ThreadRunner {
    fn post_task(&self, task: Task) -> bool {
        match lock(&self.sender).as_ref() {
            Some(tx) => tx.send(task).is_ok(),
            None => false,
        }
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

// ---------------------------------------------------------------------------
// ManualRunner
// ---------------------------------------------------------------------------

/// A task queue drained explicitly by the thread that created it.
///
/// Suitable for embedding into an existing event loop and for deterministic
/// tests.
pub struct ManualRunner {
    queue: Mutex<VecDeque<Task>>,
    owner: ThreadId,
}

impl ManualRunner {
    /// Creates a runner owned by the calling thread.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            owner: thread::current().id(),
        })
    }

    /// Runs queued tasks, including ones they post, until the queue is empty.
    /// Returns how many tasks ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = lock(&self.queue).pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    pub fn pending_tasks(&self) -> usize {
        lock(&self.queue).len()
    }
}

impl TaskRunner for ManualRunner {
    fn post_task(&self, task: Task) -> bool {
        lock(&self.queue).push_back(task);
        true
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        thread::current().id() == self.owner
    }
}

// ---------------------------------------------------------------------------
// TokioRunner
// ---------------------------------------------------------------------------

/// Runs tasks on a dedicated thread that drives a current-thread tokio
/// runtime, so transport futures spawned through [`TokioRunner::handle`]
/// share the thread with posted tasks.
#[cfg(feature = "tokio")]
pub struct TokioRunner {
    sender: tokio::sync::mpsc::UnboundedSender<Task>,
    handle: tokio::runtime::Handle,
    thread_id: ThreadId,
}

#[cfg(feature = "tokio")]
impl TokioRunner {
    pub fn spawn(name: &str) -> io::Result<Arc<Self>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Task>();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(task) = rx.recv().await {
                        task();
                    }
                });
            })?;
        Ok(Arc::new(Self {
            sender: tx,
            handle,
            thread_id: join.thread().id(),
        }))
    }

    pub fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }
}

#[cfg(feature = "tokio")]
impl TaskRunner for TokioRunner {
    fn post_task(&self, task: Task) -> bool {
        self.sender.send(task).is_ok()
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}
