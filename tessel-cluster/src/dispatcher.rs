use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tessel_error::{TesselResult, tessel_bail, tessel_err, tessel_panic};
use tessel_metrics::{Counter, TesselMetrics};

type Task = Box<dyn FnOnce() + Send>;

/// A fork-join dispatcher running submitted closures on a fixed set of named worker threads.
///
/// A panicking task does not take its worker down: the panic is captured and surfaced as an
/// error from the task's [`Completion`].
pub struct Dispatcher {
    name: String,
    submitter: Mutex<Option<flume::Sender<Task>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    tasks: Arc<Counter>,
    panics: Arc<Counter>,
}

impl Dispatcher {
    pub fn new(name: &str, num_threads: usize, metrics: &TesselMetrics) -> Self {
        let (submitter, rx) = flume::unbounded::<Task>();
        let threads = (0..num_threads.max(1))
            .map(|tid| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-dispatch-{tid}"))
                    .spawn(move || {
                        while let Ok(task) = rx.recv() {
                            task();
                        }
                    })
                    .unwrap_or_else(|e| tessel_panic!("{name} worker thread spawn: {e}"))
            })
            .collect();

        Self {
            name: name.to_string(),
            submitter: Mutex::new(Some(submitter)),
            threads: Mutex::new(threads),
            tasks: metrics.counter("dispatch.tasks"),
            panics: metrics.counter("dispatch.panics"),
        }
    }

    /// Queue `task` on a worker thread.
    pub fn submit<F, R>(&self, task: F) -> TesselResult<Completion<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = flume::bounded(1);
        let panics = self.panics.clone();
        let task: Task = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(task));
            if result.is_err() {
                panics.inc();
            }
            // The submitter may have stopped waiting.
            tx.send(result).ok();
        });

        let guard = self.submitter.lock();
        let Some(submitter) = guard.as_ref() else {
            tessel_bail!(Generic: "dispatcher {} is shut down", self.name);
        };
        submitter
            .send(task)
            .map_err(|e| tessel_err!(Generic: "dispatcher {} error spawning task: {e}", self.name))?;
        self.tasks.inc();
        Ok(Completion(rx))
    }

    /// Stop accepting tasks, let queued tasks drain and join every worker.
    pub fn shutdown(&self) -> TesselResult<()> {
        drop(self.submitter.lock().take());
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            thread
                .join()
                .map_err(|e| tessel_err!(Generic: "{} worker panicked: {}", self.name, panic_message(&*e)))?;
        }
        Ok(())
    }
}

/// The pending result of a task submitted to a [`Dispatcher`].
#[must_use = "a completion must be waited on to observe task failures"]
pub struct Completion<R>(flume::Receiver<std::thread::Result<R>>);

impl<R> Completion<R> {
    /// Block until the task finishes. A panic inside the task is returned as a `Generic` error.
    pub fn wait(self) -> TesselResult<R> {
        match self.0.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => Err(tessel_err!(Generic: "task panicked: {}", panic_message(&*panic))),
            Err(_) => Err(tessel_err!(Generic: "task dropped before completing")),
        }
    }

    pub fn is_finished(&self) -> bool {
        !self.0.is_empty() || self.0.is_disconnected()
    }
}

/// Wait for every completion, returning the first failure once all have finished.
pub fn wait_all<R>(completions: impl IntoIterator<Item = Completion<R>>) -> TesselResult<Vec<R>> {
    let mut results = Vec::new();
    let mut failure = None;
    for completion in completions {
        match completion.wait() {
            Ok(value) => results.push(value),
            Err(e) => {
                failure.get_or_insert(e);
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

/// Render a panic payload for logs and errors.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
