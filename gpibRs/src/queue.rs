//! Single-worker command queue with one-shot completions.
//!
//! Commands are processed strictly one after the other by a single worker thread. Every
//! submission gets its own completion slot, such that a caller that gave up waiting can never
//! receive the result of another command.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{Command, Deadline, GpibError, Response, processor::CommandProcessor};

/// Something that processes one command before its deadline.
pub(crate) trait Process: Send + 'static {
    fn process(&mut self, command: &Command, deadline: Deadline) -> Result<Response, GpibError>;
}

impl Process for CommandProcessor {
    fn process(&mut self, command: &Command, deadline: Deadline) -> Result<Response, GpibError> {
        CommandProcessor::process(self, command, deadline)
    }
}

impl<F> Process for F
where
    F: FnMut(&Command, Deadline) -> Result<Response, GpibError> + Send + 'static,
{
    fn process(&mut self, command: &Command, deadline: Deadline) -> Result<Response, GpibError> {
        self(command, deadline)
    }
}

#[derive(Debug)]
enum Slot {
    Pending,
    Ready(Result<Response, GpibError>),
    Taken,
}

/// One-shot rendezvous between the worker and the submitter of a command.
#[derive(Debug)]
struct Completion {
    slot: Mutex<Slot>,
    done: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending),
            done: Condvar::new(),
        }
    }

    fn is_pending(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Pending)
    }

    /// Store the result. Returns `false` if the slot was already resolved, e.g., by a timeout.
    fn complete(&self, result: Result<Response, GpibError>) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Pending) {
            return false;
        }
        *slot = Slot::Ready(result);
        drop(slot);
        self.done.notify_all();
        true
    }

    fn take(slot: &mut Slot) -> Option<Result<Response, GpibError>> {
        match std::mem::replace(slot, Slot::Taken) {
            Slot::Ready(result) => Some(result),
            Slot::Pending => {
                *slot = Slot::Pending;
                None
            }
            Slot::Taken => Some(Err(GpibError::InvalidArgument(
                "The result of this command was already taken.".to_string(),
            ))),
        }
    }

    fn try_take(&self) -> Option<Result<Response, GpibError>> {
        Self::take(&mut self.slot.lock())
    }

    /// Wait for the result until the deadline. On timeout the slot resolves to a timeout error,
    /// and a result that arrives later is discarded.
    fn wait(&self, deadline: Deadline) -> Result<Response, GpibError> {
        let mut slot = self.slot.lock();
        while matches!(*slot, Slot::Pending) {
            if self.done.wait_until(&mut slot, deadline.instant()).timed_out()
                && matches!(*slot, Slot::Pending)
            {
                *slot = Slot::Ready(Err(deadline.timeout_error()));
            }
        }
        Self::take(&mut slot).unwrap_or_else(|| Err(deadline.timeout_error()))
    }
}

/// A submitted command whose result may not be available yet.
#[derive(Debug)]
pub struct PendingCommand {
    command: Arc<Command>,
    deadline: Deadline,
    completion: Arc<Completion>,
}

impl PendingCommand {
    /// The submitted command.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// The deadline of the command, computed at submission.
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Returns `true` once a result is available or the wait timed out.
    pub fn is_done(&self) -> bool {
        !self.completion.is_pending()
    }

    /// Take the result if it is available, without blocking.
    pub fn try_result(&self) -> Option<Result<Response, GpibError>> {
        self.completion.try_take()
    }

    /// Block until the result is available or the deadline of the command passed.
    pub fn wait(self) -> Result<Response, GpibError> {
        self.completion.wait(self.deadline)
    }
}

/// Identifies a registered completion listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Command, &Result<Response, GpibError>) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    registered: Mutex<Vec<(ListenerId, Listener)>>,
}

impl Listeners {
    fn notify(&self, command: &Command, result: &Result<Response, GpibError>) {
        let listeners: Vec<Listener> = self
            .registered
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(command, result)))
            {
                tracing::error!(
                    op = command.operation().name(),
                    reason = panic_message(payload.as_ref()),
                    "Completion listener panicked"
                );
            }
        }
    }
}

struct Job {
    command: Arc<Command>,
    deadline: Deadline,
    completion: Arc<Completion>,
}

/// A queue that processes submitted commands one at a time on a dedicated worker thread.
pub struct CommandQueue {
    sender: Mutex<Option<Sender<Job>>>,
    listeners: Arc<Listeners>,
    stopping: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandQueue {
    pub(crate) fn spawn<P: Process>(processor: P) -> Result<Self, GpibError> {
        let (sender, jobs) = mpsc::channel();
        let listeners = Arc::new(Listeners::default());
        let stopping = Arc::new(AtomicBool::new(false));

        let worker = {
            let listeners = Arc::clone(&listeners);
            let stopping = Arc::clone(&stopping);
            thread::Builder::new()
                .name("gpib-command-worker".to_string())
                .spawn(move || work(processor, jobs, &listeners, &stopping))?
        };

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            listeners,
            stopping,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Submit a command that must be processed within `timeout`.
    ///
    /// The timeout starts now, i.e., time spent waiting in the queue counts against it.
    pub fn submit(&self, command: Command, timeout: Duration) -> Result<PendingCommand, GpibError> {
        let pending = PendingCommand {
            command: Arc::new(command),
            deadline: Deadline::after(timeout),
            completion: Arc::new(Completion::new()),
        };
        let job = Job {
            command: Arc::clone(&pending.command),
            deadline: pending.deadline,
            completion: Arc::clone(&pending.completion),
        };

        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(GpibError::Interrupted)?;
        sender.send(job).map_err(|_| GpibError::Interrupted)?;
        Ok(pending)
    }

    /// Register a listener that is called once for every processed command.
    ///
    /// Listeners run on the worker thread before the submitter is released, so keep them short.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Command, &Result<Response, GpibError>) + Send + Sync + 'static,
    {
        let id = ListenerId(self.listeners.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .registered
            .lock()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut registered = self.listeners.registered.lock();
        let before = registered.len();
        registered.retain(|(lid, _)| *lid != id);
        registered.len() != before
    }

    /// Stop accepting commands, fail the queued ones, and wait for the worker to finish.
    pub(crate) fn close(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("Command worker panicked");
            }
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.close();
    }
}

fn work<P: Process>(
    mut processor: P,
    jobs: Receiver<Job>,
    listeners: &Listeners,
    stopping: &AtomicBool,
) {
    for job in jobs.iter() {
        if !job.completion.is_pending() {
            tracing::debug!(
                op = job.command.operation().name(),
                "Skipping command whose submitter stopped waiting"
            );
            continue;
        }

        let result = if stopping.load(Ordering::SeqCst) {
            Err(GpibError::Interrupted)
        } else {
            panic::catch_unwind(AssertUnwindSafe(|| {
                processor.process(&job.command, job.deadline)
            }))
            .unwrap_or_else(|payload| {
                let reason = panic_message(payload.as_ref());
                tracing::error!(op = job.command.operation().name(), reason, "Command panicked");
                Err(GpibError::InvalidArgument(format!(
                    "Command {} panicked: {reason}",
                    job.command.operation().name()
                )))
            })
        };

        listeners.notify(&job.command, &result);
        if !job.completion.complete(result) {
            tracing::warn!(
                op = job.command.operation().name(),
                "Discarding late result, submitter already timed out"
            );
        }
    }
    tracing::debug!("Command worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
