use std::cell::Cell;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam::channel;
use crossbeam::channel::{Receiver, Sender, TrySendError};
use log::{debug, error};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

type JoinHandleT = JoinHandle<()>;

// directory tasks recurse on the worker
const WORKER_STACK_SIZE: usize = 32 << 20;

thread_local! {
    static ON_WORKER: Cell<bool> = const { Cell::new(false) };
}

// a poisoned lock only means some job panicked; the data it guards is still usable
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// jobs queued or running
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn start(&self) {
        *lock(&self.count) += 1;
    }

    fn done(&self) {
        let mut count = lock(&self.count);
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Fixed set of worker threads fed from a bounded channel.
pub struct WorkQueue {
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandleT>>,
    pending: Arc<Pending>,
}

impl WorkQueue {
    pub fn new(workers: usize, max_jobs: usize) -> io::Result<WorkQueue> {
        let (sender, receiver) = channel::bounded::<Job>(max_jobs);
        let pending = Arc::new(Pending {
            count: Mutex::new(0),
            idle: Condvar::new(),
        });
        let mut handles = vec![];
        for i in 0..workers {
            let input = receiver.clone();
            let pending = pending.clone();
            let handle = thread::Builder::new()
                .name(format!("fsck-worker-{}", i))
                .stack_size(WORKER_STACK_SIZE)
                .spawn(move || worker(input, pending))?;
            handles.push(handle);
        }
        debug!("started {} workers, queue depth {}", workers, max_jobs);
        Ok(WorkQueue {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
            pending,
        })
    }

    /// Queue a job. Workers never block on a full queue; they get the job back instead and are
    /// expected to run it themselves. Other threads wait for room. After `terminate` every job is
    /// handed back.
    pub fn add(&self, job: Job) -> Result<(), Job> {
        let Some(sender) = lock(&self.sender).clone() else {
            return Err(job);
        };
        self.pending.start();
        let res = if ON_WORKER.get() {
            sender.try_send(job).map_err(TrySendError::into_inner)
        } else {
            sender.send(job).map_err(|e| e.into_inner())
        };
        if res.is_err() {
            self.pending.done();
        }
        res
    }

    /// Block until every queued job has finished, including jobs queued by jobs.
    pub fn wait_idle(&self) {
        let count = lock(&self.pending.count);
        let _count = self
            .pending
            .idle
            .wait_while(count, |c| *c > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Stop accepting work, let the workers drain the queue and join them.
    pub fn terminate(&self) {
        drop(lock(&self.sender).take());
        let handles: Vec<_> = lock(&self.handles).drain(..).collect();
        let me = thread::current().id();
        for h in handles {
            if h.thread().id() == me {
                continue;
            }
            if h.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn worker(input: Receiver<Job>, pending: Arc<Pending>) {
    ON_WORKER.set(true);
    for job in input.iter() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("job panicked");
        }
        pending.done();
    }
}
