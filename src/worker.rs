//! Bounded worker pool for fire-and-forget poll jobs.
//!
//! Jobs go through a bounded crossbeam queue. Submission never blocks: a full
//! queue is reported as `WorkerPoolSaturated`. A panicking job is caught on
//! the worker thread, logged, and the worker carries on.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::PollError;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    busy: Arc<AtomicUsize>,
    workers: usize,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_capacity: usize) -> Result<Self> {
        if workers == 0 {
            return Err(anyhow!("worker pool needs at least one worker"));
        }
        let (sender, receiver) = crossbeam_channel::bounded::<Job>(queue_capacity);
        let busy = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let rx = receiver.clone();
            let busy = busy.clone();
            let handle = thread::Builder::new()
                .name(format!("poll-worker-{}", index))
                .spawn(move || worker_loop(rx, busy))
                .with_context(|| format!("spawn poll worker {}", index))?;
            handles.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            handles,
            busy,
            workers,
            capacity: queue_capacity,
        })
    }

    /// Queue a job without waiting for it to run.
    pub fn try_submit<F>(&self, job: F) -> Result<(), PollError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(PollError::WorkerPoolSaturated)?;
        match sender.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                Err(PollError::WorkerPoolSaturated)
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.sender.as_ref().map(|s| s.len()).unwrap_or(0)
    }

    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting jobs, let queued jobs drain, and join the workers.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("poll worker exited abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<Job>, busy: Arc<AtomicUsize>) {
    while let Ok(job) = rx.recv() {
        busy.fetch_add(1, Ordering::SeqCst);
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            let err = crate::task::panic_message(payload.as_ref());
            log::error!("{}: {}", thread::current().name().unwrap_or("poll-worker"), err);
        }
        busy.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    #[test]
    fn runs_submitted_jobs() -> Result<()> {
        let pool = WorkerPool::new(2, 8)?;
        let (tx, rx) = unbounded();
        for i in 0..4 {
            let tx = tx.clone();
            pool.try_submit(move || {
                let _ = tx.send(i);
            })
            .map_err(|e| anyhow!("{e}"))?;
        }
        let mut seen: Vec<i32> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)))
            .collect::<Result<_, _>>()?;
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn full_queue_reports_saturation() -> Result<()> {
        let pool = WorkerPool::new(1, 1)?;
        let (release_tx, release_rx) = unbounded::<()>();
        let (started_tx, started_rx) = unbounded::<()>();
        pool.try_submit(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
        })
        .map_err(|e| anyhow!("{e}"))?;
        started_rx.recv_timeout(Duration::from_secs(5))?;
        pool.try_submit(|| {}).map_err(|e| anyhow!("{e}"))?;
        let err = pool.try_submit(|| {}).unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::WorkerPoolSaturated);
        release_tx.send(())?;
        Ok(())
    }

    #[test]
    fn panicking_job_does_not_kill_worker() -> Result<()> {
        let pool = WorkerPool::new(1, 4)?;
        pool.try_submit(|| panic!("detector exploded"))
            .map_err(|e| anyhow!("{e}"))?;
        let (tx, rx) = unbounded();
        pool.try_submit(move || {
            let _ = tx.send(42);
        })
        .map_err(|e| anyhow!("{e}"))?;
        assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, 42);
        Ok(())
    }
}
