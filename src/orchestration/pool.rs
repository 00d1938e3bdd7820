//! Bounded worker pool.
//!
//! A fixed set of OS threads pulls jobs from a shared channel. The number of
//! threads is the hard cap on concurrently running work. Coordinators hold a
//! [`PoolHandle`] to submit jobs without borrowing the pool itself.

use crossbeam_channel::{Receiver, Sender};
use std::cell::Cell;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};
use crate::{clog_debug, clog_error};

type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static ON_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is one of a pool's workers.
pub fn on_worker_thread() -> bool {
    ON_WORKER.with(Cell::get)
}

/// Cloneable submission side of a [`WorkerPool`].
#[derive(Clone)]
pub struct PoolHandle {
    tx: Sender<Job>,
}

impl PoolHandle {
    /// Queue a job. Fails only once every worker has exited.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Box::new(job)).map_err(|_| Error::ShutDown)
    }
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("queued", &self.tx.len())
            .finish()
    }
}

struct PoolState {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

/// A fixed-size pool of worker threads.
pub struct WorkerPool {
    size: usize,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one).
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("conductor-worker-{}", index))
                .spawn(move || worker_loop(index, rx))?;
            workers.push(handle);
        }
        clog_debug!("WorkerPool started with {} workers", size);

        Ok(Self {
            size,
            state: Mutex::new(PoolState {
                tx: Some(tx),
                workers,
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// A submission handle, or [`Error::ShutDown`] once the pool is closed.
    pub fn handle(&self) -> Result<PoolHandle> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .tx
            .as_ref()
            .map(|tx| PoolHandle { tx: tx.clone() })
            .ok_or(Error::ShutDown)
    }

    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle()?.submit(job)
    }

    pub fn is_shut_down(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tx
            .is_none()
    }

    /// Close the queue without waiting for the workers.
    ///
    /// Returns true if this call closed it.
    pub fn close(&self) -> bool {
        let closed = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tx
            .take()
            .is_some();
        if closed {
            clog_debug!("WorkerPool queue closed");
        }
        closed
    }

    /// Close the queue and join every worker.
    ///
    /// Already-queued jobs still run. Workers exit once every outstanding
    /// [`PoolHandle`] is dropped too, so a job calling this on its own pool
    /// only closes the queue; the joins are left to a later call from outside
    /// the pool (at the latest, on drop). Repeated calls are a no-op.
    pub fn shutdown(&self) {
        self.close();
        if on_worker_thread() {
            clog_debug!("WorkerPool shutdown requested from a worker, skipping joins");
            return;
        }

        let workers = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut state.workers)
        };
        if workers.is_empty() {
            return;
        }
        for worker in workers {
            if worker.join().is_err() {
                clog_error!("Worker thread panicked during shutdown");
            }
        }
        clog_debug!("WorkerPool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn worker_loop(index: usize, rx: Receiver<Job>) {
    ON_WORKER.with(|flag| flag.set(true));
    while let Ok(job) = rx.recv() {
        job();
    }
    clog_debug!("Worker {} exiting", index);
}
