/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A fixed number of worker threads that run submitted jobs in FIFO order.
//!
//! Reconciliation runs on two of these: a large pool for the initial sync of every stream when the node
//! starts, and a small one for streams that fall behind while the node is online. Miniblock jobs run on a
//! third.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    name: String,
    jobs: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize) -> WorkerPool {
        let name = name.into();
        let (jobs, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..size.max(1)).map(|_| start_worker(receiver.clone())).collect();
        WorkerPool { name, jobs: Mutex::new(Some(jobs)), workers: Mutex::new(workers) }
    }

    /// Queue `job`. Returns false, dropping the job, if the pool is stopped.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let submitted = match &*self.jobs.lock().unwrap() {
            Some(jobs) => jobs.send(Box::new(job)).is_ok(),
            None => false,
        };
        if !submitted {
            log::debug!("{}: worker pool is stopped, job dropped", self.name);
        }
        submitted
    }

    /// Refuse new jobs, then wait until the workers have run every queued one.
    pub fn stop(&self) {
        // Closing the channel lets every worker finish its queue and exit.
        self.jobs.lock().unwrap().take();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        let current = thread::current().id();
        for worker in workers {
            // A job may hold the last reference to the pool's owner.
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

fn start_worker(receiver: Arc<Mutex<Receiver<Job>>>) -> JoinHandle<()> {
    thread::spawn(move || loop {
        // Hold the lock only while taking the next job.
        let job = receiver.lock().unwrap().recv();
        match job {
            Ok(job) => job(),
            Err(_) => return,
        }
    })
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn runs_every_job_before_shutdown() {
        let done = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new("test", 3);
        for _ in 0..20 {
            let done = done.clone();
            pool.submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool);
        assert_eq!(done.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn stopped_pool_refuses_jobs() {
        let done = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new("test", 2);
        let counter = done.clone();
        assert!(pool.submit(move || {
            thread::sleep(std::time::Duration::from_millis(50));
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // The queued job has run by the time `stop` returns.
        pool.stop();
        assert_eq!(done.load(Ordering::SeqCst), 1);

        let counter = done.clone();
        assert!(!pool.submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
