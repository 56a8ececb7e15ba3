/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type FlushFn<T> = Arc<dyn Fn(Vec<T>) + Send + Sync>;

struct TrackerState<T> {
    batch: Vec<T>,
    timer_running: bool,
}

/// Collects candidates and hands them over in batches: as soon as `batch_size` are waiting, or
/// `flush_after` after the first one of a batch arrived.
pub(crate) struct CandidateTracker<T: Send + 'static> {
    state: Arc<Mutex<TrackerState<T>>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    batch_size: usize,
    flush_after: Duration,
    flush: FlushFn<T>,
}

impl<T: Send + 'static> CandidateTracker<T> {
    pub(crate) fn new(batch_size: usize, flush_after: Duration, flush: FlushFn<T>) -> CandidateTracker<T> {
        CandidateTracker {
            state: Arc::new(Mutex::new(TrackerState { batch: Vec::new(), timer_running: false })),
            timers: Mutex::new(Vec::new()),
            batch_size: batch_size.max(1),
            flush_after,
            flush,
        }
    }

    pub(crate) fn add(&self, item: T) {
        let full_batch = {
            let mut state = self.state.lock().unwrap();
            state.batch.push(item);
            if state.batch.len() >= self.batch_size {
                Some(std::mem::take(&mut state.batch))
            } else {
                if !state.timer_running {
                    state.timer_running = true;
                    self.start_timer();
                }
                None
            }
        };
        if let Some(batch) = full_batch {
            (self.flush)(batch);
        }
    }

    /// Wait for the pending timers, which flush the batch they were started for.
    pub(crate) fn stop(&self) {
        let timers = std::mem::take(&mut *self.timers.lock().unwrap());
        for timer in timers {
            let _ = timer.join();
        }
    }

    fn start_timer(&self) {
        let state = self.state.clone();
        let flush = self.flush.clone();
        let flush_after = self.flush_after;
        let mut timers = self.timers.lock().unwrap();
        timers.retain(|timer| !timer.is_finished());
        timers.push(thread::spawn(move || {
            thread::sleep(flush_after);
            let batch = {
                let mut state = state.lock().unwrap();
                state.timer_running = false;
                std::mem::take(&mut state.batch)
            };
            if !batch.is_empty() {
                flush(batch);
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_tracker(batch_size: usize, flush_after: Duration) -> (CandidateTracker<u32>, Arc<Mutex<Vec<Vec<u32>>>>) {
        let flushed = Arc::new(Mutex::new(Vec::new()));
        let recorder = flushed.clone();
        let tracker = CandidateTracker::new(batch_size, flush_after, Arc::new(move |batch| recorder.lock().unwrap().push(batch)));
        (tracker, flushed)
    }

    #[test]
    fn full_batch_is_flushed_immediately() {
        let (tracker, flushed) = recording_tracker(3, Duration::from_secs(60));
        for i in 0..3 {
            tracker.add(i);
        }
        assert_eq!(*flushed.lock().unwrap(), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn partial_batch_is_flushed_by_timer() {
        let (tracker, flushed) = recording_tracker(10, Duration::from_millis(20));
        tracker.add(1);
        tracker.add(2);
        while flushed.lock().unwrap().is_empty() {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*flushed.lock().unwrap(), vec![vec![1, 2]]);

        // The next item starts a new timer.
        tracker.add(3);
        while flushed.lock().unwrap().len() < 2 {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(flushed.lock().unwrap()[1], vec![3]);
    }

    #[test]
    fn stop_waits_for_pending_batch() {
        let (tracker, flushed) = recording_tracker(10, Duration::from_millis(50));
        tracker.add(1);
        assert!(flushed.lock().unwrap().is_empty());

        tracker.stop();
        assert_eq!(*flushed.lock().unwrap(), vec![vec![1]]);
    }
}
