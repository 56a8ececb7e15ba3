/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Deadlines and cancellation for blocking operations.
//!
//! A [`Context`] is passed to every call that may block on storage, a peer, or the registry. Children
//! inherit their parent's cancellation and the tighter of the two deadlines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::StreamError;

#[derive(Clone, Debug)]
pub struct Context {
    deadline: Option<Instant>,
    cancelled: Vec<Arc<AtomicBool>>,
}

impl Context {
    /// A context that never expires and is never cancelled by a parent.
    pub fn background() -> Context {
        Context { deadline: None, cancelled: vec![Arc::new(AtomicBool::new(false))] }
    }

    /// A fresh context, detached from any parent, that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Context {
        Context { deadline: Some(Instant::now() + timeout), cancelled: vec![Arc::new(AtomicBool::new(false))] }
    }

    /// A child that is cancelled when `self` is cancelled, and can be cancelled on its own.
    pub fn child(&self) -> Context {
        let mut cancelled = self.cancelled.clone();
        cancelled.push(Arc::new(AtomicBool::new(false)));
        Context { deadline: self.deadline, cancelled }
    }

    /// A child whose deadline is at most `timeout` from now.
    pub fn child_with_timeout(&self, timeout: Duration) -> Context {
        let mut child = self.child();
        let deadline = Instant::now() + timeout;
        child.deadline = Some(match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        });
        child
    }

    /// Cancel this context and every child derived from it.
    pub fn cancel(&self) {
        if let Some(flag) = self.cancelled.last() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` if there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.iter().any(|flag| flag.load(Ordering::SeqCst))
    }

    /// `Canceled` or `DeadlineExceeded` once the context is done.
    pub fn err(&self) -> Option<StreamError> {
        if self.is_cancelled() {
            return Some(StreamError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StreamError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Shorthand for the `?` operator at the top of long-running loops.
    pub fn check(&self) -> Result<(), StreamError> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Sleep for `duration`, returning early with an error if the context finishes first.
    pub fn sleep(&self, duration: Duration) -> Result<(), StreamError> {
        let until = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            std::thread::sleep((until - now).min(Duration::from_millis(10)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_follows_parent_cancellation() {
        let parent = Context::background();
        let child = parent.child();
        let sibling = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());

        parent.cancel();
        assert!(sibling.is_cancelled());
        assert!(matches!(sibling.err(), Some(StreamError::Canceled)));
    }

    #[test]
    fn deadline_is_inherited() {
        let parent = Context::with_timeout(Duration::from_millis(5));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert!(child.remaining().unwrap() <= Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(10));
        assert!(matches!(child.err(), Some(StreamError::DeadlineExceeded)));
    }
}
