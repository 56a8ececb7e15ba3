/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Parallel fan-out of tasks, usually one per node, that succeeds once a quorum of them succeeds.
//!
//! Every task runs on its own thread and reports into the pool's result channel. [`QuorumPool::wait`]
//! returns once the outcome is decided: quorum reached, quorum unreachable, or the caller's context done.
//! No task thread outlives its owner.
//!
//! Two modes decide what context the tasks get, and who waits for the tasks still running:
//! - [`QuorumMode::Read`]: a child of the caller's context. Stragglers are cancelled and joined before
//!   `wait` returns. Used for requests whose late answers are worthless.
//! - [`QuorumMode::Write`]: a context with a fixed timeout that the pool does not cancel. Used for writes that
//!   should land on every node even after quorum is reached. Stragglers are handed to the pool's
//!   [`TaskGroup`], which joins them on [`TaskGroup::join_all`], or joined before `wait` returns if the pool
//!   has no group.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crate::context::Context;
use crate::errors::StreamError;
use crate::events::{Event, QuorumFailedEvent};
use crate::types::data_types::Address;

/// Number of successes out of `total` that form a majority.
pub fn total_quorum_num(total: usize) -> usize {
    total / 2 + 1
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug)]
pub enum QuorumMode {
    Read,
    Write { timeout: Duration },
}

/// Outcome of a fan-out.
#[derive(Debug, Default)]
pub struct QuorumState {
    pub total: usize,
    pub quorum: usize,
    pub succeeded: usize,
    pub errors: Vec<StreamError>,
}

impl QuorumState {
    pub fn is_quorum_reached(&self) -> bool {
        self.succeeded >= self.quorum
    }

    /// True once enough tasks failed that the remaining ones cannot make up a quorum.
    pub fn is_quorum_unreachable(&self) -> bool {
        self.errors.len() > self.total.saturating_sub(self.quorum)
    }

    fn is_complete(&self) -> bool {
        self.succeeded + self.errors.len() >= self.total
    }
}

/// Owner of task threads that outlive the call that started them. Their contexts derive from the group's,
/// so cancelling the group's context cancels them.
pub struct TaskGroup {
    ctx: Context,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskGroup {
    pub fn new(ctx: Context) -> TaskGroup {
        TaskGroup { ctx, tasks: Mutex::new(Vec::new()) }
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    /// Take ownership of `tasks`. Tasks that already finished are reaped.
    pub fn adopt(&self, tasks: Vec<JoinHandle<()>>) {
        let mut owned = self.tasks.lock().unwrap();
        owned.retain(|task| !task.is_finished());
        owned.extend(tasks.into_iter().filter(|task| !task.is_finished()));
    }

    /// Number of adopted tasks still running.
    pub fn running(&self) -> usize {
        self.tasks.lock().unwrap().iter().filter(|task| !task.is_finished()).count()
    }

    /// Wait for every adopted task.
    pub fn join_all(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.join();
        }
    }
}

/// Once quorum is reached, keep collecting results for `elapsed * fraction + extra`.
#[derive(Clone, Copy, Debug)]
struct ExtraWait {
    fraction: f64,
    extra: Duration,
}

pub struct QuorumPool {
    name: String,
    ctx: Context,
    task_ctx: Context,
    mode: QuorumMode,
    results_sender: Sender<Result<(), StreamError>>,
    results: Receiver<Result<(), StreamError>>,
    tasks: Vec<JoinHandle<()>>,
    task_group: Option<Arc<TaskGroup>>,
    total: usize,
    local_successes: usize,
    quorum_num: Option<usize>,
    extra_wait: Option<ExtraWait>,
    started: Instant,
    event_publisher: Option<Sender<Event>>,
}

impl QuorumPool {
    pub fn new(name: impl Into<String>, ctx: &Context, mode: QuorumMode) -> QuorumPool {
        let task_ctx = match mode {
            QuorumMode::Read => ctx.child(),
            QuorumMode::Write { timeout } => Context::with_timeout(timeout),
        };
        let (results_sender, results) = mpsc::channel();
        QuorumPool {
            name: name.into(),
            ctx: ctx.clone(),
            task_ctx,
            mode,
            results_sender,
            results,
            tasks: Vec::new(),
            task_group: None,
            total: 0,
            local_successes: 0,
            quorum_num: None,
            extra_wait: None,
            started: Instant::now(),
            event_publisher: None,
        }
    }

    /// Require `quorum_num` successes instead of a majority of the tasks.
    pub fn with_quorum_num(mut self, quorum_num: usize) -> Self {
        self.quorum_num = Some(quorum_num);
        self
    }

    pub fn with_extra_wait(mut self, fraction: f64, extra: Duration) -> Self {
        self.extra_wait = Some(ExtraWait { fraction, extra });
        self
    }

    /// Hand write tasks still running after [`QuorumPool::wait`] to `group`, and derive their context from
    /// the group's. Has no effect in read mode.
    pub fn with_task_group(mut self, group: Arc<TaskGroup>) -> Self {
        if let QuorumMode::Write { timeout } = self.mode {
            self.task_ctx = group.ctx().child_with_timeout(timeout);
            self.task_group = Some(group);
        }
        self
    }

    pub(crate) fn with_event_publisher(mut self, event_publisher: Option<Sender<Event>>) -> Self {
        self.event_publisher = event_publisher;
        self
    }

    pub fn add_task<F>(&mut self, task: F)
    where
        F: FnOnce(&Context) -> Result<(), StreamError> + Send + 'static,
    {
        self.total += 1;
        let ctx = self.task_ctx.clone();
        let results = self.results_sender.clone();
        self.tasks.push(thread::spawn(move || {
            let result = task(&ctx);
            // The pool stops listening once the outcome is decided.
            let _ = results.send(result);
        }));
    }

    /// Add one task per node.
    pub fn add_node_tasks<F>(&mut self, nodes: &[Address], task: F)
    where
        F: Fn(&Context, Address) -> Result<(), StreamError> + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        for node in nodes {
            let task = task.clone();
            let node = *node;
            self.add_task(move |ctx| task(ctx, node));
        }
    }

    /// Count a task that has already succeeded, such as the local node's part of a fan-out to peers.
    pub fn add_local_success(&mut self) {
        self.total += 1;
        self.local_successes += 1;
    }

    pub fn wait(self) -> Result<(), StreamError> {
        self.wait_with_state().1
    }

    pub fn wait_with_state(mut self) -> (QuorumState, Result<(), StreamError>) {
        let mut state = QuorumState {
            total: self.total,
            quorum: self.quorum_num.unwrap_or_else(|| total_quorum_num(self.total)),
            succeeded: self.local_successes,
            errors: Vec::new(),
        };
        if self.total == 0 {
            return (state, Ok(()));
        }

        while !state.is_quorum_reached() && !state.is_quorum_unreachable() {
            if let Err(err) = self.receive_one(&mut state, POLL_INTERVAL) {
                self.finish();
                return (state, Err(err));
            }
        }

        if state.is_quorum_unreachable() {
            self.finish();
            Event::publish(
                &self.event_publisher,
                Event::QuorumFailed(QuorumFailedEvent {
                    timestamp: SystemTime::now(),
                    name: self.name.clone(),
                    succeeded: state.succeeded,
                    needed: state.quorum,
                    total: state.total,
                }),
            );
            let err = StreamError::QuorumFailed {
                name: self.name.clone(),
                needed: state.quorum,
                succeeded: state.succeeded,
                total: state.total,
                errors: std::mem::take(&mut state.errors),
            };
            return (state, Err(err));
        }

        if let Some(extra_wait) = self.extra_wait {
            let mut wait_for = self.started.elapsed().mul_f64(extra_wait.fraction) + extra_wait.extra;
            if let Some(remaining) = self.ctx.remaining() {
                wait_for = wait_for.min(remaining.mul_f64(0.9));
            }
            let until = Instant::now() + wait_for;
            while !state.is_complete() {
                let now = Instant::now();
                if now >= until {
                    break;
                }
                if self.receive_one(&mut state, (until - now).min(POLL_INTERVAL)).is_err() {
                    break;
                }
            }
        }

        self.finish();
        (state, Ok(()))
    }

    /// Receive at most one result. Fails only if the caller's context is done.
    fn receive_one(&self, state: &mut QuorumState, timeout: Duration) -> Result<(), StreamError> {
        match self.results.recv_timeout(timeout) {
            Ok(Ok(())) => state.succeeded += 1,
            Ok(Err(err)) => {
                if !err.is_cancellation() {
                    log::warn!("{}: task failed: {}", self.name, err);
                }
                state.errors.push(err);
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => self.ctx.check()?,
        }
        Ok(())
    }

    /// Cancel or hand over the tasks still running, per the pool's mode.
    fn finish(&mut self) {
        let tasks = std::mem::take(&mut self.tasks);
        match (&self.mode, &self.task_group) {
            (QuorumMode::Write { .. }, Some(group)) => group.adopt(tasks),
            (mode, _) => {
                if let QuorumMode::Read = mode {
                    self.task_ctx.cancel();
                }
                for task in tasks {
                    let _ = task.join();
                }
            }
        }
    }
}
