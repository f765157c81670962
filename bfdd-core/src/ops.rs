//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The cross-thread operation queue: a mutex-protected FIFO plus a
//! condition variable for callers that want to block until their
//! operation has run, woken through the scheduler's self-pipe.
//!
//! [`OpsQueue`] is the consumer half, drained on the engine thread.
//! [`OpsHandle`] is the producer half: cloneable, `Send`, handed to every
//! command-processor thread. Queueing after shutdown fails.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use bfdd_util::scheduler::{Scheduler, Signaler};
use tracing::warn;

use crate::engine::Engine;
use crate::error::Error;

type Task = Box<dyn FnOnce(&mut Engine, &mut Scheduler<Engine>) + Send>;

struct Completion {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl Completion {
    fn new() -> Self {
        Completion {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut done = self.done.lock().unwrap();
        *done = true;
        self.condvar.notify_one();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.condvar.wait(done).unwrap();
        }
    }
}

struct PendingOp {
    task: Task,
    completion: Option<Arc<Completion>>,
}

struct Shared {
    queue: Mutex<VecDeque<PendingOp>>,
    shutdown: AtomicBool,
}

/// Owned by the [`Engine`][crate::engine::Engine] and drained on the
/// engine thread every time the self-pipe wakes the loop.
pub struct OpsQueue {
    shared: Arc<Shared>,
}

/// The producer half. Safe to clone across command-processor threads.
#[derive(Clone)]
pub struct OpsHandle {
    shared: Arc<Shared>,
    signaler: Signaler,
}

impl OpsQueue {
    pub fn new(signaler: Signaler) -> (OpsQueue, OpsHandle) {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            shutdown: AtomicBool::new(false),
        });
        let handle = OpsHandle {
            shared: shared.clone(),
            signaler,
        };
        (OpsQueue { shared }, handle)
    }

    /// Rejects any operation queued from this point on.
    pub fn close(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
    }

    /// Runs every operation currently queued, in enqueue order. Installed
    /// as the callback of the scheduler's signal channel.
    pub fn drain(engine: &mut Engine, scheduler: &mut Scheduler<Engine>) {
        loop {
            let pending = {
                let mut queue = engine.ops().shared.queue.lock().unwrap();
                queue.pop_front()
            };
            let Some(pending) = pending else { break };
            (pending.task)(engine, scheduler);
            if let Some(completion) = pending.completion {
                completion.signal();
            }
        }
    }
}

impl OpsHandle {
    /// Enqueues `task` and returns immediately; the engine thread runs it
    /// at its own pace.
    pub fn submit<F>(&self, task: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Engine, &mut Scheduler<Engine>) + Send + 'static,
    {
        self.push(task, None)
    }

    /// Enqueues `task` and blocks until the engine thread has run it.
    pub fn submit_and_wait<F>(&self, task: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Engine, &mut Scheduler<Engine>) + Send + 'static,
    {
        let completion = Arc::new(Completion::new());
        self.push(task, Some(completion.clone()))?;
        completion.wait();
        Ok(())
    }

    fn push<F>(&self, task: F, completion: Option<Arc<Completion>>) -> Result<(), Error>
    where
        F: FnOnce(&mut Engine, &mut Scheduler<Engine>) + Send + 'static,
    {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(Error::QueueClosed);
        }
        self.shared.queue.lock().unwrap().push_back(PendingOp {
            task: Box::new(task),
            completion,
        });
        if let Err(error) = self.signaler.signal() {
            warn!(%error, "failed to wake engine thread for a queued operation");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use super::*;
    use crate::engine::{Engine, EngineConfig};

    fn test_engine() -> (Engine, Scheduler<Engine>) {
        let mut scheduler = Scheduler::new();
        let engine = Engine::new(EngineConfig::test_defaults(), &mut scheduler)
            .expect("engine construction in the testing feature never binds real sockets");
        (engine, scheduler)
    }

    #[test]
    fn queued_operation_runs_on_the_next_drain() {
        let (mut engine, mut scheduler) = test_engine();
        let handle = engine.ops_handle();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        handle
            .submit(move |_engine, _scheduler| {
                ran2.fetch_add(1, AtomicOrdering::SeqCst);
            })
            .unwrap();
        OpsQueue::drain(&mut engine, &mut scheduler);
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn closed_queue_rejects_new_operations() {
        let (engine, _scheduler) = test_engine();
        let handle = engine.ops_handle();
        engine.ops().close();
        let result = handle.submit(|_, _| {});
        assert!(matches!(result, Err(Error::QueueClosed)));
    }
}
