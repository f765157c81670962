//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The single-threaded event loop that drives the session engine: fd
//! readability, priority-ordered one-shot timers, and cross-thread wakeups
//! through a self-pipe.
//!
//! The event backend is chosen once at construction and used through a
//! trait object so callers never need to know whether `poll` or `kqueue`
//! is underneath. The loop itself is generic over a `Ctx` type (the
//! engine) so that timer and fd callbacks receive their context as a
//! plain argument instead of through a shared, reference-counted cell.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

/// Timers never wait longer than this when the timer set is empty, so a
/// loop that is otherwise idle still notices shutdown promptly.
const MAX_IDLE_WAIT: Duration = Duration::from_secs(5);

pub type TimerId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    High,
}

/// What a fired timer wants to happen next. Every scheduler timer is
/// one-shot; returning `Reschedule` re-arms the same [`TimerHandle`] with a
/// fresh expiry instead of requiring the caller to track identity across
/// calls.
pub enum TimerOutcome {
    Done,
    Reschedule(Duration),
}

type TimerCallback<Ctx> =
    Box<dyn FnMut(&mut Ctx, &mut Scheduler<Ctx>) -> TimerOutcome>;
type FdCallback<Ctx> = Box<dyn FnMut(&mut Ctx, &mut Scheduler<Ctx>)>;

struct TimerSlot<Ctx> {
    expiry: Instant,
    priority: Priority,
    callback: Option<TimerCallback<Ctx>>,
}

/// A handle to a timer previously armed with [`Scheduler::arm_timer`].
/// Remains valid across `Reschedule` outcomes since those reuse the same
/// identity. Dropping the handle does not cancel the timer; call
/// [`Scheduler::cancel_timer`] explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(TimerId);

/// The event backend interface the loop drives: two blocking/polling
/// operations plus fd (un)registration, chosen once at construction.
trait EventBackend {
    fn watch_fd(&mut self, fd: RawFd);
    fn unwatch_fd(&mut self, fd: RawFd);
    /// Waits up to `timeout` for at least one watched fd to become
    /// readable. Returns whether any became ready.
    fn wait_for_events(&mut self, timeout: Duration) -> io::Result<bool>;
    /// Drains one ready fd from the last `wait_for_events` call, or `None`
    /// once exhausted.
    fn next_event(&mut self) -> Option<RawFd>;
}

/// Portable backend built on `poll(2)`, used whenever a platform-specific
/// backend is not selected.
struct PollBackend {
    fds: Vec<RawFd>,
    ready: Vec<RawFd>,
}

impl PollBackend {
    fn new() -> Self {
        PollBackend {
            fds: Vec::new(),
            ready: Vec::new(),
        }
    }
}

impl EventBackend for PollBackend {
    fn watch_fd(&mut self, fd: RawFd) {
        if !self.fds.contains(&fd) {
            self.fds.push(fd);
        }
    }

    fn unwatch_fd(&mut self, fd: RawFd) {
        self.fds.retain(|&watched| watched != fd);
        self.ready.retain(|&watched| watched != fd);
    }

    fn wait_for_events(&mut self, timeout: Duration) -> io::Result<bool> {
        use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

        self.ready.clear();
        if self.fds.is_empty() {
            std::thread::sleep(timeout);
            return Ok(false);
        }

        let mut pollfds: Vec<PollFd> = self
            .fds
            .iter()
            .map(|fd| {
                PollFd::new(
                    unsafe { std::os::fd::BorrowedFd::borrow_raw(*fd) },
                    PollFlags::POLLIN,
                )
            })
            .collect();

        let timeout =
            PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
        let n = loop {
            match poll(&mut pollfds, timeout) {
                Ok(n) => break n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        };

        if n > 0 {
            for (fd, pollfd) in self.fds.iter().zip(pollfds.iter()) {
                if let Some(revents) = pollfd.revents()
                    && revents.intersects(
                        PollFlags::POLLIN
                            | PollFlags::POLLHUP
                            | PollFlags::POLLERR,
                    )
                {
                    self.ready.push(*fd);
                }
            }
        }
        Ok(!self.ready.is_empty())
    }

    fn next_event(&mut self) -> Option<RawFd> {
        self.ready.pop()
    }
}

#[cfg(any(
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "macos"
))]
struct KqueueBackend {
    kq: nix::sys::event::Kqueue,
    watched: Vec<RawFd>,
    ready: Vec<RawFd>,
}

#[cfg(any(
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "macos"
))]
impl KqueueBackend {
    fn new() -> io::Result<Self> {
        let kq = nix::sys::event::Kqueue::new().map_err(io::Error::from)?;
        Ok(KqueueBackend {
            kq,
            watched: Vec::new(),
            ready: Vec::new(),
        })
    }
}

#[cfg(any(
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "macos"
))]
impl EventBackend for KqueueBackend {
    fn watch_fd(&mut self, fd: RawFd) {
        use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent};

        if self.watched.contains(&fd) {
            return;
        }
        let ev = KEvent::new(
            fd as usize,
            EventFilter::EVFILT_READ,
            EventFlag::EV_ADD | EventFlag::EV_ENABLE,
            FilterFlag::empty(),
            0,
            0,
        );
        if self.kq.kevent(&[ev], &mut [], None).is_ok() {
            self.watched.push(fd);
        }
    }

    fn unwatch_fd(&mut self, fd: RawFd) {
        use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent};

        self.watched.retain(|&watched| watched != fd);
        self.ready.retain(|&watched| watched != fd);
        let ev = KEvent::new(
            fd as usize,
            EventFilter::EVFILT_READ,
            EventFlag::EV_DELETE,
            FilterFlag::empty(),
            0,
            0,
        );
        let _ = self.kq.kevent(&[ev], &mut [], None);
    }

    fn wait_for_events(&mut self, timeout: Duration) -> io::Result<bool> {
        use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent};

        self.ready.clear();
        if self.watched.is_empty() {
            std::thread::sleep(timeout);
            return Ok(false);
        }

        let mut events = vec![
            KEvent::new(
                0,
                EventFilter::EVFILT_READ,
                EventFlag::empty(),
                FilterFlag::empty(),
                0,
                0
            );
            self.watched.len()
        ];
        let n = self
            .kq
            .kevent(&[], &mut events, Some(timeout))
            .map_err(io::Error::from)?;
        for ev in events.into_iter().take(n) {
            self.ready.push(ev.ident() as RawFd);
        }
        Ok(!self.ready.is_empty())
    }

    fn next_event(&mut self) -> Option<RawFd> {
        self.ready.pop()
    }
}

/// A self-pipe write handle. Cloneable and safe to hand to any thread;
/// calling [`Signaler::signal`] wakes the engine loop and runs the
/// callback registered with [`Scheduler::create_signal_channel`].
#[derive(Clone)]
pub struct Signaler(Arc<OwnedFd>);

impl Signaler {
    pub fn signal(&self) -> io::Result<()> {
        match nix::unistd::write(self.0.as_fd(), &[1u8]) {
            Ok(_) => Ok(()),
            // The pipe is non-blocking and bounded; a pending byte already
            // guarantees a wakeup, so EAGAIN here is not an error.
            Err(nix::errno::Errno::EAGAIN) => Ok(()),
            Err(errno) => Err(errno.into()),
        }
    }
}

pub struct Scheduler<Ctx> {
    engine_thread: ThreadId,
    backend: Box<dyn EventBackend>,
    fd_callbacks: HashMap<RawFd, FdCallback<Ctx>>,
    active_fds: HashSet<RawFd>,
    timer_order: BTreeMap<(Instant, TimerId), ()>,
    timer_slots: HashMap<TimerId, TimerSlot<Ctx>>,
    next_timer_id: TimerId,
    shutdown: bool,
    // Read ends of self-pipes must stay open for as long as the scheduler
    // watches them.
    signal_read_ends: Vec<OwnedFd>,
    last_iteration_had_events: bool,
}

impl<Ctx> Scheduler<Ctx> {
    pub fn new() -> Self {
        Self::with_backend(Self::default_backend())
    }

    #[cfg(any(
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "macos"
    ))]
    fn default_backend() -> Box<dyn EventBackend> {
        match KqueueBackend::new() {
            Ok(backend) => Box::new(backend),
            Err(error) => {
                warn!(%error, "kqueue unavailable, falling back to poll");
                Box::new(PollBackend::new())
            }
        }
    }

    #[cfg(not(any(
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "macos"
    )))]
    fn default_backend() -> Box<dyn EventBackend> {
        Box::new(PollBackend::new())
    }

    fn with_backend(backend: Box<dyn EventBackend>) -> Self {
        Scheduler {
            engine_thread: std::thread::current().id(),
            backend,
            fd_callbacks: HashMap::new(),
            active_fds: HashSet::new(),
            timer_order: BTreeMap::new(),
            timer_slots: HashMap::new(),
            next_timer_id: 1,
            shutdown: false,
            signal_read_ends: Vec::new(),
            last_iteration_had_events: false,
        }
    }

    pub fn is_engine_thread(&self) -> bool {
        std::thread::current().id() == self.engine_thread
    }

    pub fn watch_fd<F>(&mut self, fd: RawFd, callback: F)
    where
        F: FnMut(&mut Ctx, &mut Scheduler<Ctx>) + 'static,
    {
        debug_assert!(self.is_engine_thread());
        self.backend.watch_fd(fd);
        self.active_fds.insert(fd);
        self.fd_callbacks.insert(fd, Box::new(callback));
    }

    pub fn unwatch_fd(&mut self, fd: RawFd) {
        debug_assert!(self.is_engine_thread());
        self.backend.unwatch_fd(fd);
        self.active_fds.remove(&fd);
        self.fd_callbacks.remove(&fd);
    }

    /// Arms a one-shot timer that fires `callback` after `delay`.
    pub fn arm_timer<F>(
        &mut self,
        delay: Duration,
        priority: Priority,
        callback: F,
    ) -> TimerHandle
    where
        F: FnMut(&mut Ctx, &mut Scheduler<Ctx>) -> TimerOutcome + 'static,
    {
        debug_assert!(self.is_engine_thread());
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        let expiry = Instant::now() + delay;
        self.timer_order.insert((expiry, id), ());
        self.timer_slots.insert(
            id,
            TimerSlot {
                expiry,
                priority,
                callback: Some(Box::new(callback)),
            },
        );
        TimerHandle(id)
    }

    /// Re-arms an existing timer with a new delay and callback, reusing its
    /// identity. Re-inserts into the expiry order only when the new expiry
    /// actually moves the timer relative to its neighbors.
    pub fn reschedule_timer<F>(
        &mut self,
        handle: TimerHandle,
        delay: Duration,
        priority: Priority,
        callback: F,
    ) where
        F: FnMut(&mut Ctx, &mut Scheduler<Ctx>) -> TimerOutcome + 'static,
    {
        debug_assert!(self.is_engine_thread());
        let new_expiry = Instant::now() + delay;
        if let Some(slot) = self.timer_slots.get_mut(&handle.0) {
            let old_key = (slot.expiry, handle.0);
            if slot.expiry != new_expiry {
                self.timer_order.remove(&old_key);
                self.timer_order.insert((new_expiry, handle.0), ());
            }
            slot.expiry = new_expiry;
            slot.priority = priority;
            slot.callback = Some(Box::new(callback));
        } else {
            self.timer_order.insert((new_expiry, handle.0), ());
            self.timer_slots.insert(
                handle.0,
                TimerSlot {
                    expiry: new_expiry,
                    priority,
                    callback: Some(Box::new(callback)),
                },
            );
        }
    }

    pub fn cancel_timer(&mut self, handle: TimerHandle) {
        debug_assert!(self.is_engine_thread());
        if let Some(slot) = self.timer_slots.remove(&handle.0) {
            self.timer_order.remove(&(slot.expiry, handle.0));
        }
    }

    pub fn timer_is_active(&self, handle: TimerHandle) -> bool {
        self.timer_slots.contains_key(&handle.0)
    }

    /// Creates a self-pipe whose write end may be signaled from any thread;
    /// the read end is driven by this loop, which invokes `callback` once
    /// per wakeup (after draining all pending bytes).
    pub fn create_signal_channel<F>(&mut self, mut callback: F) -> Signaler
    where
        F: FnMut(&mut Ctx, &mut Scheduler<Ctx>) + 'static,
    {
        debug_assert!(self.is_engine_thread());
        let (read_fd, write_fd) =
            nix::unistd::pipe().expect("failed to create self-pipe");
        crate::socket::set_nonblocking(read_fd.as_raw_fd(), true)
            .expect("failed to set self-pipe non-blocking");
        crate::socket::set_nonblocking(write_fd.as_raw_fd(), true)
            .expect("failed to set self-pipe non-blocking");

        let raw_read = read_fd.as_raw_fd();
        self.watch_fd(raw_read, move |ctx, sched| {
            let mut buf = [0u8; 64];
            loop {
                match nix::unistd::read(
                    unsafe { std::os::fd::BorrowedFd::borrow_raw(raw_read) },
                    &mut buf,
                ) {
                    Ok(0) | Err(_) => break,
                    Ok(n) if n < buf.len() => break,
                    Ok(_) => continue,
                }
            }
            callback(ctx, sched);
        });
        self.signal_read_ends.push(read_fd);

        Signaler(Arc::new(write_fd))
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown = true;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    fn next_timer_expiry(&self) -> Option<Instant> {
        self.timer_order.keys().next().map(|(expiry, _)| *expiry)
    }

    /// Fires every expired timer at `priority`, restarting the scan from
    /// the front after each firing since a callback may arm new timers.
    fn fire_expired(&mut self, ctx: &mut Ctx, priority: Priority, now: Instant) {
        loop {
            let next = self
                .timer_order
                .iter()
                .find(|((expiry, id), _)| {
                    *expiry <= now
                        && self
                            .timer_slots
                            .get(id)
                            .is_some_and(|slot| slot.priority == priority)
                })
                .map(|(key, _)| *key);

            let Some(key) = next else { break };
            self.fire_timer(ctx, key);
        }
    }

    /// Fires a single low-priority timer, if any is due.
    fn fire_one_low(&mut self, ctx: &mut Ctx) -> bool {
        let key = self
            .timer_order
            .iter()
            .find(|((expiry, id), _)| {
                *expiry <= Instant::now()
                    && self
                        .timer_slots
                        .get(id)
                        .is_some_and(|slot| slot.priority == Priority::Low)
            })
            .map(|(key, _)| *key);

        let Some(key) = key else { return false };
        self.fire_timer(ctx, key);
        true
    }

    fn fire_timer(&mut self, ctx: &mut Ctx, key: (Instant, TimerId)) {
        self.timer_order.remove(&key);
        let Some(mut slot) = self.timer_slots.remove(&key.1) else {
            return;
        };
        let Some(mut callback) = slot.callback.take() else {
            return;
        };
        match callback(ctx, self) {
            TimerOutcome::Done => {}
            TimerOutcome::Reschedule(delay) => {
                let new_expiry = Instant::now() + delay;
                self.timer_order.insert((new_expiry, key.1), ());
                self.timer_slots.insert(
                    key.1,
                    TimerSlot {
                        expiry: new_expiry,
                        priority: slot.priority,
                        callback: Some(callback),
                    },
                );
            }
        }
    }

    /// Runs one iteration of the loop: waits for fd readiness bounded by
    /// the next timer expiry, fires due timers, dispatches ready fds.
    /// Returns `false` once shutdown has been observed and the loop should
    /// stop calling this method.
    pub fn run_once(&mut self, ctx: &mut Ctx) -> bool {
        debug_assert!(self.is_engine_thread());
        if self.shutdown {
            return false;
        }

        let timeout = if self.last_iteration_had_events {
            Duration::ZERO
        } else {
            match self.next_timer_expiry() {
                Some(expiry) => {
                    expiry.saturating_duration_since(Instant::now())
                }
                None => MAX_IDLE_WAIT,
            }
        };

        let had_fd_events = match self.backend.wait_for_events(timeout) {
            Ok(had_events) => had_events,
            Err(error) => {
                warn!(%error, "scheduler backend wait failed");
                false
            }
        };

        let now = Instant::now();
        self.fire_expired(ctx, Priority::High, now);

        let mut dispatched_any = had_fd_events;
        while let Some(fd) = self.backend.next_event() {
            if let Some(mut callback) = self.fd_callbacks.remove(&fd) {
                callback(ctx, self);
                // The callback may have unwatched itself via unwatch_fd;
                // only reinsert if it is still registered for this fd.
                if self.active_fds.contains(&fd) {
                    self.fd_callbacks.insert(fd, callback);
                }
            }
        }

        if !dispatched_any && !self.fire_one_low(ctx) {
            trace!("scheduler iteration produced no events");
        } else {
            dispatched_any = true;
        }
        self.last_iteration_had_events = dispatched_any;

        !self.shutdown
    }
}

impl<Ctx> Default for Scheduler<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn high_priority_timer_fires_before_deadline_elapses() {
        let mut sched: Scheduler<()> = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let mut ctx = ();
        sched.arm_timer(Duration::from_millis(1), Priority::High, move |_, _| {
            fired2.fetch_add(1, Ordering::SeqCst);
            TimerOutcome::Done
        });
        for _ in 0..20 {
            if fired.load(Ordering::SeqCst) > 0 {
                break;
            }
            sched.run_once(&mut ctx);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reschedule_outcome_keeps_firing_under_the_same_handle() {
        let mut sched: Scheduler<()> = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let mut ctx = ();
        let handle = sched.arm_timer(
            Duration::from_millis(1),
            Priority::High,
            move |_, _| {
                let n = fired2.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    TimerOutcome::Reschedule(Duration::from_millis(1))
                } else {
                    TimerOutcome::Done
                }
            },
        );
        for _ in 0..60 {
            if fired.load(Ordering::SeqCst) >= 3 {
                break;
            }
            sched.run_once(&mut ctx);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(!sched.timer_is_active(handle));
    }

    #[test]
    fn cancel_timer_prevents_firing() {
        let mut sched: Scheduler<()> = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let mut ctx = ();
        let handle = sched.arm_timer(
            Duration::from_millis(5),
            Priority::High,
            move |_, _| {
                fired2.fetch_add(1, Ordering::SeqCst);
                TimerOutcome::Done
            },
        );
        sched.cancel_timer(handle);
        assert!(!sched.timer_is_active(handle));
        std::thread::sleep(Duration::from_millis(10));
        sched.run_once(&mut ctx);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn signal_channel_wakes_loop_from_another_thread() {
        let mut sched: Scheduler<()> = Scheduler::new();
        let woken = Arc::new(AtomicUsize::new(0));
        let woken2 = woken.clone();
        let mut ctx = ();
        let signaler = sched.create_signal_channel(move |_, _| {
            woken2.fetch_add(1, Ordering::SeqCst);
        });

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            signaler.signal().unwrap();
        });

        for _ in 0..50 {
            if woken.load(Ordering::SeqCst) > 0 {
                break;
            }
            sched.run_once(&mut ctx);
        }
        handle.join().unwrap();
        assert_eq!(woken.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn is_engine_thread_is_true_on_the_creating_thread() {
        let sched: Scheduler<()> = Scheduler::new();
        assert!(sched.is_engine_thread());
    }
}
