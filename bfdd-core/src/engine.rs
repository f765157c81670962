//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The Listener/Beacon: the single piece of state the engine thread owns.
//!
//! `Engine` holds every session behind three indexes kept in lockstep
//! (by id, by wire discriminator, by remote/local address pair), the two
//! receive sockets, and the allow/block lists that gate passive session
//! creation. It never talks to the scheduler on its own initiative —
//! timer and fd callbacks are always handed `&mut Scheduler<Engine>`
//! alongside `&mut Engine` by the loop that owns both (see [`run`]).

use std::collections::{HashMap, HashSet};
use std::net::UdpSocket;
use std::os::fd::AsRawFd;

use bfdd_util::addr::Addr;
use bfdd_util::scheduler::{Priority, Scheduler, TimerOutcome};
use bfdd_util::socket::{RecvAncillary, TTL_MAX, UdpSocketExt};
use generational_arena::{Arena, Index};
use rand::Rng;

use crate::error::{DiscardReason, Error, IoError};
use crate::network;
use crate::ops::{OpsHandle, OpsQueue};
use crate::packet::{DiagnosticCode, Packet, State};
use crate::session::{
    ExtendedStateInfo, Session, SessionId, TimeoutStatus, SESSION_PORT_MAX,
    SESSION_PORT_MIN,
};

const RECV_BUF_LEN: usize = 2048;

/// Bounded-retry discriminator generation (RFC 5880 leaves the
/// distribution unspecified beyond "nonzero"); this many collisions in a
/// row against the live discriminator set is treated as exhaustion.
const DISCRIMINATOR_ATTEMPTS: u32 = 64;

#[derive(Clone, Copy)]
enum SocketKind {
    V4,
    V6,
}

#[derive(Clone, Copy, Debug)]
pub struct SessionDefaults {
    pub desired_min_tx: u32,
    pub required_min_rx: u32,
    pub detect_mult: u8,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        SessionDefaults {
            desired_min_tx: 1_000_000,
            required_min_rx: 1_000_000,
            detect_mult: 3,
        }
    }
}

/// Picks which sessions an operator command applies to.
pub enum SessionSelector {
    All,
    Id(SessionId),
    Pair(Addr, Addr),
}

pub struct EngineConfig {
    pub listen_v4: Option<Addr>,
    pub listen_v6: Option<Addr>,
    pub strict_ports: bool,
    pub allow_all: bool,
    pub gtsm: bool,
    pub defaults: SessionDefaults,
    /// Path to an external program run on every local state transition,
    /// mirroring the `OPENBFDD_TRANSITION_HOOK` environment variable.
    pub transition_hook: Option<String>,
    bind_sockets: bool,
}

impl EngineConfig {
    pub fn new(listen_v4: Option<Addr>, listen_v6: Option<Addr>) -> Self {
        EngineConfig {
            listen_v4,
            listen_v6,
            strict_ports: false,
            allow_all: false,
            gtsm: true,
            defaults: SessionDefaults::default(),
            transition_hook: std::env::var("OPENBFDD_TRANSITION_HOOK").ok(),
            bind_sockets: true,
        }
    }

    /// An engine that never touches a real socket, for unit tests that
    /// only exercise session bookkeeping.
    #[cfg(any(test, feature = "testing"))]
    pub fn test_defaults() -> Self {
        EngineConfig {
            listen_v4: None,
            listen_v6: None,
            strict_ports: false,
            allow_all: true,
            gtsm: true,
            defaults: SessionDefaults::default(),
            transition_hook: None,
            bind_sockets: false,
        }
    }
}

pub struct Engine {
    sessions: Arena<Session>,
    by_id: HashMap<SessionId, Index>,
    by_discr: HashMap<u32, Index>,
    by_addr_pair: HashMap<(Addr, Addr), Index>,
    next_session_id: u64,
    defaults: SessionDefaults,

    allow_list: HashSet<Addr>,
    block_list: HashSet<Addr>,
    allow_all: bool,
    strict_ports: bool,
    gtsm: bool,

    recv_v4: Option<UdpSocket>,
    recv_v6: Option<UdpSocket>,
    recv_buf: Vec<u8>,

    ops: OpsQueue,
    ops_handle: OpsHandle,

    transition_hook: Option<String>,
    last_known_state: HashMap<SessionId, State>,

    test_consume_buf: Vec<u8>,
}

// ===== impl Engine =====

impl Engine {
    pub fn new(
        config: EngineConfig,
        scheduler: &mut Scheduler<Engine>,
    ) -> Result<Engine, Error> {
        let recv_v4 = match (config.bind_sockets, config.listen_v4) {
            (true, Some(addr)) => Some(network::bind_recv_socket(addr)?),
            _ => None,
        };
        let recv_v6 = match (config.bind_sockets, config.listen_v6) {
            (true, Some(addr)) => Some(network::bind_recv_socket(addr)?),
            _ => None,
        };

        let signaler = scheduler.create_signal_channel(OpsQueue::drain);
        let (ops, ops_handle) = OpsQueue::new(signaler);

        let mut engine = Engine {
            sessions: Arena::new(),
            by_id: HashMap::new(),
            by_discr: HashMap::new(),
            by_addr_pair: HashMap::new(),
            next_session_id: 1,
            defaults: config.defaults,
            allow_list: HashSet::new(),
            block_list: HashSet::new(),
            allow_all: config.allow_all,
            strict_ports: config.strict_ports,
            gtsm: config.gtsm,
            recv_v4,
            recv_v6,
            recv_buf: vec![0u8; RECV_BUF_LEN],
            ops,
            ops_handle,
            transition_hook: config.transition_hook,
            last_known_state: HashMap::new(),
            test_consume_buf: Vec::new(),
        };

        if let Some(socket) = engine.recv_v4.as_ref() {
            let fd = socket.as_raw_fd();
            scheduler.watch_fd(fd, |engine: &mut Engine, scheduler| {
                engine.drain_socket(SocketKind::V4, scheduler);
            });
        }
        if let Some(socket) = engine.recv_v6.as_ref() {
            let fd = socket.as_raw_fd();
            scheduler.watch_fd(fd, |engine: &mut Engine, scheduler| {
                engine.drain_socket(SocketKind::V6, scheduler);
            });
        }

        Ok(engine)
    }

    pub fn ops_handle(&self) -> OpsHandle {
        self.ops_handle.clone()
    }

    pub(crate) fn ops(&self) -> &OpsQueue {
        &self.ops
    }

    pub fn request_shutdown(&mut self, scheduler: &mut Scheduler<Engine>) {
        self.ops.close();
        scheduler.request_shutdown();
    }

    // ===== receive pipeline =====

    fn drain_socket(
        &mut self,
        kind: SocketKind,
        scheduler: &mut Scheduler<Engine>,
    ) {
        loop {
            let mut buf = std::mem::take(&mut self.recv_buf);
            let socket = match kind {
                SocketKind::V4 => self.recv_v4.as_ref(),
                SocketKind::V6 => self.recv_v6.as_ref(),
            };
            let Some(socket) = socket else {
                self.recv_buf = buf;
                return;
            };

            match socket.recv_ancillary(&mut buf) {
                Ok((n, ancillary)) => {
                    self.handle_packet(&buf[..n], ancillary, scheduler);
                    self.recv_buf = buf;
                }
                Err(error)
                    if error.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    self.recv_buf = buf;
                    return;
                }
                Err(error) => {
                    IoError::UdpRecvError(error).log();
                    self.recv_buf = buf;
                    return;
                }
            }
        }
    }

    /// The per-packet pipeline: GTSM, source-port policy, decode, session
    /// lookup (by discriminator, falling back to address pair), dispatch.
    fn handle_packet(
        &mut self,
        data: &[u8],
        ancillary: RecvAncillary,
        scheduler: &mut Scheduler<Engine>,
    ) {
        let source_addr: Addr = ancillary.src.ip().into();
        let source_port = ancillary.src.port();

        let Some(dst_ip) = ancillary.dst else {
            IoError::UdpRecvMissingAncillaryData.log();
            return;
        };
        let local_addr: Addr = dst_ip.into();

        if self.gtsm {
            match ancillary.ttl {
                Some(ttl) if ttl == TTL_MAX => {}
                Some(ttl) => {
                    DiscardReason::BadTtl(ttl)
                        .log(Some(source_addr.into()));
                    return;
                }
                None => {
                    IoError::UdpRecvMissingAncillaryData.log();
                    return;
                }
            }
        }

        if self.strict_ports
            && !(SESSION_PORT_MIN..=SESSION_PORT_MAX).contains(&source_port)
        {
            DiscardReason::BadSourcePort(source_port)
                .log(Some(source_addr.into()));
            return;
        }

        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(reason) => {
                reason.log(Some(source_addr.into()));
                return;
            }
        };

        let index = if packet.your_discr != 0 {
            match self.by_discr.get(&packet.your_discr) {
                Some(&index)
                    if self.sessions[index].remote_addr() == source_addr =>
                {
                    index
                }
                _ => {
                    DiscardReason::DiscriminatorMismatch {
                        your_discr: packet.your_discr,
                    }
                    .log(Some(source_addr.into()));
                    return;
                }
            }
        } else {
            match self.by_addr_pair.get(&(source_addr, local_addr)) {
                Some(&index) => index,
                None => {
                    if !self.source_allowed(source_addr) {
                        DiscardReason::UnauthorizedSource(source_addr.into())
                            .log(Some(source_addr.into()));
                        return;
                    }
                    match self.create_passive_session(
                        source_addr,
                        source_port,
                        local_addr,
                    ) {
                        Ok(index) => index,
                        Err(error) => {
                            error.log();
                            return;
                        }
                    }
                }
            }
        };

        self.sessions[index].process_control_packet(&packet, source_port);
        self.after_session_mutation(index, scheduler);
    }

    fn source_allowed(&self, source: Addr) -> bool {
        if self.block_list.contains(&source) {
            return false;
        }
        self.allow_all || self.allow_list.contains(&source)
    }

    // ===== allocation =====

    fn alloc_session_id(&mut self) -> SessionId {
        let id = SessionId(self.next_session_id);
        self.next_session_id += 1;
        id
    }

    fn alloc_discriminator(&self) -> Result<u32, Error> {
        let mut rng = rand::rng();
        for _ in 0..DISCRIMINATOR_ATTEMPTS {
            let candidate = rng.random_range(1..=u32::MAX);
            if !self.by_discr.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::DiscriminatorExhausted)
    }

    fn insert_session(&mut self, session: Session) -> Index {
        let id = session.id();
        let discr = session.discr();
        let key = session.key();
        let index = self.sessions.insert(session);
        self.by_id.insert(id, index);
        self.by_discr.insert(discr, index);
        self.by_addr_pair.insert(key, index);
        index
    }

    fn create_passive_session(
        &mut self,
        remote: Addr,
        remote_port: u16,
        local: Addr,
    ) -> Result<Index, Error> {
        let id = self.alloc_session_id();
        let discr = self.alloc_discriminator()?;
        let mut session = Session::new(
            id,
            self.defaults.desired_min_tx,
            self.defaults.required_min_rx,
            self.defaults.detect_mult,
        );
        session.set_discriminator(discr);
        session.start_passive(remote.with_port(remote_port), local)?;
        Ok(self.insert_session(session))
    }

    /// Creates a new active session, or upgrades an existing passive one
    /// bound to the same address pair in place.
    pub fn connect_active(
        &mut self,
        remote: Addr,
        local: Addr,
        scheduler: &mut Scheduler<Engine>,
    ) -> Result<SessionId, Error> {
        if let Some(&index) = self.by_addr_pair.get(&(remote, local)) {
            self.sessions[index].upgrade_to_active();
            let id = self.sessions[index].id();
            self.after_session_mutation(index, scheduler);
            return Ok(id);
        }

        let id = self.alloc_session_id();
        let discr = self.alloc_discriminator()?;
        let mut session = Session::new(
            id,
            self.defaults.desired_min_tx,
            self.defaults.required_min_rx,
            self.defaults.detect_mult,
        );
        session.set_discriminator(discr);
        session.start_active(remote, local)?;
        let index = self.insert_session(session);
        self.after_session_mutation(index, scheduler);
        Ok(id)
    }

    fn destroy_session(
        &mut self,
        index: Index,
        scheduler: &mut Scheduler<Engine>,
    ) {
        let Some(session) = self.sessions.get(index) else {
            return;
        };
        let id = session.id();
        let key = session.key();
        let discr = session.discr();
        if let Some(handle) = session.tx_timer {
            scheduler.cancel_timer(handle);
        }
        if let Some(handle) = session.detect_timer {
            scheduler.cancel_timer(handle);
        }

        self.by_id.remove(&id);
        self.by_discr.remove(&discr);
        self.by_addr_pair.remove(&key);
        self.last_known_state.remove(&id);
        self.sessions.remove(index);
        crate::debug::Debug::SessionDestroy(id).log();
    }

    /// Runs `transition_hook`, if configured, whenever a session's local
    /// state differs from what was last observed.
    fn run_transition_hook(&mut self, index: Index) {
        let Some(session) = self.sessions.get(index) else {
            return;
        };
        let id = session.id();
        let state = session.local_state();
        if self.last_known_state.get(&id) == Some(&state) {
            return;
        }
        self.last_known_state.insert(id, state);

        let Some(hook) = self.transition_hook.as_ref() else {
            return;
        };
        let status = std::process::Command::new(hook)
            .env("BFD_SESSION_ID", id.0.to_string())
            .env("BFD_REMOTE_ADDR", session.remote_addr().to_string())
            .env("BFD_LOCAL_ADDR", session.local_addr().to_string())
            .env("BFD_LOCAL_STATE", state.to_string())
            .status();
        if let Err(error) = status {
            tracing::warn!(%error, hook, "failed to run transition hook");
        }
    }

    // ===== timer management =====

    /// Rearms transmit/detection timers after any call that may have
    /// changed a session's schedule, and reaps sessions the three-phase
    /// timeout escalation has marked for destruction.
    fn after_session_mutation(
        &mut self,
        index: Index,
        scheduler: &mut Scheduler<Engine>,
    ) {
        let Some(session) = self.sessions.get(index) else {
            return;
        };
        if session.pending_destroy() {
            self.destroy_session(index, scheduler);
            return;
        }

        self.rearm_tx(index, scheduler);

        if self.sessions[index].timeout_status() == TimeoutStatus::None {
            self.rearm_detect(index, scheduler);
        }

        self.run_transition_hook(index);
    }

    fn rearm_tx(&mut self, index: Index, scheduler: &mut Scheduler<Engine>) {
        let (immediate, interval, existing_timer) = {
            let mut rng = rand::rng();
            let session = &mut self.sessions[index];
            let immediate = session.take_immediate_transmit();
            let interval = session.transmit_interval(&mut rng);
            (immediate, interval, session.tx_timer)
        };

        if immediate {
            self.sessions[index].transmit();
        }

        match interval {
            Some(delay) => {
                let handle = match existing_timer {
                    Some(handle) if scheduler.timer_is_active(handle) => {
                        scheduler.reschedule_timer(
                            handle,
                            delay,
                            Priority::High,
                            move |engine: &mut Engine, scheduler| {
                                engine.on_tx_timer(index, scheduler)
                            },
                        );
                        handle
                    }
                    _ => scheduler.arm_timer(
                        delay,
                        Priority::High,
                        move |engine: &mut Engine, scheduler| {
                            engine.on_tx_timer(index, scheduler)
                        },
                    ),
                };
                self.sessions[index].tx_timer = Some(handle);
            }
            None => {
                if let Some(handle) = existing_timer {
                    scheduler.cancel_timer(handle);
                }
                self.sessions[index].tx_timer = None;
            }
        }
    }

    fn rearm_detect(
        &mut self,
        index: Index,
        scheduler: &mut Scheduler<Engine>,
    ) {
        let (detection, existing_timer) = {
            let session = &self.sessions[index];
            (session.detection_time(), session.detect_timer)
        };

        match detection {
            Some(delay) => {
                let handle = match existing_timer {
                    Some(handle) if scheduler.timer_is_active(handle) => {
                        scheduler.reschedule_timer(
                            handle,
                            delay,
                            Priority::High,
                            move |engine: &mut Engine, scheduler| {
                                engine.on_detect_timer(index, scheduler)
                            },
                        );
                        handle
                    }
                    _ => scheduler.arm_timer(
                        delay,
                        Priority::High,
                        move |engine: &mut Engine, scheduler| {
                            engine.on_detect_timer(index, scheduler)
                        },
                    ),
                };
                self.sessions[index].detect_timer = Some(handle);
            }
            None => {
                if let Some(handle) = existing_timer {
                    scheduler.cancel_timer(handle);
                }
                self.sessions[index].detect_timer = None;
            }
        }
    }

    fn on_tx_timer(
        &mut self,
        index: Index,
        scheduler: &mut Scheduler<Engine>,
    ) -> TimerOutcome {
        if !self.sessions.contains(index) {
            return TimerOutcome::Done;
        }
        self.sessions[index].tx_timer = None;
        self.sessions[index].transmit();
        self.after_session_mutation(index, scheduler);
        TimerOutcome::Done
    }

    /// Drives the three-phase detection timeout escalation: None ->
    /// TimedOut on the first miss, TimedOut -> TxSuspended for Passive
    /// sessions after a further confirmation delay, then TxSuspended
    /// triggers destruction. Active sessions stop at TimedOut and recover
    /// on the next accepted packet.
    fn on_detect_timer(
        &mut self,
        index: Index,
        scheduler: &mut Scheduler<Engine>,
    ) -> TimerOutcome {
        if !self.sessions.contains(index) {
            return TimerOutcome::Done;
        }
        self.sessions[index].detect_timer = None;

        match self.sessions[index].timeout_status() {
            TimeoutStatus::None => {
                let detection_period = self.sessions[index]
                    .detection_time()
                    .unwrap_or_default();
                let confirm_delay = self.sessions[index]
                    .on_detection_timeout(detection_period);
                if self.sessions[index].role_is_passive() {
                    let handle = scheduler.arm_timer(
                        confirm_delay,
                        Priority::High,
                        move |engine: &mut Engine, scheduler| {
                            engine.on_detect_timer(index, scheduler)
                        },
                    );
                    self.sessions[index].detect_timer = Some(handle);
                }
                self.rearm_tx(index, scheduler);
            }
            TimeoutStatus::TimedOut => {
                let deadly_delay =
                    self.sessions[index].on_timeout_confirm();
                let handle = scheduler.arm_timer(
                    deadly_delay,
                    Priority::High,
                    move |engine: &mut Engine, scheduler| {
                        engine.on_detect_timer(index, scheduler)
                    },
                );
                self.sessions[index].detect_timer = Some(handle);
                self.rearm_tx(index, scheduler);
            }
            TimeoutStatus::TxSuspended => {
                self.sessions[index].on_deadly_timeout();
                self.after_session_mutation(index, scheduler);
            }
        }
        TimerOutcome::Done
    }

    // ===== operator commands =====

    fn resolve_selector(&self, selector: &SessionSelector) -> Vec<Index> {
        match selector {
            SessionSelector::All => self.by_id.values().copied().collect(),
            SessionSelector::Id(id) => {
                self.by_id.get(id).copied().into_iter().collect()
            }
            SessionSelector::Pair(remote, local) => self
                .by_addr_pair
                .get(&(*remote, *local))
                .copied()
                .into_iter()
                .collect(),
        }
    }

    fn apply_to_selected(
        &mut self,
        selector: &SessionSelector,
        scheduler: &mut Scheduler<Engine>,
        mut f: impl FnMut(&mut Session),
    ) {
        for index in self.resolve_selector(selector) {
            if let Some(session) = self.sessions.get_mut(index) {
                f(session);
            }
            self.after_session_mutation(index, scheduler);
        }
    }

    pub fn force_down(
        &mut self,
        selector: &SessionSelector,
        diag: DiagnosticCode,
        scheduler: &mut Scheduler<Engine>,
    ) {
        self.apply_to_selected(selector, scheduler, |session| {
            session.force_down(diag)
        });
    }

    pub fn force_admin_down(
        &mut self,
        selector: &SessionSelector,
        diag: DiagnosticCode,
        scheduler: &mut Scheduler<Engine>,
    ) {
        self.apply_to_selected(selector, scheduler, |session| {
            session.force_admin_down(diag)
        });
    }

    pub fn allow_state_changes(
        &mut self,
        selector: &SessionSelector,
        scheduler: &mut Scheduler<Engine>,
    ) {
        self.apply_to_selected(selector, scheduler, |session| {
            session.allow_state_changes()
        });
    }

    /// Forces a session down and immediately releases the force, letting
    /// the state machine reconverge on its own.
    pub fn reset_sessions(
        &mut self,
        selector: &SessionSelector,
        scheduler: &mut Scheduler<Engine>,
    ) {
        self.apply_to_selected(selector, scheduler, |session| {
            session.force_down(DiagnosticCode::None);
            session.allow_state_changes();
        });
    }

    pub fn kill_sessions(
        &mut self,
        selector: &SessionSelector,
        scheduler: &mut Scheduler<Engine>,
    ) {
        for index in self.resolve_selector(selector) {
            self.destroy_session(index, scheduler);
        }
    }

    pub fn set_suspend(
        &mut self,
        selector: &SessionSelector,
        suspend: bool,
        scheduler: &mut Scheduler<Engine>,
    ) {
        self.apply_to_selected(selector, scheduler, |session| {
            session.set_suspend(suspend)
        });
    }

    pub fn set_multi(
        &mut self,
        selector: &SessionSelector,
        detect_mult: u8,
        scheduler: &mut Scheduler<Engine>,
    ) {
        self.apply_to_selected(selector, scheduler, |session| {
            session.set_multi(detect_mult)
        });
    }

    pub fn set_min_tx_interval(
        &mut self,
        selector: &SessionSelector,
        desired_min_tx_us: u32,
        scheduler: &mut Scheduler<Engine>,
    ) {
        self.apply_to_selected(selector, scheduler, |session| {
            session.set_min_tx_interval(desired_min_tx_us)
        });
    }

    pub fn set_min_rx_interval(
        &mut self,
        selector: &SessionSelector,
        required_min_rx_us: u32,
        scheduler: &mut Scheduler<Engine>,
    ) {
        self.apply_to_selected(selector, scheduler, |session| {
            session.set_min_rx_interval(required_min_rx_us)
        });
    }

    pub fn set_control_plane_independent(
        &mut self,
        selector: &SessionSelector,
        enabled: bool,
        scheduler: &mut Scheduler<Engine>,
    ) {
        self.apply_to_selected(selector, scheduler, |session| {
            session.set_control_plane_independent(enabled)
        });
    }

    pub fn set_admin_up_poll_workaround(
        &mut self,
        selector: &SessionSelector,
        enabled: bool,
        scheduler: &mut Scheduler<Engine>,
    ) {
        self.apply_to_selected(selector, scheduler, |session| {
            session.set_admin_up_poll_workaround(enabled)
        });
    }

    /// Updates the session defaults new passive sessions inherit, leaving
    /// existing sessions untouched (use the per-session setters for those).
    pub fn set_default_min_tx(&mut self, desired_min_tx_us: u32) {
        self.defaults.desired_min_tx = desired_min_tx_us;
    }

    pub fn set_default_min_rx(&mut self, required_min_rx_us: u32) {
        self.defaults.required_min_rx = required_min_rx_us;
    }

    pub fn set_default_multi(&mut self, detect_mult: u8) {
        self.defaults.detect_mult = detect_mult;
    }

    pub fn allow(&mut self, addr: Addr) {
        self.block_list.remove(&addr);
        self.allow_list.insert(addr);
    }

    pub fn block(&mut self, addr: Addr) {
        self.allow_list.remove(&addr);
        self.block_list.insert(addr);
    }

    pub fn extended_state(
        &self,
        selector: &SessionSelector,
    ) -> Vec<ExtendedStateInfo> {
        self.resolve_selector(selector)
            .into_iter()
            .filter_map(|index| {
                self.sessions.get(index).map(Session::extended_state)
            })
            .collect()
    }

    /// Pressure-tests allocator bookkeeping by growing a throwaway buffer,
    /// mirroring the `test consume` control command.
    pub fn test_consume(&mut self, bytes: usize) {
        self.test_consume_buf.resize(
            self.test_consume_buf.len().saturating_add(bytes),
            0,
        );
    }

    /// Mirrors `test consume_beacon`: burns `count` session ids and
    /// discriminators without creating sessions, to probe exhaustion
    /// handling without needing real traffic.
    pub fn test_consume_beacon(&mut self, count: usize) -> Result<(), Error> {
        for _ in 0..count {
            self.alloc_session_id();
            self.alloc_discriminator()?;
        }
        Ok(())
    }
}

/// Drives the engine until shutdown is requested. `Engine` and
/// `Scheduler<Engine>` are kept as sibling values rather than one owning
/// the other, since a method call on a `Scheduler` field would need to
/// borrow `Engine` twice at once to hand itself back in callbacks.
pub fn run(mut engine: Engine, mut scheduler: Scheduler<Engine>) {
    while scheduler.run_once(&mut engine) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> (Engine, Scheduler<Engine>) {
        let mut scheduler = Scheduler::new();
        let engine = Engine::new(EngineConfig::test_defaults(), &mut scheduler)
            .expect("a test engine never binds real sockets");
        (engine, scheduler)
    }

    #[test]
    fn passive_session_is_indexed_three_ways() {
        let (mut engine, _scheduler) = test_engine();
        let remote: Addr = "10.1.0.2".parse().unwrap();
        let local: Addr = "10.1.0.1".parse().unwrap();
        let index = engine
            .create_passive_session(remote, 49200, local)
            .unwrap();

        let session = &engine.sessions[index];
        assert!(engine.by_id.contains_key(&session.id()));
        assert!(engine.by_discr.contains_key(&session.discr()));
        assert!(engine.by_addr_pair.contains_key(&(remote, local)));
    }

    #[test]
    fn connect_active_upgrades_an_existing_passive_session_in_place() {
        let (mut engine, mut scheduler) = test_engine();
        let remote: Addr = "10.1.0.2".parse().unwrap();
        let local: Addr = "10.1.0.1".parse().unwrap();
        let passive_index = engine
            .create_passive_session(remote, 49200, local)
            .unwrap();
        let passive_id = engine.sessions[passive_index].id();

        let id = engine.connect_active(remote, local, &mut scheduler).unwrap();
        assert_eq!(id, passive_id, "must upgrade, not duplicate");
        assert_eq!(engine.sessions.len(), 1);
    }

    #[test]
    fn destroy_session_removes_every_index() {
        let (mut engine, mut scheduler) = test_engine();
        let remote: Addr = "10.1.0.2".parse().unwrap();
        let local: Addr = "10.1.0.1".parse().unwrap();
        let index = engine
            .create_passive_session(remote, 49200, local)
            .unwrap();
        let id = engine.sessions[index].id();
        let discr = engine.sessions[index].discr();

        engine.destroy_session(index, &mut scheduler);
        assert!(!engine.by_id.contains_key(&id));
        assert!(!engine.by_discr.contains_key(&discr));
        assert!(!engine.by_addr_pair.contains_key(&(remote, local)));
        assert!(!engine.sessions.contains(index));
    }

    #[test]
    fn discriminator_allocation_avoids_existing_collisions() {
        let (mut engine, _scheduler) = test_engine();
        for i in 0..256u32 {
            let remote: Addr =
                format!("10.2.{}.{}", i / 256, i % 256).parse().unwrap();
            let local: Addr = "10.2.0.1".parse().unwrap();
            engine.create_passive_session(remote, 49200, local).unwrap();
        }
        let seen: HashSet<u32> = engine.by_discr.keys().copied().collect();
        assert_eq!(seen.len(), 256, "every session must get a unique discriminator");
    }

    #[test]
    fn selector_all_returns_every_session() {
        let (mut engine, _scheduler) = test_engine();
        for i in 0..3u8 {
            let remote: Addr = format!("10.3.0.{i}").parse().unwrap();
            let local: Addr = "10.3.0.100".parse().unwrap();
            engine.create_passive_session(remote, 49200, local).unwrap();
        }
        assert_eq!(engine.resolve_selector(&SessionSelector::All).len(), 3);
    }

    #[test]
    fn default_setters_affect_new_sessions_only() {
        let (mut engine, mut scheduler) = test_engine();
        let remote: Addr = "10.4.0.2".parse().unwrap();
        let local: Addr = "10.4.0.1".parse().unwrap();
        let before = engine.create_passive_session(remote, 49200, local).unwrap();
        let before_id = engine.sessions[before].id();

        engine.set_default_min_tx(500_000);
        engine.set_default_min_rx(500_000);
        engine.set_default_multi(7);

        assert_eq!(engine.defaults.desired_min_tx, 500_000);
        assert_eq!(engine.defaults.required_min_rx, 500_000);
        assert_eq!(engine.defaults.detect_mult, 7);
        assert!(engine.by_id.contains_key(&before_id), "existing session untouched");

        let remote2: Addr = "10.4.0.3".parse().unwrap();
        let after = engine.create_passive_session(remote2, 49200, local).unwrap();
        let _ = &mut scheduler;
        assert_ne!(before, after);
    }
}
