//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The per-peer BFD state machine.
//!
//! A [`Session`] is pure state plus state-transition logic: it never
//! touches the scheduler directly. The owning engine reads
//! [`Session::transmit_interval`] and [`Session::detection_time`] after
//! every mutating call to decide what (if anything) to (re)arm, and stores
//! the resulting [`TimerHandle`]s back on the session for bookkeeping.

use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use bfdd_util::addr::{Addr, BoundAddr};
use bfdd_util::scheduler::TimerHandle;
use bfdd_util::socket::{SocketExt, TTL_MAX, UdpSocketExt};
use rand::Rng;

use crate::debug::Debug;
use crate::error::{Error, IoError};
use crate::packet::{DiagnosticCode, Packet, PacketFlags, State};

/// Destination port every BFD control packet is sent to (RFC 5881).
pub const BFD_DEST_PORT: u16 = 3784;

/// Ephemeral source port range sessions probe when binding their send
/// socket (RFC 5881 §4).
pub const SESSION_PORT_MIN: u16 = 49152;
pub const SESSION_PORT_MAX: u16 = 65535;

/// The "slow poll" base interval enforced whenever the local state is not
/// Up.
pub const SLOW_POLL_INTERVAL_US: u32 = 1_000_000;

/// Number of missed detection intervals before a TimedOut session's
/// follow-up confirmation timer fires.
const DESTROY_AFTER_TIMEOUTS: u32 = 3;

/// Multiplier applied during the TxSuspended "deadly" timer.
const REMOTE_DESTROY_AFTER_TIMEOUTS: u32 = 3;

const UPTIME_RING_CAP: usize = 32;

/// A small, human-readable session identifier, distinct from the wire
/// discriminator. Assigned once by the owning engine and never reused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Active,
    Passive,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PollState {
    None,
    Requested,
    Polling,
    Completed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeoutStatus {
    None,
    TimedOut,
    TxSuspended,
}

#[derive(Clone, Debug)]
pub struct UptimeRecord {
    pub state: State,
    pub start: Instant,
    pub end: Option<Instant>,
    pub forced: bool,
}

/// The full read model returned by [`Session::extended_state`], shaped
/// after what an operator's `status`/`session` commands need to render.
#[derive(Clone, Debug)]
pub struct ExtendedStateInfo {
    pub id: SessionId,
    pub discr: u32,
    pub remote_discr: u32,
    pub remote_addr: Addr,
    pub local_addr: Addr,
    pub remote_port: u16,
    pub role: Role,
    pub local_state: State,
    pub remote_state: State,
    pub local_diag: DiagnosticCode,
    pub remote_diag: DiagnosticCode,
    pub configured_desired_min_tx: u32,
    pub configured_required_min_rx: u32,
    pub effective_desired_min_tx: u32,
    pub effective_required_min_rx: u32,
    pub detect_mult: u8,
    pub remote_detect_mult: u8,
    pub remote_desired_min_tx: u32,
    pub remote_required_min_rx: u32,
    pub transmit_interval: Option<Duration>,
    pub detection_time: Option<Duration>,
    pub poll_state: PollState,
    pub timeout_status: TimeoutStatus,
    pub suspended: bool,
    pub forced: bool,
    pub control_plane_independent: bool,
    pub uptime: Vec<UptimeRecord>,
}

pub struct Session {
    pub id: SessionId,
    discr: u32,
    remote_discr: u32,
    remote_addr: Addr,
    local_addr: Addr,
    remote_port: u16,
    role: Role,
    local_state: State,
    remote_state: State,
    local_diag: DiagnosticCode,
    remote_diag: DiagnosticCode,

    cfg_desired_min_tx: u32,
    cfg_required_min_rx: u32,
    eff_desired_min_tx: u32,
    eff_required_min_rx: u32,
    pending_desired_min_tx: Option<u32>,
    pending_required_min_rx: Option<u32>,

    detect_mult: u8,
    control_plane_independent: bool,
    admin_up_poll_workaround: bool,

    remote_detect_mult: u8,
    remote_desired_min_tx: u32,
    remote_required_min_rx: u32,

    poll_state: PollState,
    poll_requeued: bool,
    reply_final: bool,

    timeout_status: TimeoutStatus,

    forced: bool,
    suspended: bool,
    immediate_transmit: bool,
    started: bool,
    pending_destroy: bool,

    send_socket: Option<UdpSocket>,
    send_port: u16,

    pub tx_timer: Option<TimerHandle>,
    pub detect_timer: Option<TimerHandle>,

    uptime: VecDeque<UptimeRecord>,
}

// ===== impl Session =====

impl Session {
    /// Creates an unstarted session. `start_passive` or `start_active`
    /// must be called exactly once before the session takes part in the
    /// protocol.
    pub fn new(
        id: SessionId,
        cfg_desired_min_tx: u32,
        cfg_required_min_rx: u32,
        detect_mult: u8,
    ) -> Session {
        Session {
            id,
            discr: 0,
            remote_discr: 0,
            remote_addr: Addr::Invalid,
            local_addr: Addr::Invalid,
            remote_port: 0,
            role: Role::Passive,
            local_state: State::Down,
            remote_state: State::Down,
            local_diag: DiagnosticCode::None,
            remote_diag: DiagnosticCode::None,
            cfg_desired_min_tx,
            cfg_required_min_rx,
            eff_desired_min_tx: SLOW_POLL_INTERVAL_US,
            eff_required_min_rx: cfg_required_min_rx,
            pending_desired_min_tx: None,
            pending_required_min_rx: None,
            detect_mult,
            control_plane_independent: false,
            admin_up_poll_workaround: false,
            remote_detect_mult: 0,
            remote_desired_min_tx: 0,
            remote_required_min_rx: 0,
            poll_state: PollState::None,
            poll_requeued: false,
            reply_final: false,
            timeout_status: TimeoutStatus::None,
            forced: false,
            suspended: false,
            immediate_transmit: false,
            started: false,
            pending_destroy: false,
            send_socket: None,
            send_port: 0,
            tx_timer: None,
            detect_timer: None,
            uptime: VecDeque::with_capacity(UPTIME_RING_CAP),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn discr(&self) -> u32 {
        self.discr
    }

    /// Assigned once by the engine right after discriminator allocation.
    pub fn set_discriminator(&mut self, discr: u32) {
        self.discr = discr;
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn local_state(&self) -> State {
        self.local_state
    }

    pub fn timeout_status(&self) -> TimeoutStatus {
        self.timeout_status
    }

    pub fn role_is_passive(&self) -> bool {
        self.role == Role::Passive
    }

    /// The (remote, local) address pair sessions are additionally indexed
    /// by.
    pub fn key(&self) -> (Addr, Addr) {
        (self.remote_addr, self.local_addr)
    }

    pub fn remote_addr(&self) -> Addr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> Addr {
        self.local_addr
    }

    pub fn pending_destroy(&self) -> bool {
        self.pending_destroy
    }

    /// Returns and clears the immediate-transmit flag. The engine should
    /// treat a `true` result as "schedule a transmit now".
    pub fn take_immediate_transmit(&mut self) -> bool {
        std::mem::take(&mut self.immediate_transmit)
    }

    // ===== lifecycle =====

    pub fn start_passive(
        &mut self,
        remote: BoundAddr,
        local_ip: Addr,
    ) -> Result<(), Error> {
        if self.started {
            return Err(Error::SessionAlreadyStarted(self.id));
        }
        self.role = Role::Passive;
        self.remote_addr = remote.addr();
        self.remote_port = remote.port();
        self.local_addr = local_ip;
        self.bind_send_socket()?;
        self.started = true;
        self.push_uptime_record();
        Debug::SessionCreate(self.id, self.remote_addr, self.local_addr)
            .log();
        Ok(())
    }

    pub fn start_active(
        &mut self,
        remote_ip: Addr,
        local_ip: Addr,
    ) -> Result<(), Error> {
        if self.started {
            return Err(Error::SessionAlreadyStarted(self.id));
        }
        self.role = Role::Active;
        self.remote_addr = remote_ip;
        self.local_addr = local_ip;
        self.bind_send_socket()?;
        self.started = true;
        self.immediate_transmit = true;
        self.push_uptime_record();
        Debug::SessionCreate(self.id, self.remote_addr, self.local_addr)
            .log();
        Ok(())
    }

    pub fn upgrade_to_active(&mut self) {
        if self.role == Role::Passive {
            self.role = Role::Active;
            self.immediate_transmit = true;
        }
    }

    fn bind_send_socket(&mut self) -> Result<(), Error> {
        let mut rng = rand::rng();
        let span = (SESSION_PORT_MAX - SESSION_PORT_MIN) as u32 + 1;
        let start_offset = rng.random_range(0..span);

        for step in 0..span {
            let offset = (start_offset + step) % span;
            let port = SESSION_PORT_MIN + offset as u16;
            let sockaddr: SocketAddr = self.local_addr.with_port(port).into();

            match UdpSocket::bind_reuseaddr(sockaddr) {
                Ok(socket) => {
                    let ttl_result = match self.local_addr {
                        Addr::V6(..) => {
                            socket.set_ipv6_unicast_hops(TTL_MAX)
                        }
                        _ => socket.set_ipv4_ttl(TTL_MAX),
                    };
                    if let Err(error) = ttl_result {
                        return Err(Error::BindContention(error));
                    }
                    self.send_socket = Some(socket);
                    self.send_port = port;
                    return Ok(());
                }
                Err(error)
                    if error.kind() == std::io::ErrorKind::AddrInUse
                        || error.raw_os_error()
                            == Some(libc::EAGAIN) =>
                {
                    continue;
                }
                Err(error) => return Err(Error::BindContention(error)),
            }
        }

        Err(Error::BindContention(std::io::Error::from(
            std::io::ErrorKind::AddrInUse,
        )))
    }

    // ===== state machine =====

    pub fn process_control_packet(&mut self, packet: &Packet, source_port: u16) {
        debug_assert!(self.started);

        if source_port != self.remote_port {
            let old_port = self.remote_port;
            self.remote_port = source_port;
            Debug::SourcePortChanged(self.id, old_port, source_port).log();
        }

        self.remote_discr = packet.my_discr;
        self.remote_state = packet.state;
        self.remote_diag = packet.diag;
        self.remote_detect_mult = packet.detect_mult;
        self.remote_desired_min_tx = packet.desired_min_tx.max(1);
        self.remote_required_min_rx = packet.req_min_rx;
        self.timeout_status = TimeoutStatus::None;

        if packet.flags.contains(PacketFlags::POLL) {
            self.reply_final = true;
            self.immediate_transmit = true;
        }

        let old_local_state = self.local_state;
        if !self.forced {
            self.apply_fsm(packet.state);
        }
        if old_local_state != self.local_state {
            Debug::FsmTransition(self.id, old_local_state, self.local_state)
                .log();
            self.immediate_transmit = true;
            self.push_uptime_record();
            if self.local_state != State::Up {
                self.eff_desired_min_tx = SLOW_POLL_INTERVAL_US;
            }
        }

        self.advance_poll_state(packet);
    }

    /// RFC 5880 §6.8.6 state table, with AdminDown held until
    /// `allow_state_changes`.
    fn apply_fsm(&mut self, remote_state: State) {
        if self.local_state == State::AdminDown {
            return;
        }
        if remote_state == State::AdminDown {
            self.local_diag = DiagnosticCode::NeighborSessionDown;
            self.local_state = State::Down;
            return;
        }
        self.local_state = match (self.local_state, remote_state) {
            (State::Down, State::Down) => State::Init,
            (State::Down, State::Init) => State::Up,
            (State::Init, State::Init) | (State::Init, State::Up) => {
                State::Up
            }
            (State::Up, State::Down) => {
                self.local_diag = DiagnosticCode::NeighborSessionDown;
                State::Down
            }
            (state, _) => state,
        };
    }

    fn advance_poll_state(&mut self, packet: &Packet) {
        if packet.flags.contains(PacketFlags::FINAL) {
            if self.poll_state == PollState::Polling {
                self.transition_poll_state(PollState::Completed);
                self.promote_pending();
                self.immediate_transmit = true;
            }
        } else if self.poll_state == PollState::Completed {
            self.transition_poll_state(PollState::None);
            if self.poll_requeued {
                self.poll_requeued = false;
                self.transition_poll_state(PollState::Requested);
            }
        }
    }

    fn transition_poll_state(&mut self, new: PollState) {
        let old = self.poll_state;
        self.poll_state = new;
        Debug::PollStateTransition(self.id, old, new).log();
    }

    fn promote_pending(&mut self) {
        if let Some(pending) = self.pending_desired_min_tx.take() {
            self.eff_desired_min_tx = pending;
        }
        if let Some(pending) = self.pending_required_min_rx.take() {
            self.eff_required_min_rx = pending;
        }
    }

    fn request_poll(&mut self) {
        if self.poll_state == PollState::None {
            self.transition_poll_state(PollState::Requested);
        } else {
            self.poll_requeued = true;
        }
    }

    // ===== operator overrides =====

    pub fn force_down(&mut self, diag: DiagnosticCode) {
        self.set_forced_state(State::Down, diag);
    }

    pub fn force_admin_down(&mut self, diag: DiagnosticCode) {
        self.set_forced_state(State::AdminDown, diag);
    }

    fn set_forced_state(&mut self, state: State, diag: DiagnosticCode) {
        self.forced = true;
        let old = self.local_state;
        self.local_state = state;
        self.local_diag = diag;
        if old != state {
            Debug::FsmTransition(self.id, old, state).log();
            self.push_uptime_record();
            self.immediate_transmit = true;
            if state != State::Up {
                self.eff_desired_min_tx = SLOW_POLL_INTERVAL_US;
            }
        }
    }

    pub fn allow_state_changes(&mut self) {
        if !self.forced {
            return;
        }
        self.forced = false;
        if self.local_state == State::AdminDown {
            let old = self.local_state;
            self.local_state = State::Down;
            self.local_diag = DiagnosticCode::None;
            Debug::FsmTransition(self.id, old, self.local_state).log();
            self.push_uptime_record();
            self.immediate_transmit = true;
            if self.admin_up_poll_workaround {
                self.request_poll();
            }
        }
    }

    pub fn set_suspend(&mut self, suspend: bool) {
        self.suspended = suspend;
    }

    pub fn set_multi(&mut self, detect_mult: u8) {
        if detect_mult != self.detect_mult {
            self.detect_mult = detect_mult;
            self.immediate_transmit = true;
        }
    }

    pub fn set_control_plane_independent(&mut self, enabled: bool) {
        if enabled != self.control_plane_independent {
            self.control_plane_independent = enabled;
            self.immediate_transmit = true;
        }
    }

    pub fn set_admin_up_poll_workaround(&mut self, enabled: bool) {
        self.admin_up_poll_workaround = enabled;
    }

    /// Tightening changes (shorter transmit interval) apply immediately;
    /// relaxing changes need the peer's agreement via a poll sequence.
    pub fn set_min_tx_interval(&mut self, desired_min_tx_us: u32) {
        if desired_min_tx_us == self.cfg_desired_min_tx {
            return;
        }
        self.cfg_desired_min_tx = desired_min_tx_us;
        if self.local_state != State::Up {
            return;
        }
        if desired_min_tx_us <= self.eff_desired_min_tx {
            self.eff_desired_min_tx = desired_min_tx_us;
            self.pending_desired_min_tx = None;
        } else {
            self.pending_desired_min_tx = Some(desired_min_tx_us);
            self.request_poll();
        }
    }

    /// Loosening changes (longer receive tolerance) apply immediately;
    /// tightening changes need the peer's agreement via a poll sequence.
    pub fn set_min_rx_interval(&mut self, required_min_rx_us: u32) {
        if required_min_rx_us == self.cfg_required_min_rx {
            return;
        }
        self.cfg_required_min_rx = required_min_rx_us;
        if required_min_rx_us >= self.eff_required_min_rx {
            self.eff_required_min_rx = required_min_rx_us;
            self.pending_required_min_rx = None;
        } else {
            self.pending_required_min_rx = Some(required_min_rx_us);
            self.request_poll();
        }
    }

    // ===== transmit scheduling =====

    /// The jittered transmit interval, or `None` when no periodic
    /// transmission should occur right now.
    pub fn transmit_interval(&self, rng: &mut impl Rng) -> Option<Duration> {
        if self.suspended || self.timeout_status == TimeoutStatus::TxSuspended
        {
            return None;
        }
        if self.role == Role::Passive && self.remote_discr == 0 {
            return None;
        }
        if self.remote_required_min_rx == 0 {
            return None;
        }

        let desired_min_tx = self.eff_desired_min_tx;
        let base = desired_min_tx.max(self.remote_required_min_rx) as f64;

        let u: f64 = rng.random_range(0.75..=1.00);
        let mut interval = base * u;
        if self.detect_mult == 1 {
            interval = interval.min(base * 0.90);
        }
        Some(Duration::from_micros(interval.floor() as u64))
    }

    /// The detection timeout, or `None` when the receive timer should be
    /// stopped (no packet from the peer has been accepted, or the
    /// effective receive requirement is zero).
    pub fn detection_time(&self) -> Option<Duration> {
        if self.eff_required_min_rx == 0 || self.remote_detect_mult == 0 {
            return None;
        }
        let interval =
            self.eff_required_min_rx.max(self.remote_desired_min_tx);
        Some(Duration::from_micros(
            self.remote_detect_mult as u64 * interval as u64,
        ))
    }

    /// Builds the next outbound packet, advancing the poll/final
    /// bookkeeping as a side effect (mirrors what actually sending it on
    /// the wire commits to).
    pub fn build_outbound_packet(&mut self) -> Packet {
        if self.poll_state == PollState::Requested {
            self.transition_poll_state(PollState::Polling);
        }

        let mut flags = PacketFlags::empty();
        if matches!(self.poll_state, PollState::Requested | PollState::Polling)
        {
            flags |= PacketFlags::POLL;
        }
        if self.reply_final {
            flags |= PacketFlags::FINAL;
            self.reply_final = false;
        }
        if self.control_plane_independent {
            flags |= PacketFlags::CPI;
        }

        let desired_min_tx = self
            .pending_desired_min_tx
            .unwrap_or(self.eff_desired_min_tx);
        let req_min_rx = self
            .pending_required_min_rx
            .unwrap_or(self.eff_required_min_rx);

        Packet {
            version: Packet::VERSION,
            diag: self.local_diag,
            state: self.local_state,
            flags,
            detect_mult: self.detect_mult,
            my_discr: self.discr,
            your_discr: self.remote_discr,
            desired_min_tx,
            req_min_rx,
            req_min_echo_rx: 0,
        }
    }

    /// Encodes and sends the next outbound packet from the session's own
    /// socket. Transmit failures are logged and otherwise ignored; the
    /// state machine is unaffected.
    pub fn transmit(&mut self) {
        let packet = self.build_outbound_packet();
        let Some(socket) = self.send_socket.as_ref() else {
            return;
        };
        let dest: SocketAddr =
            self.remote_addr.with_port(BFD_DEST_PORT).into();
        let buf = packet.encode();
        if let Err(error) = socket.send_to(&buf, dest) {
            IoError::UdpSendError(error).log();
        }
    }

    // ===== detection timeout escalation =====

    /// Phase 1: the detection timer fired. Transitions to Down (unless
    /// forced) and zeroes the remote discriminator. Returns the delay for
    /// the follow-up confirmation timer.
    pub fn on_detection_timeout(&mut self, detection_period: Duration) -> Duration {
        self.timeout_status = TimeoutStatus::TimedOut;
        Debug::TimeoutEscalation(self.id, self.timeout_status).log();

        let old_local_state = self.local_state;
        if !self.forced {
            self.local_diag = DiagnosticCode::ControlDetectExpired;
            self.local_state = State::Down;
        }
        if old_local_state != self.local_state {
            Debug::FsmTransition(self.id, old_local_state, self.local_state)
                .log();
            self.push_uptime_record();
            self.eff_desired_min_tx = SLOW_POLL_INTERVAL_US;
            self.immediate_transmit = true;
        }

        self.remote_discr = 0;
        self.remote_required_min_rx = 1;

        detection_period * (DESTROY_AFTER_TIMEOUTS - 1)
    }

    /// Phase 2: the confirmation timer fired (Passive sessions only).
    /// Suppresses outbound transmission. Returns the delay for the final
    /// "deadly" timer.
    pub fn on_timeout_confirm(&mut self) -> Duration {
        self.timeout_status = TimeoutStatus::TxSuspended;
        Debug::TimeoutEscalation(self.id, self.timeout_status).log();

        let base = self
            .eff_desired_min_tx
            .max(self.cfg_desired_min_tx)
            .max(self.remote_required_min_rx);
        Duration::from_micros(
            REMOTE_DESTROY_AFTER_TIMEOUTS as u64
                * self.detect_mult as u64
                * base as u64,
        )
    }

    /// Phase 3: the deadly timer fired. The engine must remove this
    /// session from its indexes after this call returns.
    pub fn on_deadly_timeout(&mut self) {
        self.pending_destroy = true;
    }

    // ===== reporting =====

    pub fn extended_state(&self) -> ExtendedStateInfo {
        ExtendedStateInfo {
            id: self.id,
            discr: self.discr,
            remote_discr: self.remote_discr,
            remote_addr: self.remote_addr,
            local_addr: self.local_addr,
            remote_port: self.remote_port,
            role: self.role,
            local_state: self.local_state,
            remote_state: self.remote_state,
            local_diag: self.local_diag,
            remote_diag: self.remote_diag,
            configured_desired_min_tx: self.cfg_desired_min_tx,
            configured_required_min_rx: self.cfg_required_min_rx,
            effective_desired_min_tx: self.eff_desired_min_tx,
            effective_required_min_rx: self.eff_required_min_rx,
            detect_mult: self.detect_mult,
            remote_detect_mult: self.remote_detect_mult,
            remote_desired_min_tx: self.remote_desired_min_tx,
            remote_required_min_rx: self.remote_required_min_rx,
            transmit_interval: self.transmit_interval(&mut rand::rng()),
            detection_time: self.detection_time(),
            poll_state: self.poll_state,
            timeout_status: self.timeout_status,
            suspended: self.suspended,
            forced: self.forced,
            control_plane_independent: self.control_plane_independent,
            uptime: self.uptime.iter().cloned().collect(),
        }
    }

    fn push_uptime_record(&mut self) {
        let now = bfdd_util::time::now();
        if let Some(last) = self.uptime.back_mut()
            && last.end.is_none()
        {
            last.end = Some(now);
        }
        if self.uptime.len() == UPTIME_RING_CAP {
            self.uptime.pop_front();
        }
        self.uptime.push_back(UptimeRecord {
            state: self.local_state,
            start: now,
            end: None,
            forced: self.forced,
        });
    }
}

#[cfg(test)]
mod tests {
    use bfdd_util::addr::Addr;

    use super::*;

    fn up_pair() -> (Session, Session) {
        let mut a = Session::new(SessionId(1), 100_000, 100_000, 3);
        a.set_discriminator(10);
        a.start_active(
            "10.0.0.2".parse::<Addr>().unwrap(),
            "10.0.0.1".parse::<Addr>().unwrap(),
        )
        .unwrap();

        let mut b = Session::new(SessionId(2), 100_000, 100_000, 3);
        b.set_discriminator(20);
        b.start_passive(
            "10.0.0.1:49200".parse().unwrap(),
            "10.0.0.2".parse::<Addr>().unwrap(),
        )
        .unwrap();
        (a, b)
    }

    fn packet_from(s: &Session) -> Packet {
        Packet {
            version: Packet::VERSION,
            diag: DiagnosticCode::None,
            state: s.local_state,
            flags: PacketFlags::empty(),
            detect_mult: s.detect_mult,
            my_discr: s.discr,
            your_discr: s.remote_discr,
            desired_min_tx: s.eff_desired_min_tx,
            req_min_rx: s.eff_required_min_rx,
            req_min_echo_rx: 0,
        }
    }

    #[test]
    fn bring_up_reaches_up_on_both_sides() {
        let (mut a, mut b) = up_pair();
        assert_eq!(a.local_state, State::Down);
        assert_eq!(b.local_state, State::Down);

        // b receives a's first Down packet -> Init.
        let pkt_a = packet_from(&a);
        b.process_control_packet(&pkt_a, 49200);
        assert_eq!(b.local_state, State::Init);

        // a receives b's Init packet -> Up.
        let pkt_b = packet_from(&b);
        a.process_control_packet(&pkt_b, 49200);
        assert_eq!(a.local_state, State::Up);

        // b receives a's Up packet -> Up.
        let pkt_a = packet_from(&a);
        b.process_control_packet(&pkt_a, 49200);
        assert_eq!(b.local_state, State::Up);
    }

    #[test]
    fn admin_down_is_held_until_allow_state_changes() {
        let (mut a, _b) = up_pair();
        a.force_admin_down(DiagnosticCode::AdminDown);
        assert_eq!(a.local_state, State::AdminDown);

        let pkt = Packet {
            state: State::Up,
            ..packet_from(&a)
        };
        a.process_control_packet(&pkt, 49200);
        assert_eq!(
            a.local_state,
            State::AdminDown,
            "forced state must suppress incoming transitions"
        );

        a.allow_state_changes();
        assert_eq!(a.local_state, State::Down);
    }

    #[test]
    fn relaxing_tx_interval_requires_a_completed_poll() {
        let (mut a, _b) = up_pair();
        a.local_state = State::Up;
        a.eff_desired_min_tx = 100_000;

        a.set_min_tx_interval(500_000);
        assert_eq!(a.cfg_desired_min_tx, 500_000);
        assert_eq!(
            a.eff_desired_min_tx, 100_000,
            "effective must not jump ahead of the poll"
        );
        assert_eq!(a.poll_state, PollState::Requested);

        let outbound = a.build_outbound_packet();
        assert!(outbound.flags.contains(PacketFlags::POLL));
        assert_eq!(a.poll_state, PollState::Polling);
        assert_eq!(
            outbound.desired_min_tx, 500_000,
            "poll advertises the new configured value"
        );

        let reply = Packet {
            flags: PacketFlags::FINAL,
            ..packet_from(&a)
        };
        a.process_control_packet(&reply, 49200);
        assert_eq!(a.poll_state, PollState::Completed);
        assert_eq!(a.eff_desired_min_tx, 500_000);
    }

    #[test]
    fn transmit_interval_keeps_old_rate_while_polling() {
        let (mut a, _b) = up_pair();
        a.local_state = State::Up;
        a.remote_discr = 99;
        a.eff_desired_min_tx = 100_000;
        a.remote_required_min_rx = 100_000;

        a.set_min_tx_interval(500_000);
        assert_eq!(a.poll_state, PollState::Requested);
        assert_eq!(a.pending_desired_min_tx, Some(500_000));

        let mut rng = rand::rng();
        for _ in 0..50 {
            let interval = a.transmit_interval(&mut rng).unwrap();
            assert!(
                interval <= Duration::from_micros(100_000),
                "must still transmit at the old rate until Final=1 is processed"
            );
        }

        let reply = Packet {
            flags: PacketFlags::FINAL,
            ..packet_from(&a)
        };
        a.process_control_packet(&reply, 49200);
        assert_eq!(a.eff_desired_min_tx, 500_000);
        let interval = a.transmit_interval(&mut rng).unwrap();
        assert!(interval <= Duration::from_micros(500_000));
    }

    #[test]
    fn tightening_rx_interval_applies_immediately() {
        let (mut a, _b) = up_pair();
        a.eff_required_min_rx = 100_000;
        a.set_min_rx_interval(50_000);
        assert_eq!(a.eff_required_min_rx, 50_000);
        assert_eq!(
            a.poll_state,
            PollState::Requested,
            "tightening our own receive window still needs peer agreement"
        );
    }

    #[test]
    fn detection_timeout_escalates_through_three_phases() {
        let (mut a, _b) = up_pair();
        a.local_state = State::Up;
        a.remote_discr = 99;
        a.remote_detect_mult = 3;
        a.remote_desired_min_tx = 100_000;
        a.eff_required_min_rx = 100_000;

        let d = a.detection_time().unwrap();
        let confirm_delay = a.on_detection_timeout(d);
        assert_eq!(a.local_state, State::Down);
        assert_eq!(a.remote_discr, 0);
        assert_eq!(confirm_delay, d * 2);

        let deadly_delay = a.on_timeout_confirm();
        assert_eq!(a.timeout_status, TimeoutStatus::TxSuspended);
        assert!(deadly_delay > Duration::ZERO);
        assert!(a.transmit_interval(&mut rand::rng()).is_none());

        a.on_deadly_timeout();
        assert!(a.pending_destroy());
    }

    #[test]
    fn zero_remote_min_rx_disables_periodic_transmit() {
        let (mut a, _b) = up_pair();
        a.remote_discr = 99;
        a.remote_required_min_rx = 0;
        assert!(a.transmit_interval(&mut rand::rng()).is_none());
    }

    #[test]
    fn detect_mult_one_caps_jitter_at_90_percent() {
        let (mut a, _b) = up_pair();
        a.detect_mult = 1;
        a.remote_discr = 99;
        a.eff_desired_min_tx = 1_000_000;
        a.remote_required_min_rx = 1_000_000;

        let mut rng = rand::rng();
        for _ in 0..50 {
            let interval = a.transmit_interval(&mut rng).unwrap();
            assert!(interval <= Duration::from_micros(900_000));
        }
    }

    #[test]
    fn passive_session_does_not_transmit_before_first_packet() {
        let (_a, b) = up_pair();
        assert!(b.transmit_interval(&mut rand::rng()).is_none());
    }
}
