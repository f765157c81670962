//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use tracing::{trace, warn};

use crate::session::SessionId;

/// Why a received packet was silently dropped. None of these propagate
/// past the Listener's per-packet pipeline; each is logged once at
/// "discard" level and the packet is forgotten.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiscardReason {
    TooShort,
    BadVersion(u8),
    BadDetectMult,
    Multipoint,
    BadMyDiscriminator,
    BadYourDiscriminator,
    AuthRequested,
    BadTtl(u8),
    BadSourcePort(u16),
    DiscriminatorMismatch { your_discr: u32 },
    UnauthorizedSource(IpAddr),
}

/// Errors the core distinguishes beyond per-packet discards: lookup
/// failures, resource exhaustion, and the transient I/O conditions wrapped
/// by [`IoError`].
#[derive(Debug)]
pub enum Error {
    IoError(IoError),
    SessionIdNotFound(SessionId),
    SessionAlreadyStarted(SessionId),
    DiscriminatorExhausted,
    QueueClosed,
    BindContention(std::io::Error),
}

/// Transient I/O failures: logged, then treated as a dropped packet or
/// aborted connection. Never fatal to the engine.
#[derive(Debug)]
pub enum IoError {
    UdpSocketError(std::io::Error),
    UdpRecvError(std::io::Error),
    UdpSendError(std::io::Error),
    UdpRecvMissingAncillaryData,
    TcpAcceptError(std::io::Error),
    TcpReadError(std::io::Error),
    TcpWriteError(std::io::Error),
}

// ===== impl DiscardReason =====

impl DiscardReason {
    pub fn log(&self, source: Option<IpAddr>) {
        trace!(?source, reason = %self, "discarding packet");
    }
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscardReason::TooShort => write!(f, "packet too short"),
            DiscardReason::BadVersion(version) => {
                write!(f, "unsupported version {version}")
            }
            DiscardReason::BadDetectMult => {
                write!(f, "detect multiplier is zero")
            }
            DiscardReason::Multipoint => write!(f, "multipoint bit set"),
            DiscardReason::BadMyDiscriminator => {
                write!(f, "my discriminator is zero")
            }
            DiscardReason::BadYourDiscriminator => {
                write!(f, "your discriminator is zero outside Down/AdminDown")
            }
            DiscardReason::AuthRequested => {
                write!(f, "authentication is not supported")
            }
            DiscardReason::BadTtl(ttl) => {
                write!(f, "GTSM check failed, received TTL {ttl}")
            }
            DiscardReason::BadSourcePort(port) => {
                write!(f, "source port {port} outside the RFC 5881 range")
            }
            DiscardReason::DiscriminatorMismatch { your_discr } => {
                write!(f, "no session owns discriminator {your_discr}")
            }
            DiscardReason::UnauthorizedSource(addr) => {
                write!(f, "source {addr} is not allow-listed")
            }
        }
    }
}

// ===== impl Error =====

impl Error {
    pub fn log(&self) {
        match self {
            Error::IoError(error) => error.log(),
            Error::SessionIdNotFound(id) => {
                warn!(?id, "{}", self);
            }
            Error::SessionAlreadyStarted(id) => {
                warn!(?id, "{}", self);
            }
            Error::DiscriminatorExhausted => {
                warn!("{}", self);
            }
            Error::QueueClosed => {
                warn!("{}", self);
            }
            Error::BindContention(error) => {
                warn!(error = %with_source(error), "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(error) => error.fmt(f),
            Error::SessionIdNotFound(..) => write!(f, "session id not found"),
            Error::SessionAlreadyStarted(..) => {
                write!(f, "session was already started")
            }
            Error::DiscriminatorExhausted => {
                write!(f, "no discriminator values remain")
            }
            Error::QueueClosed => {
                write!(f, "operation queue is shutting down")
            }
            Error::BindContention(..) => {
                write!(f, "failed to bind per-session send socket")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(error) => Some(error),
            Error::BindContention(error) => Some(error),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::IoError(error)
    }
}

// ===== impl IoError =====

impl IoError {
    pub fn log(&self) {
        match self {
            IoError::UdpSocketError(error)
            | IoError::UdpRecvError(error)
            | IoError::UdpSendError(error)
            | IoError::TcpAcceptError(error)
            | IoError::TcpReadError(error)
            | IoError::TcpWriteError(error) => {
                warn!(error = %with_source(error), "{}", self);
            }
            IoError::UdpRecvMissingAncillaryData => {
                warn!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::UdpSocketError(..) => {
                write!(f, "failed to create UDP socket")
            }
            IoError::UdpRecvError(..) => {
                write!(f, "failed to receive UDP packet")
            }
            IoError::UdpSendError(..) => {
                write!(f, "failed to send UDP packet")
            }
            IoError::UdpRecvMissingAncillaryData => {
                write!(
                    f,
                    "failed to retrieve ancillary data from received packet"
                )
            }
            IoError::TcpAcceptError(..) => {
                write!(f, "failed to accept control connection")
            }
            IoError::TcpReadError(..) => {
                write!(f, "failed to read control request")
            }
            IoError::TcpWriteError(..) => {
                write!(f, "failed to write control reply")
            }
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::UdpSocketError(error)
            | IoError::UdpRecvError(error)
            | IoError::UdpSendError(error)
            | IoError::TcpAcceptError(error)
            | IoError::TcpReadError(error)
            | IoError::TcpWriteError(error) => Some(error),
            IoError::UdpRecvMissingAncillaryData => None,
        }
    }
}

// ===== global functions =====

fn with_source<E: std::error::Error>(error: E) -> String {
    if let Some(source) = error.source() {
        format!("{} ({})", error, with_source(source))
    } else {
        error.to_string()
    }
}
