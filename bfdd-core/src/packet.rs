//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut, TryGetError};
use derive_new::new;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::error::DiscardReason;

//
// Generic BFD Control Packet Format.
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |Vers |  Diag   |Sta|P|F|C|A|D|M|  Detect Mult  |    Length     |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                       My Discriminator                        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                      Your Discriminator                       |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                    Desired Min TX Interval                    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                   Required Min RX Interval                    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                 Required Min Echo RX Interval                 |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Packet {
    #[new(value = "1")]
    pub version: u8,
    pub diag: DiagnosticCode,
    pub state: State,
    pub flags: PacketFlags,
    pub detect_mult: u8,
    pub my_discr: u32,
    pub your_discr: u32,
    pub desired_min_tx: u32,
    pub req_min_rx: u32,
    pub req_min_echo_rx: u32,
}

/// The four BFD session states (RFC 5880 §4.1).
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum State {
    AdminDown = 0,
    Down = 1,
    Init = 2,
    Up = 3,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::AdminDown => "AdminDown",
            State::Down => "Down",
            State::Init => "Init",
            State::Up => "Up",
        };
        write!(f, "{s}")
    }
}

/// BFD diagnostic codes, carried in the low 5 bits of byte 0.
///
/// IANA registry:
/// <https://www.iana.org/assignments/bfd-parameters/bfd-parameters.xhtml#bfd-parameters-1>
#[derive(Clone, Copy, Debug, Default, Eq, FromPrimitive, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum DiagnosticCode {
    #[default]
    None = 0,
    ControlDetectExpired = 1,
    EchoFailed = 2,
    NeighborSessionDown = 3,
    ForwardingReset = 4,
    PathDown = 5,
    ConcatPathDown = 6,
    AdminDown = 7,
    ReverseConcatPathDown = 8,
}

impl std::fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiagnosticCode::None => "none",
            DiagnosticCode::ControlDetectExpired => "control-detect-expired",
            DiagnosticCode::EchoFailed => "echo-failed",
            DiagnosticCode::NeighborSessionDown => "neighbor-session-down",
            DiagnosticCode::ForwardingReset => "forwarding-reset",
            DiagnosticCode::PathDown => "path-down",
            DiagnosticCode::ConcatPathDown => "concatenated-path-down",
            DiagnosticCode::AdminDown => "admin-down",
            DiagnosticCode::ReverseConcatPathDown => {
                "reverse-concatenated-path-down"
            }
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for DiagnosticCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "none" => DiagnosticCode::None,
            "control-detect-expired" => DiagnosticCode::ControlDetectExpired,
            "echo-failed" => DiagnosticCode::EchoFailed,
            "neighbor-session-down" => DiagnosticCode::NeighborSessionDown,
            "forwarding-reset" => DiagnosticCode::ForwardingReset,
            "path-down" => DiagnosticCode::PathDown,
            "concatenated-path-down" => DiagnosticCode::ConcatPathDown,
            "admin-down" => DiagnosticCode::AdminDown,
            "reverse-concatenated-path-down" => {
                DiagnosticCode::ReverseConcatPathDown
            }
            _ => return Err(()),
        })
    }
}

bitflags! {
    /// Byte 1's single-bit flags (State occupies the top two bits
    /// separately).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct PacketFlags: u8 {
        const POLL = 1 << 5;
        const FINAL = 1 << 4;
        const CPI = 1 << 3;
        const AUTH = 1 << 2;
        const DEMAND = 1 << 1;
        const MULTIPOINT = 1 << 0;
    }
}

// ===== impl Packet =====

impl Packet {
    pub const VERSION: u8 = 1;
    pub const MANDATORY_SECTION_LEN: u8 = 24;
    pub const AUTH_SECTION_MIN_LEN: u8 = 26;

    /// Encodes a packet into its 24-byte wire form. Always emits version 1
    /// and clears Auth/Demand/Multipoint regardless of what the in-memory
    /// value carries.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::MANDATORY_SECTION_LEN as usize);

        let clean_flags = self.flags
            & (PacketFlags::POLL | PacketFlags::FINAL | PacketFlags::CPI);

        buf.put_u8((Self::VERSION << 5) | (self.diag as u8));
        buf.put_u8(((self.state as u8) << 6) | clean_flags.bits());
        buf.put_u8(self.detect_mult);
        buf.put_u8(Self::MANDATORY_SECTION_LEN);
        buf.put_u32(self.my_discr);
        buf.put_u32(self.your_discr);
        buf.put_u32(self.desired_min_tx);
        buf.put_u32(self.req_min_rx);
        buf.put_u32(self.req_min_echo_rx);

        buf
    }

    /// Decodes a packet from `data`, rejecting with a [`DiscardReason`]
    /// on any structural violation. Discard reasons are logged exactly
    /// once by the caller; this function never logs.
    pub fn decode(data: &[u8]) -> Result<Self, DiscardReason> {
        // Check 1: length < 24.
        if data.len() < Self::MANDATORY_SECTION_LEN as usize {
            return Err(DiscardReason::TooShort);
        }

        let mut buf = Bytes::copy_from_slice(data);

        let first_byte = try_get_u8(&mut buf)?;
        let second_byte = try_get_u8(&mut buf)?;
        let diag = DiagnosticCode::from_u8(first_byte & 0x1F)
            .unwrap_or(DiagnosticCode::None);
        let version = first_byte >> 5;
        let state = State::from_u8(second_byte >> 6)
            .expect("top two bits of a u8 always map to a valid State");
        let flags = PacketFlags::from_bits_truncate(second_byte & 0x3F);
        let detect_mult = try_get_u8(&mut buf)?;
        let length = try_get_u8(&mut buf)?;

        // Check 2: Auth set and length < 26.
        if flags.contains(PacketFlags::AUTH)
            && length < Self::AUTH_SECTION_MIN_LEN
        {
            return Err(DiscardReason::TooShort);
        }
        // Check 3: length > received bytes.
        if length as usize > data.len() {
            return Err(DiscardReason::TooShort);
        }
        // Check 4: length < 24, kept deliberately as a duplicate of check 1.
        if length < Self::MANDATORY_SECTION_LEN {
            return Err(DiscardReason::TooShort);
        }
        // Check 5: version not in {0, 1}.
        if version != 0 && version != Self::VERSION {
            return Err(DiscardReason::BadVersion(version));
        }
        // Check 6: DetectMult == 0.
        if detect_mult == 0 {
            return Err(DiscardReason::BadDetectMult);
        }
        // Check 7: Multipoint set.
        if flags.contains(PacketFlags::MULTIPOINT) {
            return Err(DiscardReason::Multipoint);
        }

        let my_discr = try_get_u32(&mut buf)?;
        // Check 8: MyDiscriminator == 0.
        if my_discr == 0 {
            return Err(DiscardReason::BadMyDiscriminator);
        }
        let your_discr = try_get_u32(&mut buf)?;
        // Check 9: YourDiscriminator == 0 and State not in {Down, AdminDown}.
        if your_discr == 0
            && !matches!(state, State::Down | State::AdminDown)
        {
            return Err(DiscardReason::BadYourDiscriminator);
        }
        let desired_min_tx = try_get_u32(&mut buf)?;
        let req_min_rx = try_get_u32(&mut buf)?;
        let req_min_echo_rx = try_get_u32(&mut buf)?;

        // The codec recognizes the Auth flag only to refuse it; no
        // authentication section is parsed.
        if flags.contains(PacketFlags::AUTH) {
            return Err(DiscardReason::AuthRequested);
        }

        Ok(Packet {
            version,
            diag,
            state,
            flags,
            detect_mult,
            my_discr,
            your_discr,
            desired_min_tx,
            req_min_rx,
            req_min_echo_rx,
        })
    }
}

fn try_get_u8(buf: &mut Bytes) -> Result<u8, DiscardReason> {
    buf.try_get_u8().map_err(|_: TryGetError| DiscardReason::TooShort)
}

fn try_get_u32(buf: &mut Bytes) -> Result<u32, DiscardReason> {
    buf.try_get_u32().map_err(|_: TryGetError| DiscardReason::TooShort)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_packet() -> Packet {
        Packet {
            version: 1,
            diag: DiagnosticCode::None,
            state: State::Down,
            flags: PacketFlags::empty(),
            detect_mult: 3,
            my_discr: 42,
            your_discr: 0,
            desired_min_tx: 1_000_000,
            req_min_rx: 1_000_000,
            req_min_echo_rx: 0,
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let packet = base_packet();
        let encoded = packet.encode();
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn decode_rejects_short_packets() {
        let err = Packet::decode(&[0u8; 10]).unwrap_err();
        assert_eq!(err, DiscardReason::TooShort);
    }

    #[test]
    fn decode_rejects_zero_detect_mult() {
        let mut packet = base_packet();
        packet.detect_mult = 0;
        // Hand-encode since Packet::encode doesn't validate its own input.
        let mut buf = packet.encode();
        buf[2] = 0;
        let err = Packet::decode(&buf).unwrap_err();
        assert_eq!(err, DiscardReason::BadDetectMult);
    }

    #[test]
    fn decode_rejects_multipoint() {
        let mut packet = base_packet();
        packet.flags = PacketFlags::MULTIPOINT;
        let mut buf = BytesMut::from(&packet.encode()[..]);
        // Packet::encode masks Multipoint out deliberately, so set the bit
        // on the wire form directly to exercise the decode-side check.
        buf[1] |= PacketFlags::MULTIPOINT.bits();
        let err = Packet::decode(&buf).unwrap_err();
        assert_eq!(err, DiscardReason::Multipoint);
    }

    #[test]
    fn decode_rejects_auth_flag() {
        let mut packet = base_packet();
        packet.flags = PacketFlags::AUTH;
        let mut buf = BytesMut::from(&packet.encode()[..]);
        buf[1] |= PacketFlags::AUTH.bits();
        buf[3] = Packet::AUTH_SECTION_MIN_LEN;
        buf.extend_from_slice(&[0, 0]);
        let err = Packet::decode(&buf).unwrap_err();
        assert_eq!(err, DiscardReason::AuthRequested);
    }

    #[test]
    fn decode_rejects_zero_your_discriminator_in_up_state() {
        let mut packet = base_packet();
        packet.state = State::Up;
        let buf = packet.encode();
        let err = Packet::decode(&buf).unwrap_err();
        assert_eq!(err, DiscardReason::BadYourDiscriminator);
    }

    #[test]
    fn decode_tolerates_historical_version_zero() {
        let packet = base_packet();
        let mut buf = packet.encode();
        buf[0] &= 0x1F;
        let decoded = Packet::decode(&buf).unwrap();
        assert_eq!(decoded.version, 0);
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let packet = base_packet();
        let mut buf = packet.encode();
        buf[0] = (2 << 5) | (buf[0] & 0x1F);
        let err = Packet::decode(&buf).unwrap_err();
        assert_eq!(err, DiscardReason::BadVersion(2));
    }

    #[test]
    fn diagnostic_code_display_and_parse_round_trip() {
        let codes = [
            DiagnosticCode::None,
            DiagnosticCode::ControlDetectExpired,
            DiagnosticCode::EchoFailed,
            DiagnosticCode::NeighborSessionDown,
            DiagnosticCode::ForwardingReset,
            DiagnosticCode::PathDown,
            DiagnosticCode::ConcatPathDown,
            DiagnosticCode::AdminDown,
            DiagnosticCode::ReverseConcatPathDown,
        ];
        for code in codes {
            let parsed: DiagnosticCode = code.to_string().parse().unwrap();
            assert_eq!(parsed, code);
        }
    }

    #[test]
    fn diagnostic_code_parse_rejects_unknown_name() {
        assert!("bogus".parse::<DiagnosticCode>().is_err());
    }
}
