//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::LazyLock as Lazy;

use bfdd_core::error::DiscardReason;
use bfdd_core::packet::{DiagnosticCode, Packet, PacketFlags, State};

//
// Helper functions.
//

fn test_encode_packet(
    bytes_expected: &[u8],
    packet: &Result<Packet, DiscardReason>,
) {
    let bytes_actual = packet.as_ref().unwrap().encode();
    assert_eq!(bytes_expected, bytes_actual.as_ref());
}

fn test_decode_packet(
    bytes: &[u8],
    packet_expected: &Result<Packet, DiscardReason>,
) {
    let packet_actual = Packet::decode(bytes);
    assert_eq!(*packet_expected, packet_actual);
}

//
// Test packets.
//

static PACKET1: Lazy<(Vec<u8>, Result<Packet, DiscardReason>)> =
    Lazy::new(|| {
        (
            vec![
                0x20, 0xc0, 0x03, 0x18, 0x9f, 0xb2, 0x05, 0xd6, 0x4a, 0x23,
                0x57, 0xdc, 0x00, 0x04, 0x93, 0xe0, 0x00, 0x04, 0x93, 0xe0,
                0x00, 0x00, 0xc3, 0x50,
            ],
            Ok(Packet {
                version: 1,
                diag: DiagnosticCode::None,
                state: State::Up,
                flags: PacketFlags::empty(),
                detect_mult: 3,
                my_discr: 0x9fb205d6,
                your_discr: 0x4a2357dc,
                desired_min_tx: 300000,
                req_min_rx: 300000,
                req_min_echo_rx: 50000,
            }),
        )
    });

static PACKET2_POLL_DOWN: Lazy<(Vec<u8>, Result<Packet, DiscardReason>)> =
    Lazy::new(|| {
        (
            vec![
                0x23, 0x60, 0x05, 0x18, 0x00, 0x00, 0x00, 0x2a, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x0f, 0x42, 0x40, 0x00, 0x0f, 0x42, 0x40,
                0x00, 0x00, 0x00, 0x00,
            ],
            Ok(Packet {
                version: 1,
                diag: DiagnosticCode::NeighborSessionDown,
                state: State::Down,
                flags: PacketFlags::POLL,
                detect_mult: 5,
                my_discr: 42,
                your_discr: 0,
                desired_min_tx: 1_000_000,
                req_min_rx: 1_000_000,
                req_min_echo_rx: 0,
            }),
        )
    });

static PACKET3_TOO_SHORT: Lazy<(Vec<u8>, Result<Packet, DiscardReason>)> =
    Lazy::new(|| (vec![0x20, 0xc0, 0x03, 0x18], Err(DiscardReason::TooShort)));

//
// Tests.
//

#[test]
fn test_encode_packet1() {
    let (ref bytes, ref packet) = *PACKET1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_packet1() {
    let (ref bytes, ref packet) = *PACKET1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_packet2_poll_down() {
    let (ref bytes, ref packet) = *PACKET2_POLL_DOWN;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_packet2_poll_down() {
    let (ref bytes, ref packet) = *PACKET2_POLL_DOWN;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_decode_packet3_too_short() {
    let (ref bytes, ref packet) = *PACKET3_TOO_SHORT;
    test_decode_packet(bytes, packet);
}
