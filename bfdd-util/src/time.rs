//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Monotonic-clock helpers used by timers and uptime records.

use std::time::{Duration, Instant};

/// A point on the monotonic clock, suitable for ordering timer expiries and
/// measuring session uptime. Never affected by wall-clock adjustments.
pub type MonoTime = Instant;

/// Returns the current point on the monotonic clock.
pub fn now() -> MonoTime {
    Instant::now()
}

/// Converts a microsecond count (as used throughout the wire protocol and
/// the session's interval parameters) into a [`Duration`].
pub fn micros(us: u32) -> Duration {
    Duration::from_micros(us as u64)
}

/// Wall-clock timestamp for uptime records and logs, independent of the
/// monotonic clock used for scheduling.
pub fn wall_clock_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
