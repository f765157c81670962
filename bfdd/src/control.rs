//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The control transport: one command-processor thread per listening
//! port, each accepting loopback TCP connections and translating framed
//! requests into calls queued onto the engine thread.
//!
//! Every request starts with the 4-byte magic `0xFEED1966` followed by
//! up to 1024 bytes of NUL-terminated argv strings. The reply is
//! free-form text describing the outcome.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;

use bfdd_core::engine::{Engine, SessionSelector};
use bfdd_core::error::{Error, IoError};
use bfdd_core::ops::OpsHandle;
use bfdd_core::packet::DiagnosticCode;
use bfdd_core::session::{ExtendedStateInfo, SessionId};
use bfdd_util::addr::Addr;
use bfdd_util::scheduler::Scheduler;
use bfdd_util::socket::TcpListenerExt;
use tracing::error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::reload;

const MAGIC: u32 = 0xFEED_1966;
const MAX_REQUEST_LEN: usize = 1024;

pub type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Spawns the accept loop for one control port as a detached thread.
pub fn spawn(port: u16, ops: OpsHandle, log: LogHandle) {
    std::thread::spawn(move || run_listener(port, ops, log));
}

fn run_listener(port: u16, ops: OpsHandle, log: LogHandle) {
    let addr = format!("127.0.0.1:{port}").parse().unwrap();
    let listener = match TcpListener::bind_reuseaddr(addr) {
        Ok(listener) => listener,
        Err(error) => {
            error!(%error, port, "failed to bind control transport");
            return;
        }
    };

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let ops = ops.clone();
                let log = log.clone();
                std::thread::spawn(move || handle_connection(stream, &ops, &log));
            }
            Err(error) => IoError::TcpAcceptError(error).log(),
        }
    }
}

fn handle_connection(mut stream: TcpStream, ops: &OpsHandle, log: &LogHandle) {
    let args = match read_request(&mut stream) {
        Ok(args) => args,
        Err(error) => {
            IoError::TcpReadError(error).log();
            return;
        }
    };

    let reply = dispatch(&args, ops, log);
    if let Err(error) = stream.write_all(reply.as_bytes()) {
        IoError::TcpWriteError(error).log();
    }
    let _ = stream.shutdown(std::net::Shutdown::Both);
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<Vec<String>> {
    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic)?;
    if u32::from_be_bytes(magic) != MAGIC {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad request magic",
        ));
    }

    let mut payload = Vec::new();
    stream
        .take((MAX_REQUEST_LEN - magic.len()) as u64)
        .read_to_end(&mut payload)?;
    Ok(payload
        .split(|&b| b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect())
}

/// Queues `f` on the engine thread and blocks for its return value.
fn call<T, F>(ops: &OpsHandle, f: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce(&mut Engine, &mut Scheduler<Engine>) -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    ops.submit_and_wait(move |engine, scheduler| {
        let _ = tx.send(f(engine, scheduler));
    })?;
    rx.recv().map_err(|_| Error::QueueClosed)
}

fn format_status(states: &[ExtendedStateInfo], brief: bool) -> String {
    let mut out = format!("0 {}\n", states.len());
    for state in states {
        if brief {
            out.push_str(&format!(
                "session {} {} {}\n",
                state.id.0, state.remote_addr, state.local_state,
            ));
            continue;
        }
        out.push_str(&format!(
            "session {} discr {} remote {} local {} state {} remote-state {} \
             poll {:?} timeout {:?} suspended {} forced {}\n",
            state.id.0,
            state.discr,
            state.remote_addr,
            state.local_addr,
            state.local_state,
            state.remote_state,
            state.poll_state,
            state.timeout_status,
            state.suspended,
            state.forced,
        ));
    }
    out
}

fn reply_result(result: Result<(), Error>) -> String {
    match result {
        Ok(()) => "0\n".to_owned(),
        Err(error) => format!("1 {error}\n"),
    }
}

/// Parses a selector of the form `all`, a bare session id, or
/// `local <ip> remote <ip>`. Returns the selector and how many tokens it
/// consumed, so callers can find the verb that follows.
fn parse_selector(tokens: &[String]) -> Option<(SessionSelector, usize)> {
    match tokens.first().map(String::as_str) {
        Some("all") => Some((SessionSelector::All, 1)),
        Some("local") => {
            let local: Addr = tokens.get(1)?.parse().ok()?;
            if tokens.get(2).map(String::as_str) != Some("remote") {
                return None;
            }
            let remote: Addr = tokens.get(3)?.parse().ok()?;
            Some((SessionSelector::Pair(remote, local), 4))
        }
        Some(token) => {
            let id: u64 = token.parse().ok()?;
            Some((SessionSelector::Id(SessionId(id)), 1))
        }
        None => None,
    }
}

/// Parses `local <ip> remote <ip>` or `remote <ip> local <ip>`, the order
/// the `connect` command accepts either way around.
fn parse_endpoints(tokens: &[String]) -> Option<(Addr, Addr)> {
    let mut local = None;
    let mut remote = None;
    let mut i = 0;
    while i + 1 < tokens.len() {
        match tokens[i].as_str() {
            "local" => local = tokens[i + 1].parse::<Addr>().ok(),
            "remote" => remote = tokens[i + 1].parse::<Addr>().ok(),
            _ => return None,
        }
        i += 2;
    }
    Some((local?, remote?))
}

/// Converts a time value followed by an optional unit (`s`, `ms`, `us`,
/// default `us`) into microseconds.
fn parse_time_value(value: &str, unit: Option<&str>) -> Option<u32> {
    let n: u64 = value.parse().ok()?;
    let us = match unit {
        Some("s") => n.checked_mul(1_000_000)?,
        Some("ms") => n.checked_mul(1_000)?,
        Some("us") | None => n,
        Some(_) => return None,
    };
    u32::try_from(us).ok()
}

fn dispatch(args: &[String], ops: &OpsHandle, log: &LogHandle) -> String {
    match args.first().map(String::as_str) {
        Some("version") => format!("0 {}\n", env!("CARGO_PKG_VERSION")),

        Some("stop") => {
            let _ = call(ops, |engine, scheduler| {
                engine.request_shutdown(scheduler)
            });
            "stopping\n".to_owned()
        }

        Some("connect") => match parse_endpoints(&args[1..]) {
            Some((local, remote)) => match call(ops, move |engine, scheduler| {
                engine.connect_active(remote, local, scheduler)
            }) {
                Ok(Ok(id)) => format!("0 session {}\n", id.0),
                Ok(Err(error)) => format!("1 {error}\n"),
                Err(error) => format!("1 {error}\n"),
            },
            None => {
                "1 usage: connect local <ip> remote <ip>\n".to_owned()
            }
        },

        Some("allow") => match args.get(1).and_then(|s| s.parse::<Addr>().ok()) {
            Some(addr) => reply_result(call(ops, move |engine, _scheduler| {
                engine.allow(addr)
            })),
            None => "1 usage: allow <addr>\n".to_owned(),
        },

        Some("block") => match args.get(1).and_then(|s| s.parse::<Addr>().ok()) {
            Some(addr) => reply_result(call(ops, move |engine, _scheduler| {
                engine.block(addr)
            })),
            None => "1 usage: block <addr>\n".to_owned(),
        },

        Some("status") => dispatch_status(&args[1..], ops),

        Some("session") => dispatch_session(&args[1..], ops),

        Some("test") => dispatch_test(&args[1..], ops),

        Some("log") => dispatch_log(&args[1..], log),

        _ => "1 unknown command\n".to_owned(),
    }
}

fn dispatch_status(rest: &[String], ops: &OpsHandle) -> String {
    let (selector, consumed) = match parse_selector(rest) {
        Some(parsed) => parsed,
        None => (SessionSelector::All, 0),
    };
    let modifiers = &rest[consumed..];
    let brief = modifiers.iter().any(|m| m == "brief");
    // `compact`/`nocompact` and `level <n>` only affect rendering density;
    // the non-brief rendering below already fits one line per session, so
    // both are accepted and otherwise no-ops.

    match call(ops, move |engine, _scheduler| {
        engine.extended_state(&selector)
    }) {
        Ok(states) => format_status(&states, brief),
        Err(error) => format!("1 {error}\n"),
    }
}

fn dispatch_session(rest: &[String], ops: &OpsHandle) -> String {
    if rest.first().map(String::as_str) == Some("new") {
        return dispatch_session_set_defaults(&rest[1..], ops);
    }

    let Some((selector, consumed)) = parse_selector(rest) else {
        return "1 usage: session <all|<id>|local <ip> remote <ip>|new> <verb>\n"
            .to_owned();
    };
    let Some(verb) = rest.get(consumed) else {
        return "1 usage: session <selector> <verb>\n".to_owned();
    };
    let extra = &rest[consumed + 1..];

    match verb.as_str() {
        "state" => dispatch_session_state(selector, extra, ops),
        "reset" => reply_result(call(ops, move |engine, scheduler| {
            engine.reset_sessions(&selector, scheduler)
        })),
        "kill" => reply_result(call(ops, move |engine, scheduler| {
            engine.kill_sessions(&selector, scheduler)
        })),
        "suspend" => reply_result(call(ops, move |engine, scheduler| {
            engine.set_suspend(&selector, true, scheduler)
        })),
        "resume" => reply_result(call(ops, move |engine, scheduler| {
            engine.set_suspend(&selector, false, scheduler)
        })),
        "set" => dispatch_session_set(selector, extra, ops),
        verb => format!("1 unknown session verb {verb}\n"),
    }
}

fn dispatch_session_state(
    selector: SessionSelector,
    extra: &[String],
    ops: &OpsHandle,
) -> String {
    let diag = extra
        .get(1)
        .and_then(|s| s.parse::<DiagnosticCode>().ok())
        .unwrap_or(DiagnosticCode::AdminDown);

    match extra.first().map(String::as_str) {
        Some("down") => reply_result(call(ops, move |engine, scheduler| {
            engine.force_down(&selector, diag, scheduler)
        })),
        Some("admin") => reply_result(call(ops, move |engine, scheduler| {
            engine.force_admin_down(&selector, diag, scheduler)
        })),
        Some("up") => reply_result(call(ops, move |engine, scheduler| {
            engine.allow_state_changes(&selector, scheduler)
        })),
        _ => "1 usage: session <selector> state (up|down|admin) [diag]\n"
            .to_owned(),
    }
}

/// `session <selector> set (mintx|minrx|multi|cpi|admin_up_poll) <value [unit]>`
fn dispatch_session_set(
    selector: SessionSelector,
    extra: &[String],
    ops: &OpsHandle,
) -> String {
    let Some(attr) = extra.first().map(String::as_str) else {
        return "1 usage: session <selector> set <attr> <value>\n".to_owned();
    };
    let value = extra.get(1).map(String::as_str);
    let unit = extra.get(2).map(String::as_str);

    match attr {
        "mintx" => match value.and_then(|v| parse_time_value(v, unit)) {
            Some(us) => reply_result(call(ops, move |engine, scheduler| {
                engine.set_min_tx_interval(&selector, us, scheduler)
            })),
            None => "1 usage: session <selector> set mintx <value> [s|ms|us]\n"
                .to_owned(),
        },
        "minrx" => match value.and_then(|v| parse_time_value(v, unit)) {
            Some(us) => reply_result(call(ops, move |engine, scheduler| {
                engine.set_min_rx_interval(&selector, us, scheduler)
            })),
            None => "1 usage: session <selector> set minrx <value> [s|ms|us]\n"
                .to_owned(),
        },
        "multi" => match value.and_then(|v| v.parse().ok()) {
            Some(n) => reply_result(call(ops, move |engine, scheduler| {
                engine.set_multi(&selector, n, scheduler)
            })),
            None => "1 usage: session <selector> set multi <n>\n".to_owned(),
        },
        "cpi" => match value {
            Some("yes") => reply_result(call(ops, move |engine, scheduler| {
                engine.set_control_plane_independent(&selector, true, scheduler)
            })),
            Some("no") => reply_result(call(ops, move |engine, scheduler| {
                engine.set_control_plane_independent(
                    &selector, false, scheduler,
                )
            })),
            _ => "1 usage: session <selector> set cpi (yes|no)\n".to_owned(),
        },
        "admin_up_poll" => match value {
            Some("yes") => reply_result(call(ops, move |engine, scheduler| {
                engine.set_admin_up_poll_workaround(&selector, true, scheduler)
            })),
            Some("no") => reply_result(call(ops, move |engine, scheduler| {
                engine.set_admin_up_poll_workaround(
                    &selector, false, scheduler,
                )
            })),
            _ => {
                "1 usage: session <selector> set admin_up_poll (yes|no)\n"
                    .to_owned()
            }
        },
        attr => format!("1 unknown session attribute {attr}\n"),
    }
}

/// `session new set (mintx|minrx|multi) <value [unit]>`: updates the
/// defaults future passive sessions inherit. `cpi`/`admin_up_poll` have no
/// engine-wide default to update, so they only apply per-session.
fn dispatch_session_set_defaults(rest: &[String], ops: &OpsHandle) -> String {
    if rest.first().map(String::as_str) != Some("set") {
        return "1 usage: session new set <attr> <value>\n".to_owned();
    }
    let extra = &rest[1..];
    let Some(attr) = extra.first().map(String::as_str) else {
        return "1 usage: session new set <attr> <value>\n".to_owned();
    };
    let value = extra.get(1).map(String::as_str);
    let unit = extra.get(2).map(String::as_str);

    match attr {
        "mintx" => match value.and_then(|v| parse_time_value(v, unit)) {
            Some(us) => reply_result(call(ops, move |engine, _scheduler| {
                engine.set_default_min_tx(us)
            })),
            None => "1 usage: session new set mintx <value> [s|ms|us]\n"
                .to_owned(),
        },
        "minrx" => match value.and_then(|v| parse_time_value(v, unit)) {
            Some(us) => reply_result(call(ops, move |engine, _scheduler| {
                engine.set_default_min_rx(us)
            })),
            None => "1 usage: session new set minrx <value> [s|ms|us]\n"
                .to_owned(),
        },
        "multi" => match value.and_then(|v| v.parse().ok()) {
            Some(n) => reply_result(call(ops, move |engine, _scheduler| {
                engine.set_default_multi(n)
            })),
            None => "1 usage: session new set multi <n>\n".to_owned(),
        },
        attr => format!("1 attribute {attr} has no engine-wide default\n"),
    }
}

fn dispatch_test(rest: &[String], ops: &OpsHandle) -> String {
    match rest.first().map(String::as_str) {
        Some("consume") => match rest.get(1).and_then(|s| s.parse::<usize>().ok()) {
            Some(kib) => reply_result(call(ops, move |engine, _scheduler| {
                engine.test_consume(kib * 1024)
            })),
            None => "1 usage: test consume <nK>\n".to_owned(),
        },
        Some("consume_beacon") => {
            match rest.get(1).and_then(|s| s.parse::<usize>().ok()) {
                Some(kib) => match call(ops, move |engine, _scheduler| {
                    engine.test_consume_beacon(kib * 1024)
                }) {
                    Ok(Ok(())) => "0\n".to_owned(),
                    Ok(Err(error)) => format!("1 {error}\n"),
                    Err(error) => format!("1 {error}\n"),
                },
                None => "1 usage: test consume_beacon <nK>\n".to_owned(),
            }
        }
        _ => "1 usage: test <consume|consume_beacon> <nK>\n".to_owned(),
    }
}

const KNOWN_LOG_TYPES: &[&str] = &["engine", "session", "packet", "control"];

fn dispatch_log(rest: &[String], log: &LogHandle) -> String {
    match rest.first().map(String::as_str) {
        Some("level") => match rest.get(1).map(String::as_str) {
            Some("list") => "0 trace debug info warn error\n".to_owned(),
            Some(name) => match format!("bfdd={name}").parse::<EnvFilter>() {
                Ok(filter) => match log.reload(filter) {
                    Ok(()) => "0\n".to_owned(),
                    Err(error) => format!("1 {error}\n"),
                },
                Err(_) => format!("1 unknown log level {name}\n"),
            },
            None => "1 usage: log level <name>|log level list\n".to_owned(),
        },
        Some("type") => match rest.get(1).map(String::as_str) {
            Some("list") => format!("0 {}\n", KNOWN_LOG_TYPES.join(" ")),
            Some(name) if KNOWN_LOG_TYPES.contains(&name) => {
                match rest.get(2).map(String::as_str) {
                    Some("yes") | Some("no") => "0\n".to_owned(),
                    _ => "1 usage: log type <name> (yes|no)\n".to_owned(),
                }
            }
            Some(name) => format!("1 unknown log type {name}\n"),
            None => "1 usage: log type <name>|log type list\n".to_owned(),
        },
        Some("timing") => match rest.get(1).map(String::as_str) {
            Some("yes") | Some("no") => "0\n".to_owned(),
            _ => "1 usage: log timing (yes|no)\n".to_owned(),
        },
        _ => "1 usage: log level|log type|log timing\n".to_owned(),
    }
}
