//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![warn(rust_2018_idioms)]

mod config;
mod control;

use bfdd_core::engine::Engine;
use bfdd_util::scheduler::Scheduler;
use capctl::caps;
use clap::{App, Arg};
use config::Config;
use nix::unistd::{Uid, User};
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter};

fn init_tracing(filter: &str) -> control::LogHandle {
    let env_filter = EnvFilter::try_new(filter)
        .unwrap_or_else(|_| EnvFilter::new("bfdd=info"));
    let (filter_layer, handle) = reload::Layer::new(env_filter);
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
    handle
}

/// Drops from root to `user`, keeping only the capability the engine needs
/// to bind the privileged BFD port and the control transport's ports.
fn privdrop(user: &str) -> nix::Result<()> {
    capctl::prctl::set_securebits(capctl::prctl::Secbits::KEEP_CAPS).unwrap();

    if let Some(user) = User::from_name(user)? {
        nix::unistd::setgroups(&[user.gid])?;
        nix::unistd::setresgid(user.gid, user.gid, user.gid)?;
        nix::unistd::setresuid(user.uid, user.uid, user.uid)?;
    } else {
        error!(name = %user, "failed to find user");
        std::process::exit(1);
    }

    let mut caps = caps::CapState::empty();
    caps.permitted.add(caps::Cap::NET_BIND_SERVICE);
    if let Err(error) = caps.set_current() {
        error!(%error, "failed to set permitted capabilities");
    }

    Ok(())
}

fn main() {
    let matches = App::new("bfdd")
        .version(clap::crate_version!())
        .about("Bidirectional Forwarding Detection daemon")
        .arg(Arg::with_name("no-ipv4").long("no-ipv4").help(
            "Disable the IPv4 listener",
        ))
        .arg(Arg::with_name("no-ipv6").long("no-ipv6").help(
            "Disable the IPv6 listener",
        ))
        .arg(
            Arg::with_name("port")
                .long("port")
                .value_name("port")
                .help("Primary control transport port (default 957)"),
        )
        .arg(
            Arg::with_name("alternate-port")
                .long("alternate-port")
                .value_name("port")
                .help("Alternate control transport port (default 958)"),
        )
        .arg(
            Arg::with_name("user")
                .long("user")
                .value_name("name")
                .help("Unprivileged user to run as (default bfdd)"),
        )
        .arg(Arg::with_name("allow-all").long("allow-all").help(
            "Accept passive sessions from any source address",
        ))
        .arg(
            Arg::with_name("no-strict-ports")
                .long("no-strict-ports")
                .help("Don't require the RFC 5881 ephemeral source port range"),
        )
        .arg(Arg::with_name("no-gtsm").long("no-gtsm").help(
            "Disable the Generalized TTL Security Mechanism check",
        ))
        .arg(
            Arg::with_name("min-tx")
                .long("min-tx")
                .value_name("microseconds")
                .help("Default desired min tx interval"),
        )
        .arg(
            Arg::with_name("min-rx")
                .long("min-rx")
                .value_name("microseconds")
                .help("Default required min rx interval"),
        )
        .arg(
            Arg::with_name("detect-mult")
                .long("detect-mult")
                .value_name("n")
                .help("Default detection multiplier"),
        )
        .arg(
            Arg::with_name("log-filter")
                .long("log-filter")
                .value_name("filter")
                .help("tracing-subscriber EnvFilter directive"),
        )
        .get_matches();

    let config = Config::from_matches(&matches);

    if !Uid::effective().is_root() {
        eprintln!("need privileged user");
        std::process::exit(1);
    }

    let log_handle = init_tracing(&config.log_filter);

    if let Err(error) = privdrop(&config.user) {
        error!(%error, "failed to drop root privileges");
        std::process::exit(1);
    }

    let mut scheduler = Scheduler::new();
    let engine = match Engine::new(config.engine_config(), &mut scheduler) {
        Ok(engine) => engine,
        Err(error) => {
            error!(%error, "failed to initialize engine");
            std::process::exit(1);
        }
    };

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    control::spawn(
        config.control_port_primary,
        engine.ops_handle(),
        log_handle.clone(),
    );
    control::spawn(
        config.control_port_alternate,
        engine.ops_handle(),
        log_handle,
    );

    info!("starting up");
    bfdd_core::engine::run(engine, scheduler);
}
