//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Daemon configuration, built entirely from command-line arguments (no
//! configuration file): listen addresses, control transport ports, and
//! the session defaults new passive sessions inherit.

use bfdd_core::engine::{EngineConfig, SessionDefaults};
use bfdd_util::addr::Addr;
use clap::ArgMatches;

/// The control transport's default listening ports (primary and
/// alternate, both loopback-only).
pub const CONTROL_PORT_PRIMARY: u16 = 957;
pub const CONTROL_PORT_ALTERNATE: u16 = 958;

pub struct Config {
    pub listen_v4: Option<Addr>,
    pub listen_v6: Option<Addr>,
    pub control_port_primary: u16,
    pub control_port_alternate: u16,
    pub user: String,
    pub allow_all: bool,
    pub strict_ports: bool,
    pub gtsm: bool,
    pub session_defaults: SessionDefaults,
    pub log_filter: String,
}

impl Config {
    pub fn from_matches(matches: &ArgMatches) -> Config {
        let listen_v4 = match matches.is_present("no-ipv4") {
            true => None,
            false => Some("0.0.0.0".parse().unwrap()),
        };
        let listen_v6 = match matches.is_present("no-ipv6") {
            true => None,
            false => Some("::".parse().unwrap()),
        };

        let control_port_primary = matches
            .value_of("port")
            .map(|v| v.parse().expect("invalid --port"))
            .unwrap_or(CONTROL_PORT_PRIMARY);
        let control_port_alternate = matches
            .value_of("alternate-port")
            .map(|v| v.parse().expect("invalid --alternate-port"))
            .unwrap_or(CONTROL_PORT_ALTERNATE);

        let user = matches.value_of("user").unwrap_or("bfdd").to_owned();
        let allow_all = matches.is_present("allow-all");
        let strict_ports = !matches.is_present("no-strict-ports");
        let gtsm = !matches.is_present("no-gtsm");

        let session_defaults = SessionDefaults {
            desired_min_tx: matches
                .value_of("min-tx")
                .map(|v| v.parse().expect("invalid --min-tx"))
                .unwrap_or(1_000_000),
            required_min_rx: matches
                .value_of("min-rx")
                .map(|v| v.parse().expect("invalid --min-rx"))
                .unwrap_or(1_000_000),
            detect_mult: matches
                .value_of("detect-mult")
                .map(|v| v.parse().expect("invalid --detect-mult"))
                .unwrap_or(3),
        };

        let log_filter = matches
            .value_of("log-filter")
            .unwrap_or("bfdd=info")
            .to_owned();

        Config {
            listen_v4,
            listen_v6,
            control_port_primary,
            control_port_alternate,
            user,
            allow_all,
            strict_ports,
            gtsm,
            session_defaults,
            log_filter,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::new(self.listen_v4, self.listen_v6);
        config.allow_all = self.allow_all;
        config.strict_ports = self.strict_ports;
        config.gtsm = self.gtsm;
        config.defaults = self.session_defaults;
        config
    }
}
