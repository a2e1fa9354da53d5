//! Support code for the relay daemon binary.
use log::{info, warn};
use std::process::Command;

use trt6::wire::ipv6::Cidr;

pub mod config;

/// Initialise logging from the repeated `-d` flag.
///
/// `RUST_LOG` still takes precedence when set, so a deployment can filter by
/// module without touching the command line.
pub fn init_logging(debug: u64) {
    let default = match debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

/// Bring the interface up and route the translation prefix to it.
///
/// Mirrors what an administrator would configure by hand: link up, a
/// link-local address for the relay side, and the prefix routed through the
/// device. Failures are logged but not fatal — the interface may already be
/// configured.
pub fn configure_interface(ifname: &str, prefix: &Cidr) {
    let prefix = prefix.to_string();
    let commands: [&[&str]; 3] = [
        &["link", "set", ifname, "up"],
        &["addr", "add", "fe80::1/64", "dev", ifname],
        &["route", "add", &prefix, "dev", ifname, "via", "fe80::5"],
    ];

    for args in &commands {
        info!("command: ip {}", args.join(" "));
        match Command::new("ip").args(*args).status() {
            Ok(status) if status.success() => (),
            Ok(status) => warn!("ip exited with {}", status),
            Err(err) => warn!("could not run ip: {}", err),
        }
    }
}
