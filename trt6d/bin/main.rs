//! The transport relay translator daemon.
//!
//! Terminates IPv6 TCP connections arriving on a virtual interface and
//! relays them to the IPv4 destinations embedded in their translated
//! addresses. Call example:
//!
//! * `trt6d -i tun:trt0 -p fec0:0:0:ffff::/64 -d`
use log::{error, info};

use trt6::event::Scheduler;
use trt6::link::{self, DriverKind, LinkInterface};
use trt6::relay::TcpRelay;
use trt6::{sys, Relay};

use trt6d::config::Config;

fn main() {
    let config = Config::from_args();
    trt6d::init_logging(config.debug);

    let link = match link::create(&config.interface) {
        Ok(link) => link,
        Err(err) => {
            error!("unable to create interface {}: {}", config.interface, err);
            std::process::exit(1);
        }
    };

    info!("using prefix {}", config.prefix);

    if config.interface.kind == DriverKind::Tun && !config.no_ifconfig {
        trt6d::configure_interface(link.name(), &config.prefix);
    }

    let mut relay = Relay::new(link, TcpRelay::new());
    // One wildcard listener catches TCP for the whole translation prefix.
    relay.tcp.listen(None, 0);

    let mut sched = Scheduler::new();
    if relay.register_link_rx(&mut sched).is_none() {
        error!("interface {} has no pollable descriptor", config.interface);
        std::process::exit(1);
    }

    sys::install_interrupt_handler();
    info!("relaying on {}", config.interface);
    sched.run(&mut relay);
}
