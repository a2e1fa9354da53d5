//! Command line configuration.
use structopt::StructOpt;

use trt6::link::LinkSpec;
use trt6::wire::ipv6::Cidr;

/// Runtime configuration of the relay daemon.
#[derive(Clone, StructOpt)]
pub struct Config {
    /// Interface to attach, as `driver:name` (e.g. `tun:trt0`).
    #[structopt(
        short = "i",
        long = "interface",
        default_value = "tun:trt0",
        parse(try_from_str)
    )]
    pub interface: LinkSpec,

    /// Translation prefix routed towards the relay.
    #[structopt(
        short = "p",
        long = "prefix",
        default_value = "fec0:0:0:ffff::/64",
        parse(try_from_str)
    )]
    pub prefix: Cidr,

    /// Increase verbosity; repeat for packet level traces.
    #[structopt(short = "d", long = "debug", parse(from_occurrences))]
    pub debug: u64,

    /// Do not run ip(8) to bring the interface up.
    #[structopt(long = "no-ifconfig")]
    pub no_ifconfig: bool,
}

impl Config {
    /// Parse the process arguments.
    pub fn from_args() -> Self {
        StructOpt::from_args()
    }
}
