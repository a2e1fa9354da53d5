/*! Low-level packet access and construction.

The `wire` module deals with the packet representation. Each format provides
two levels of functionality: octet-level field accessors in the `Packet`
wrapper types, operating on any byte container, and the compact `Repr`
structs that can be created by parsing a packet and emitted back into a
buffer.

The relay only speaks two formats on the virtual interface: the fixed
40-byte IPv6 base header and the TCP header with at most the MSS option.
Extension headers are not interpreted; a datagram whose next-header value is
not understood is dropped by the demultiplexer.
*/

pub mod ipv6;
pub mod tcp;

mod field {
    pub type Field = core::ops::Range<usize>;
}

pub use ipv6::{Address, Cidr, Protocol};
pub use tcp::SeqNumber;

/// The error type for parsing and emission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// The buffer is too short to contain the claimed packet.
    Truncated,
    /// A header field has a value that violates the format.
    Malformed,
}

/// The result type for parsing and emission.
pub type Result<T> = core::result::Result<T, Error>;

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Error::Truncated => write!(f, "truncated packet"),
            Error::Malformed => write!(f, "malformed header"),
        }
    }
}
