//! Storage primitives for connection data.

mod ring;

pub use ring::Ring;
