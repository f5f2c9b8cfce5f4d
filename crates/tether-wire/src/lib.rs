// tether-wire: wire-level primitives for the resumable transport.
//
// Everything here is banner- and frame-agnostic: a signed varint codec and a
// stream wrapper that can probe byte literals without consuming on mismatch.
// The transport proper lives in the `tether` crate.

pub mod sniff;
pub mod varint;

pub use sniff::SniffStream;
pub use varint::{MAX_VARINT_LEN, put_uvarint, put_varint, read_uvarint, read_varint};
