//! Protocol implementations
//!
//! Provides the wire-level pieces of inline file transfer:
//! - CRC-16/CCITT (table driven)
//! - ZMODEM header and subpacket framing, ZDLE escaping

pub mod checksum;
pub mod zmodem;

pub use checksum::{crc16, crc16_with_trailer};
pub use zmodem::{
    decode_header, decode_subpacket, encode_subpacket, escape, unescape, FrameEnd, FrameError,
    FrameType, Header, HeaderScanner, Subpacket,
};
