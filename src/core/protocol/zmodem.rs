//! ZMODEM framing
//!
//! Byte-level pieces of the ZMODEM wire format used by the upload engine:
//! - ZDLE escaping and unescaping
//! - Binary (`ZBIN`) and hex (`ZHEX`) headers with CRC-16
//! - Data subpackets closed by a ZDLE terminator and CRC-16
//! - Incremental header scanning of the receiver's replies
//!
//! Constants keep the names used by the reference `zmodem.h`.

use super::checksum::{crc16, crc16_with_trailer};
use std::fmt;
use thiserror::Error;

/// Padding character that begins every header
pub const ZPAD: u8 = b'*';
/// ZMODEM escape (Ctrl-X, same value as CAN)
pub const ZDLE: u8 = 0x18;
/// Escaped ZDLE as transmitted
pub const ZDLEE: u8 = 0x58;
/// Binary header indicator (CRC-16)
pub const ZBIN: u8 = b'A';
/// Hex header indicator
pub const ZHEX: u8 = b'B';

/// Cancel control byte
pub const CAN: u8 = 0x18;
/// XON, appended to most hex headers
pub const XON: u8 = 0x11;

/// ZF0 file option: binary transfer, inhibit conversion
pub const ZCBIN: u8 = 1;

/// Header frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Request receive init
    RqInit = 0,
    /// Receive init
    RInit = 1,
    /// Send init sequence
    SInit = 2,
    /// Acknowledge
    Ack = 3,
    /// File name from sender
    File = 4,
    /// Skip this file
    Skip = 5,
    /// Last packet was garbled
    Nak = 6,
    /// Abort batch transfers
    Abort = 7,
    /// Finish session
    Fin = 8,
    /// Resume data transmission at this position
    RPos = 9,
    /// Data packet(s) follow
    Data = 10,
    /// End of file
    Eof = 11,
    /// Fatal read or write error detected
    FErr = 12,
    /// Request for file CRC
    Crc = 13,
    /// Receiver's challenge
    Challenge = 14,
    /// Request is complete
    Compl = 15,
    /// Other end cancelled with CAN*5
    Can = 16,
    /// Request for free bytes on filesystem
    FreeCnt = 17,
    /// Command from sending program
    Command = 18,
}

impl FrameType {
    /// Map a wire byte to a frame type
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::RqInit,
            1 => Self::RInit,
            2 => Self::SInit,
            3 => Self::Ack,
            4 => Self::File,
            5 => Self::Skip,
            6 => Self::Nak,
            7 => Self::Abort,
            8 => Self::Fin,
            9 => Self::RPos,
            10 => Self::Data,
            11 => Self::Eof,
            12 => Self::FErr,
            13 => Self::Crc,
            14 => Self::Challenge,
            15 => Self::Compl,
            16 => Self::Can,
            17 => Self::FreeCnt,
            18 => Self::Command,
            _ => return None,
        })
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RqInit => "ZRQINIT",
            Self::RInit => "ZRINIT",
            Self::SInit => "ZSINIT",
            Self::Ack => "ZACK",
            Self::File => "ZFILE",
            Self::Skip => "ZSKIP",
            Self::Nak => "ZNAK",
            Self::Abort => "ZABORT",
            Self::Fin => "ZFIN",
            Self::RPos => "ZRPOS",
            Self::Data => "ZDATA",
            Self::Eof => "ZEOF",
            Self::FErr => "ZFERR",
            Self::Crc => "ZCRC",
            Self::Challenge => "ZCHALLENGE",
            Self::Compl => "ZCOMPL",
            Self::Can => "ZCAN",
            Self::FreeCnt => "ZFREECNT",
            Self::Command => "ZCOMMAND",
        };
        f.write_str(name)
    }
}

/// ZDLE sequence closing a data subpacket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEnd {
    /// ZCRCE: frame ends, header follows
    End,
    /// ZCRCG: frame continues nonstop
    Go,
    /// ZCRCQ: frame continues, ZACK expected
    Quick,
    /// ZCRCW: frame ends, ZACK expected
    Wait,
}

impl FrameEnd {
    /// Wire byte following ZDLE
    pub fn byte(self) -> u8 {
        match self {
            Self::End => b'h',
            Self::Go => b'i',
            Self::Quick => b'j',
            Self::Wait => b'k',
        }
    }

    /// Map a wire byte back to a terminator
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'h' => Some(Self::End),
            b'i' => Some(Self::Go),
            b'j' => Some(Self::Quick),
            b'k' => Some(Self::Wait),
            _ => None,
        }
    }
}

/// Framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer does not start with ZPAD ZDLE
    #[error("not a ZMODEM header")]
    NotAHeader,

    /// Header encoding other than ZBIN / ZHEX
    #[error("unsupported header encoding: {0:#04x}")]
    UnsupportedEncoding(u8),

    /// Hex header carried a non-hex digit
    #[error("malformed hex header")]
    BadHex,

    /// Frame type outside the known table
    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),

    /// CRC did not match the frame contents
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// CRC computed locally
        expected: u16,
        /// CRC carried by the frame
        actual: u16,
    },

    /// ZDLE followed by a byte that is neither an escape nor a terminator
    #[error("invalid ZDLE sequence: {0:#04x}")]
    BadEscape(u8),
}

/// A ZMODEM header: frame type plus four position/flag bytes
///
/// The four bytes are carried as a little-endian position. Flag-carrying
/// headers (ZRINIT, ZFILE) keep ZF0 in the most significant byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame type
    pub kind: FrameType,
    /// Position (or flags) as a little-endian u32
    pub position: u32,
}

impl Header {
    /// Create a header at a position
    pub fn new(kind: FrameType, position: u32) -> Self {
        Self { kind, position }
    }

    /// Create a header from ZF0..ZF3 flag bytes
    pub fn with_flags(kind: FrameType, zf0: u8, zf1: u8, zf2: u8, zf3: u8) -> Self {
        Self {
            kind,
            position: u32::from_le_bytes([zf3, zf2, zf1, zf0]),
        }
    }

    /// ZF0 flag byte
    pub fn zf0(&self) -> u8 {
        self.position.to_le_bytes()[3]
    }

    /// Type byte followed by the four position bytes
    fn body(&self) -> [u8; 5] {
        let p = self.position.to_le_bytes();
        [self.kind as u8, p[0], p[1], p[2], p[3]]
    }

    /// Encode as a binary header: ZPAD ZDLE ZBIN, then the escaped body and CRC
    pub fn encode_binary(&self) -> Vec<u8> {
        let body = self.body();
        let crc = crc16(&body);
        let mut out = Vec::with_capacity(3 + 2 * 7);
        out.extend_from_slice(&[ZPAD, ZDLE, ZBIN]);
        escape_into(&mut out, &body);
        escape_into(&mut out, &crc.to_be_bytes());
        out
    }

    /// Encode as a hex header: ZPAD ZPAD ZDLE ZHEX, lowercase hex body and CRC
    pub fn encode_hex(&self) -> Vec<u8> {
        let body = self.body();
        let crc = crc16(&body);
        let mut out = Vec::with_capacity(4 + 14 + 3);
        out.extend_from_slice(&[ZPAD, ZPAD, ZDLE, ZHEX]);
        for &byte in body.iter().chain(crc.to_be_bytes().iter()) {
            out.extend_from_slice(&byte_to_hex(byte));
        }
        out.push(b'\r');
        out.push(b'\n' | 0x80);
        if !matches!(self.kind, FrameType::Fin | FrameType::Ack) {
            out.push(XON);
        }
        out
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.position)
    }
}

/// Convert byte to lowercase hex digits
fn byte_to_hex(b: u8) -> [u8; 2] {
    const HEX: &[u8] = b"0123456789abcdef";
    [HEX[(b >> 4) as usize], HEX[(b & 0x0f) as usize]]
}

/// True for bytes that must travel as ZDLE + (byte ^ 0x40)
#[inline]
fn needs_escape(byte: u8) -> bool {
    byte & 0x60 == 0
}

/// Append the ZDLE-escaped form of `data` to `out`
pub fn escape_into(out: &mut Vec<u8>, data: &[u8]) {
    for &byte in data {
        if byte == ZDLE {
            out.push(ZDLE);
            out.push(ZDLEE);
        } else if needs_escape(byte) {
            out.push(ZDLE);
            out.push(byte ^ 0x40);
        } else {
            out.push(byte);
        }
    }
}

/// ZDLE-escape a buffer
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 4);
    escape_into(&mut out, data);
    out
}

/// Reverse of [`escape`]
///
/// A dangling ZDLE at the end of the input is dropped.
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&byte) = iter.next() {
        if byte == ZDLE {
            match iter.next() {
                Some(&ZDLEE) => out.push(ZDLE),
                Some(&next) => out.push(next ^ 0x40),
                None => break,
            }
        } else {
            out.push(byte);
        }
    }
    out
}

/// Encode a data subpacket: escaped payload, ZDLE + terminator, escaped CRC
///
/// The CRC covers the unescaped payload followed by the terminator byte and is
/// sent big-endian.
pub fn encode_subpacket(payload: &[u8], end: FrameEnd) -> Vec<u8> {
    let terminator = end.byte();
    let crc = crc16_with_trailer(payload, terminator);
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 4 + 6);
    escape_into(&mut out, payload);
    out.push(ZDLE);
    out.push(terminator);
    escape_into(&mut out, &crc.to_be_bytes());
    out
}

/// ZFILE subpacket payload: `name NUL "size mtime 0 0 0" NUL`
///
/// Modification time is octal seconds since the epoch.
pub fn file_info(name: &str, size: u64, mtime: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 32);
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out.extend_from_slice(format!("{} {:o} 0 0 0", size, mtime).as_bytes());
    out.push(0);
    out
}

/// A decoded data subpacket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subpacket {
    /// Unescaped payload
    pub payload: Vec<u8>,
    /// Terminator that closed it
    pub end: FrameEnd,
}

/// Read one escaped byte; `Ok(None)` means the buffer ran out
fn read_escaped(buf: &[u8], pos: &mut usize) -> Result<Option<u8>, FrameError> {
    let Some(&byte) = buf.get(*pos) else {
        return Ok(None);
    };
    if byte != ZDLE {
        *pos += 1;
        return Ok(Some(byte));
    }
    let Some(&next) = buf.get(*pos + 1) else {
        return Ok(None);
    };
    *pos += 2;
    match next {
        ZDLEE => Ok(Some(ZDLE)),
        n if n & 0x60 == 0x40 => Ok(Some(n ^ 0x40)),
        n => Err(FrameError::BadEscape(n)),
    }
}

/// Decode a subpacket at the start of `buf`
///
/// Returns `Ok(None)` while the subpacket is still incomplete, otherwise the
/// subpacket and the number of bytes consumed.
pub fn decode_subpacket(buf: &[u8]) -> Result<Option<(Subpacket, usize)>, FrameError> {
    let mut payload = Vec::new();
    let mut pos = 0;
    let end = loop {
        let Some(&byte) = buf.get(pos) else {
            return Ok(None);
        };
        if byte == ZDLE {
            let Some(&next) = buf.get(pos + 1) else {
                return Ok(None);
            };
            if let Some(end) = FrameEnd::from_byte(next) {
                pos += 2;
                break end;
            }
        }
        match read_escaped(buf, &mut pos)? {
            Some(b) => payload.push(b),
            None => return Ok(None),
        }
    };

    let mut crc_bytes = [0u8; 2];
    for slot in &mut crc_bytes {
        match read_escaped(buf, &mut pos)? {
            Some(b) => *slot = b,
            None => return Ok(None),
        }
    }
    let actual = u16::from_be_bytes(crc_bytes);
    let expected = crc16_with_trailer(&payload, end.byte());
    if actual != expected {
        return Err(FrameError::CrcMismatch { expected, actual });
    }
    Ok(Some((Subpacket { payload, end }, pos)))
}

fn header_from_raw(raw: &[u8; 7]) -> Result<Header, FrameError> {
    let actual = u16::from_be_bytes([raw[5], raw[6]]);
    let expected = crc16(&raw[..5]);
    if actual != expected {
        return Err(FrameError::CrcMismatch { expected, actual });
    }
    let kind = FrameType::from_u8(raw[0]).ok_or(FrameError::UnknownFrameType(raw[0]))?;
    Ok(Header::new(
        kind,
        u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]),
    ))
}

/// Decode a binary or hex header at the start of `buf`
///
/// `buf` must begin with at least one ZPAD. Returns `Ok(None)` while the
/// header is still incomplete, otherwise the header and bytes consumed
/// (including any CR/LF/XON trailing a hex header).
pub fn decode_header(buf: &[u8]) -> Result<Option<(Header, usize)>, FrameError> {
    let mut pos = buf.iter().take_while(|&&b| b == ZPAD).count();
    if pos == 0 {
        return Err(FrameError::NotAHeader);
    }
    let Some(&lead) = buf.get(pos) else {
        return Ok(None);
    };
    if lead != ZDLE {
        return Err(FrameError::NotAHeader);
    }
    let Some(&encoding) = buf.get(pos + 1) else {
        return Ok(None);
    };
    pos += 2;

    let mut raw = [0u8; 7];
    match encoding {
        ZBIN => {
            for slot in &mut raw {
                match read_escaped(buf, &mut pos)? {
                    Some(b) => *slot = b,
                    None => return Ok(None),
                }
            }
        }
        ZHEX => {
            let Some(digits) = buf.get(pos..pos + 14) else {
                return Ok(None);
            };
            hex::decode_to_slice(digits, &mut raw).map_err(|_| FrameError::BadHex)?;
            pos += 14;
            while let Some(&b) = buf.get(pos) {
                if matches!(b, b'\r' | b'\n' | 0x8d | 0x8a | XON) {
                    pos += 1;
                } else {
                    break;
                }
            }
        }
        other => return Err(FrameError::UnsupportedEncoding(other)),
    }

    header_from_raw(&raw).map(|header| Some((header, pos)))
}

/// Incremental header extraction from the receiver's byte stream
///
/// Bytes that are not part of a header are discarded. The pending buffer is
/// bounded so line noise cannot grow it without limit.
#[derive(Debug)]
pub struct HeaderScanner {
    pending: Vec<u8>,
    limit: usize,
}

impl HeaderScanner {
    /// Create a scanner that keeps at most `limit` pending bytes
    pub fn new(limit: usize) -> Self {
        Self {
            pending: Vec::with_capacity(limit),
            limit,
        }
    }

    /// Drop any partial header
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Feed bytes and return every complete, CRC-valid header found
    pub fn push(&mut self, data: &[u8]) -> Vec<Header> {
        self.pending.extend_from_slice(data);
        let mut headers = Vec::new();

        loop {
            let Some(start) = self.pending.iter().position(|&b| b == ZPAD) else {
                self.pending.clear();
                break;
            };
            match decode_header(&self.pending[start..]) {
                Ok(Some((header, used))) => {
                    headers.push(header);
                    self.pending.drain(..start + used);
                }
                Ok(None) => {
                    self.pending.drain(..start);
                    break;
                }
                Err(e) => {
                    tracing::trace!("Skipping malformed header: {}", e);
                    self.pending.drain(..=start);
                }
            }
        }

        if self.pending.len() > self.limit {
            let excess = self.pending.len() - self.limit;
            self.pending.drain(..excess);
        }
        headers
    }
}

impl Default for HeaderScanner {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_rules() {
        assert_eq!(escape(&[ZDLE]), vec![ZDLE, ZDLEE]);
        assert_eq!(escape(&[0x0D]), vec![ZDLE, 0x4D]);
        assert_eq!(escape(&[0x91]), vec![ZDLE, 0xD1]);
        assert_eq!(escape(b"ABC~"), b"ABC~".to_vec());
        assert_eq!(escape(&[0x7F, 0xFF]), vec![0x7F, 0xFF]);
    }

    #[test]
    fn test_escape_unescape_every_byte() {
        let all: Vec<u8> = (0..=255u8).collect();
        let escaped = escape(&all);
        assert_eq!(unescape(&escaped), all);
        // Escaped output never carries a raw control byte other than ZDLE
        assert!(escaped.iter().all(|&b| b == ZDLE || b & 0x60 != 0));
    }

    #[test]
    fn test_escape_unescape_pseudorandom() {
        let mut seed: u32 = 0x1234_5678;
        for len in [0usize, 1, 7, 64, 1000] {
            let data: Vec<u8> = (0..len)
                .map(|_| {
                    seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
                    (seed >> 16) as u8
                })
                .collect();
            assert_eq!(unescape(&escape(&data)), data);
        }
    }

    #[test]
    fn test_binary_header_layout() {
        let header = Header::new(FrameType::Data, 0x0000_0400);
        let bytes = header.encode_binary();
        assert_eq!(&bytes[..3], &[ZPAD, ZDLE, ZBIN]);
        // type 10 is a control byte and travels escaped
        assert_eq!(&bytes[3..5], &[ZDLE, 10 ^ 0x40]);

        let raw = unescape(&bytes[3..]);
        assert_eq!(&raw[..5], &[10, 0x00, 0x04, 0x00, 0x00]);
        let crc = crc16(&raw[..5]);
        assert_eq!(&raw[5..], &crc.to_be_bytes());
    }

    #[test]
    fn test_header_decode_binary() {
        let header = Header::new(FrameType::Eof, 123_456);
        let bytes = header.encode_binary();
        let (decoded, used) = decode_header(&bytes).unwrap().unwrap();
        assert_eq!(decoded, header);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn test_header_decode_hex() {
        let header = Header::new(FrameType::RPos, 2048);
        let bytes = header.encode_hex();
        assert_eq!(&bytes[..4], b"**\x18B");
        let (decoded, used) = decode_header(&bytes).unwrap().unwrap();
        assert_eq!(decoded, header);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn test_lrzsz_zrinit() {
        let wire = b"**\x18B0100000023be50\r\x8a\x11";
        let (header, used) = decode_header(wire).unwrap().unwrap();
        assert_eq!(header.kind, FrameType::RInit);
        assert_eq!(header.zf0(), 0x23);
        assert_eq!(used, wire.len());
    }

    #[test]
    fn test_header_incomplete_and_corrupt() {
        let bytes = Header::new(FrameType::Ack, 7).encode_hex();
        assert_eq!(decode_header(&bytes[..10]).unwrap(), None);

        let mut corrupt = bytes.clone();
        corrupt[6] = if corrupt[6] == b'0' { b'1' } else { b'0' };
        assert!(matches!(
            decode_header(&corrupt),
            Err(FrameError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_fin_hex_has_no_xon() {
        let bytes = Header::new(FrameType::Fin, 0).encode_hex();
        assert_eq!(bytes.last(), Some(&0x8a));
    }

    #[test]
    fn test_subpacket_roundtrip_with_controls() {
        let payload = [0x00, 0x18, 0x11, 0x13, b'x', 0x8d, 0xff];
        let wire = encode_subpacket(&payload, FrameEnd::Wait);
        let (sub, used) = decode_subpacket(&wire).unwrap().unwrap();
        assert_eq!(sub.payload, payload);
        assert_eq!(sub.end, FrameEnd::Wait);
        assert_eq!(used, wire.len());
    }

    #[test]
    fn test_subpacket_crc_checked() {
        let mut wire = encode_subpacket(b"hello", FrameEnd::End);
        wire[0] = b'j';
        assert!(matches!(
            decode_subpacket(&wire),
            Err(FrameError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_file_info_payload() {
        let info = file_info("a.txt", 300, 0o1234);
        assert_eq!(info, b"a.txt\x00300 1234 0 0 0\x00".to_vec());
    }

    #[test]
    fn test_scanner_split_and_noise() {
        let mut scanner = HeaderScanner::default();
        let wire = Header::new(FrameType::RPos, 0).encode_hex();
        let mut stream = b"noise*garbage".to_vec();
        stream.extend_from_slice(&wire);

        let (a, b) = stream.split_at(stream.len() - 5);
        assert!(scanner.push(a).is_empty());
        let headers = scanner.push(b);
        assert_eq!(headers, vec![Header::new(FrameType::RPos, 0)]);
    }

    #[test]
    fn test_scanner_bounded() {
        let mut scanner = HeaderScanner::new(16);
        let mut junk = vec![ZPAD, ZDLE, ZBIN];
        junk.extend(std::iter::repeat(ZDLE).take(3));
        for _ in 0..100 {
            scanner.push(&junk);
            assert!(scanner.pending.len() <= 16);
        }
    }
}
