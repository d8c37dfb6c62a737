//! CRC-16 used by ZMODEM headers and data subpackets
//!
//! CRC-16/CCITT with polynomial 0x1021, init 0x0000, no reflection
//! (the XMODEM parameterisation), computed through a 256-entry table
//! that is built at compile time.

/// Generator polynomial
const POLY: u16 = 0x1021;

/// Lookup table, one entry per leading byte value
const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Fold one byte into a running CRC
#[inline]
pub fn crc16_update(crc: u16, byte: u8) -> u16 {
    TABLE[((crc >> 8) as u8 ^ byte) as usize] ^ (crc << 8)
}

/// CRC-16 of a whole buffer
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0, |crc, &b| crc16_update(crc, b))
}

/// CRC-16 of a buffer followed by one extra byte
///
/// Data subpackets are checked over the payload plus the frame terminator.
pub fn crc16_with_trailer(data: &[u8], trailer: u8) -> u16 {
    crc16_update(crc16(data), trailer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_empty() {
        assert_eq!(crc16(b""), 0);
    }

    #[test]
    fn test_crc16_reference_vector() {
        // Test vector: "123456789" should give 0x31C3
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_table_matches_bitwise() {
        fn bitwise(data: &[u8]) -> u16 {
            let mut crc: u16 = 0;
            for &byte in data {
                crc ^= (byte as u16) << 8;
                for _ in 0..8 {
                    if crc & 0x8000 != 0 {
                        crc = (crc << 1) ^ 0x1021;
                    } else {
                        crc <<= 1;
                    }
                }
            }
            crc
        }

        let data: Vec<u8> = (0..=255u8).chain(0..=255u8).collect();
        assert_eq!(crc16(&data), bitwise(&data));
    }

    #[test]
    fn test_trailer_equals_appended_byte() {
        let payload = b"zmodem payload";
        let mut joined = payload.to_vec();
        joined.push(b'k');
        assert_eq!(crc16_with_trailer(payload, b'k'), crc16(&joined));
    }

    #[test]
    fn test_zrinit_header_crc() {
        // ZRINIT with CANFDX|CANOVIO|CANFC32 as sent by lrzsz: crc be50
        assert_eq!(crc16(&[0x01, 0x00, 0x00, 0x00, 0x23]), 0xBE50);
    }
}
