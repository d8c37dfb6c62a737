//! Terminal colors
//!
//! The 16 base/bright colors and the derived 256-color palette are fixed
//! tables computed at compile time.

use std::fmt;

/// 24-bit color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb {
    /// Red
    pub r: u8,
    /// Green
    pub g: u8,
    /// Blue
    pub b: u8,
}

impl Rgb {
    /// Create from components
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse `#rrggbb` (the leading `#` is optional)
    pub fn from_hex(text: &str) -> Option<Self> {
        let digits = text.strip_prefix('#').unwrap_or(text);
        if digits.len() != 6 {
            return None;
        }
        let mut rgb = [0u8; 3];
        hex::decode_to_slice(digits, &mut rgb).ok()?;
        Some(Self::new(rgb[0], rgb[1], rgb[2]))
    }

    /// Format as `#rrggbb`
    pub fn to_hex(self) -> String {
        format!("#{}", hex::encode([self.r, self.g, self.b]))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Base palette (SGR 30-37 / 40-47)
pub const BASE: [Rgb; 8] = [
    Rgb::new(0, 0, 0),       // Black
    Rgb::new(170, 0, 0),     // Red
    Rgb::new(0, 170, 0),     // Green
    Rgb::new(170, 85, 0),    // Yellow
    Rgb::new(0, 0, 170),     // Blue
    Rgb::new(170, 0, 170),   // Magenta
    Rgb::new(0, 170, 170),   // Cyan
    Rgb::new(170, 170, 170), // White
];

/// Bright palette (SGR 90-97 / 100-107)
pub const BRIGHT: [Rgb; 8] = [
    Rgb::new(85, 85, 85),    // Bright Black (Gray)
    Rgb::new(255, 85, 85),   // Bright Red
    Rgb::new(85, 255, 85),   // Bright Green
    Rgb::new(255, 255, 85),  // Bright Yellow
    Rgb::new(85, 85, 255),   // Bright Blue
    Rgb::new(255, 85, 255),  // Bright Magenta
    Rgb::new(85, 255, 255),  // Bright Cyan
    Rgb::new(255, 255, 255), // Bright White
];

/// Full 256-color palette (SGR 38;5;N / 48;5;N)
pub const PALETTE_256: [Rgb; 256] = build_palette();

const fn build_palette() -> [Rgb; 256] {
    let mut table = [Rgb::new(0, 0, 0); 256];
    let mut i = 0;
    while i < 256 {
        table[i] = if i < 8 {
            BASE[i]
        } else if i < 16 {
            BRIGHT[i - 8]
        } else if i < 232 {
            // 6x6x6 cube, each step is 51
            let n = i - 16;
            Rgb::new(
                ((n / 36) * 51) as u8,
                (((n / 6) % 6) * 51) as u8,
                ((n % 6) * 51) as u8,
            )
        } else {
            // 24-step grayscale ramp
            let gray = (8 + (i - 232) * 10) as u8;
            Rgb::new(gray, gray, gray)
        };
        i += 1;
    }
    table
}

/// Look up a 256-palette index
#[inline]
pub fn indexed(index: u8) -> Rgb {
    PALETTE_256[index as usize]
}
