//! Text style state carried between chunks

use super::color::{indexed, Rgb, BASE, BRIGHT};

/// Current rendition plus the configured defaults used by reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StyleState {
    /// Foreground color
    pub fg: Rgb,
    /// Background color
    pub bg: Rgb,
    /// Bold
    pub bold: bool,
    /// Italic
    pub italic: bool,
    /// Underline
    pub underline: bool,
    /// Reverse video is in effect (fg/bg swapped)
    pub reversed: bool,
    /// Configured default foreground
    pub default_fg: Rgb,
    /// Configured default background
    pub default_bg: Rgb,
}

impl StyleState {
    /// Fresh state using the given defaults
    pub fn new(default_fg: Rgb, default_bg: Rgb) -> Self {
        Self {
            fg: default_fg,
            bg: default_bg,
            bold: false,
            italic: false,
            underline: false,
            reversed: false,
            default_fg,
            default_bg,
        }
    }

    /// SGR 0
    pub fn reset(&mut self) {
        *self = Self::new(self.default_fg, self.default_bg);
    }

    /// SGR 7
    fn reverse_on(&mut self) {
        if !self.reversed {
            std::mem::swap(&mut self.fg, &mut self.bg);
            self.reversed = true;
        }
    }

    /// SGR 27
    fn reverse_off(&mut self) {
        if self.reversed {
            std::mem::swap(&mut self.fg, &mut self.bg);
            self.reversed = false;
        }
    }

    /// Apply an SGR parameter list left to right
    ///
    /// An empty list behaves as `[0]`. Unknown codes are skipped.
    pub fn apply_sgr(&mut self, params: &[u16]) {
        if params.is_empty() {
            self.reset();
            return;
        }

        let mut i = 0;
        while i < params.len() {
            match params[i] {
                0 => self.reset(),
                1 => self.bold = true,
                22 => self.bold = false,
                3 => self.italic = true,
                23 => self.italic = false,
                4 => self.underline = true,
                24 => self.underline = false,
                7 => self.reverse_on(),
                27 => self.reverse_off(),

                // Foreground colors
                code @ 30..=37 => self.fg = BASE[(code - 30) as usize],
                38 => match extended_color(&params[i + 1..]) {
                    Some((color, used)) => {
                        self.fg = color;
                        i += used;
                    }
                    None => {
                        tracing::debug!("Malformed extended foreground: {:?}", &params[i..]);
                        i = params.len();
                    }
                },
                39 => self.fg = self.default_fg,

                // Background colors
                code @ 40..=47 => self.bg = BASE[(code - 40) as usize],
                48 => match extended_color(&params[i + 1..]) {
                    Some((color, used)) => {
                        self.bg = color;
                        i += used;
                    }
                    None => {
                        tracing::debug!("Malformed extended background: {:?}", &params[i..]);
                        i = params.len();
                    }
                },
                49 => self.bg = self.default_bg,

                // Bright colors
                code @ 90..=97 => self.fg = BRIGHT[(code - 90) as usize],
                code @ 100..=107 => self.bg = BRIGHT[(code - 100) as usize],

                other => tracing::debug!("Ignoring SGR code {}", other),
            }
            i += 1;
        }
    }
}

impl Default for StyleState {
    fn default() -> Self {
        Self::new(Rgb::new(220, 220, 220), Rgb::new(30, 30, 30))
    }
}

/// Parse the tail of a 38/48 code
///
/// Returns the color and how many parameters it consumed.
fn extended_color(rest: &[u16]) -> Option<(Rgb, usize)> {
    match rest {
        [5, n, ..] => {
            let index = u8::try_from(*n).ok()?;
            Some((indexed(index), 2))
        }
        [2, r, g, b, ..] => {
            let c = |v: u16| u8::try_from(v).ok();
            Some((Rgb::new(c(*r)?, c(*g)?, c(*b)?), 4))
        }
        _ => None,
    }
}
