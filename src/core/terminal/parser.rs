//! ANSI escape sequence tokenizer
//!
//! Splits a chunk of shell output into text, control bytes and escape
//! sequences (CSI, OSC, plain ESC). Each call to [`Tokenizer::tokenize`]
//! starts from the ground state; a sequence still open at the end of the
//! chunk is reported as [`Token::Incomplete`] and dropped.

/// Tokenizer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ground,
    Escape,
    EscapeIntermediate,
    CsiEntry,
    CsiParam,
    CsiIntermediate,
    CsiIgnore,
    OscString,
    OscEscape,
}

/// One lexical unit of shell output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Run of printable bytes (may contain UTF-8 sequences)
    Text(Vec<u8>),
    /// C0 control byte other than ESC
    Control(u8),
    /// Control Sequence Introducer sequence
    Csi {
        /// Private marker (`?`, `>`, `<`, `=`)
        private: Option<u8>,
        /// Numeric parameters
        params: Vec<u16>,
        /// Intermediate bytes
        intermediates: Vec<u8>,
        /// Final byte
        action: u8,
    },
    /// Operating System Command, `;`-separated fields
    Osc(Vec<Vec<u8>>),
    /// Plain escape sequence (charset select, keypad mode, ...)
    Esc {
        /// Intermediate bytes
        intermediates: Vec<u8>,
        /// Final byte
        action: u8,
    },
    /// Escape sequence cut off by the end of the chunk
    Incomplete(Vec<u8>),
}

/// Escape sequence category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Select Graphic Rendition
    Sgr,
    /// Cursor movement, erase display / line
    CursorOrClear,
    /// DEC private mode set / reset
    PrivateMode,
    /// Window title
    OscTitle,
    /// G0..G3 character set designation
    CharsetSelect,
    /// Anything else (keypad modes included)
    Other,
}

impl Token {
    /// Category of an escape token; `None` for text and control bytes
    pub fn category(&self) -> Option<Category> {
        match self {
            Token::Text(_) | Token::Control(_) | Token::Incomplete(_) => None,
            Token::Csi {
                private: Some(b'?'),
                action: b'h' | b'l',
                ..
            } => Some(Category::PrivateMode),
            Token::Csi {
                private: None,
                intermediates,
                action,
                ..
            } if intermediates.is_empty() => Some(match action {
                b'm' => Category::Sgr,
                b'A'..=b'H' | b'J' | b'K' | b'f' => Category::CursorOrClear,
                _ => Category::Other,
            }),
            Token::Csi { .. } => Some(Category::Other),
            Token::Osc(fields) => match fields.first().map(Vec::as_slice) {
                Some(b"0" | b"1" | b"2") => Some(Category::OscTitle),
                _ => Some(Category::Other),
            },
            Token::Esc { intermediates, .. }
                if matches!(intermediates.first(), Some(b'(' | b')' | b'*' | b'+')) =>
            {
                Some(Category::CharsetSelect)
            }
            Token::Esc { .. } => Some(Category::Other),
        }
    }
}

/// ANSI tokenizer
#[derive(Debug)]
pub struct Tokenizer {
    state: State,
    text: Vec<u8>,
    raw: Vec<u8>,
    private: Option<u8>,
    intermediates: Vec<u8>,
    params: Vec<u16>,
    current_param: Option<u16>,
    osc_fields: Vec<Vec<u8>>,
    osc_current: Vec<u8>,
    /// Second token produced by a single byte
    follow: Option<Token>,
}

impl Tokenizer {
    /// Create a new tokenizer
    pub fn new() -> Self {
        Self {
            state: State::Ground,
            text: Vec::new(),
            raw: Vec::new(),
            private: None,
            intermediates: Vec::new(),
            params: Vec::new(),
            current_param: None,
            osc_fields: Vec::new(),
            osc_current: Vec::new(),
            follow: None,
        }
    }

    /// Return to ground, dropping any partial sequence
    fn reset(&mut self) {
        self.state = State::Ground;
        self.raw.clear();
        self.private = None;
        self.intermediates.clear();
        self.params.clear();
        self.current_param = None;
        self.osc_fields.clear();
        self.osc_current.clear();
    }

    /// Tokenize one chunk
    pub fn tokenize(&mut self, data: &[u8]) -> Vec<Token> {
        self.reset();
        self.text.clear();
        let mut tokens = Vec::new();

        for &byte in data {
            if self.state != State::Ground {
                self.raw.push(byte);
            }
            if let Some(token) = self.advance(byte) {
                self.flush_text(&mut tokens);
                tokens.push(token);
                tokens.extend(self.follow.take());
            }
        }

        self.flush_text(&mut tokens);
        if self.state != State::Ground {
            tokens.push(Token::Incomplete(std::mem::take(&mut self.raw)));
            self.reset();
        }
        tokens
    }

    fn flush_text(&mut self, tokens: &mut Vec<Token>) {
        if !self.text.is_empty() {
            tokens.push(Token::Text(std::mem::take(&mut self.text)));
        }
    }

    fn enter_escape(&mut self) {
        self.reset();
        self.raw.push(0x1B);
        self.state = State::Escape;
    }

    /// Advance with a single byte
    fn advance(&mut self, byte: u8) -> Option<Token> {
        match self.state {
            State::Ground => self.ground(byte),
            State::Escape => self.escape(byte),
            State::EscapeIntermediate => self.escape_intermediate(byte),
            State::CsiEntry | State::CsiParam => self.csi_param(byte),
            State::CsiIntermediate => self.csi_intermediate(byte),
            State::CsiIgnore => self.csi_ignore(byte),
            State::OscString => self.osc_string(byte),
            State::OscEscape => self.osc_escape(byte),
        }
    }

    fn ground(&mut self, byte: u8) -> Option<Token> {
        match byte {
            0x1B => {
                self.enter_escape();
                None
            }
            0x00..=0x1F => Some(Token::Control(byte)),
            // DEL
            0x7F => None,
            _ => {
                self.text.push(byte);
                None
            }
        }
    }

    fn escape(&mut self, byte: u8) -> Option<Token> {
        match byte {
            b'[' => {
                self.state = State::CsiEntry;
                None
            }
            b']' => {
                self.state = State::OscString;
                None
            }
            0x20..=0x2F => {
                self.intermediates.push(byte);
                self.state = State::EscapeIntermediate;
                None
            }
            0x30..=0x7E => {
                let token = Token::Esc {
                    intermediates: Vec::new(),
                    action: byte,
                };
                self.reset();
                Some(token)
            }
            0x1B => {
                self.enter_escape();
                None
            }
            0x00..=0x1F => Some(Token::Control(byte)),
            _ => {
                self.reset();
                None
            }
        }
    }

    fn escape_intermediate(&mut self, byte: u8) -> Option<Token> {
        match byte {
            0x20..=0x2F => {
                self.intermediates.push(byte);
                None
            }
            0x30..=0x7E => {
                let token = Token::Esc {
                    intermediates: std::mem::take(&mut self.intermediates),
                    action: byte,
                };
                self.reset();
                Some(token)
            }
            0x1B => {
                self.enter_escape();
                None
            }
            0x00..=0x1F => Some(Token::Control(byte)),
            _ => {
                self.reset();
                None
            }
        }
    }

    fn dispatch_csi(&mut self, action: u8) -> Token {
        if let Some(param) = self.current_param.take() {
            self.params.push(param);
        }
        let token = Token::Csi {
            private: self.private,
            params: std::mem::take(&mut self.params),
            intermediates: std::mem::take(&mut self.intermediates),
            action,
        };
        self.reset();
        token
    }

    fn csi_param(&mut self, byte: u8) -> Option<Token> {
        match byte {
            b'0'..=b'9' => {
                let digit = (byte - b'0') as u16;
                self.current_param = Some(
                    self.current_param
                        .unwrap_or(0)
                        .saturating_mul(10)
                        .saturating_add(digit),
                );
                self.state = State::CsiParam;
                None
            }
            // Separators; `:` sub-parameters are flattened
            b';' | b':' => {
                self.params.push(self.current_param.take().unwrap_or(0));
                self.state = State::CsiParam;
                None
            }
            b'?' | b'>' | b'<' | b'=' if self.state == State::CsiEntry => {
                self.private = Some(byte);
                None
            }
            0x3C..=0x3F => {
                self.state = State::CsiIgnore;
                None
            }
            0x20..=0x2F => {
                if let Some(param) = self.current_param.take() {
                    self.params.push(param);
                }
                self.intermediates.push(byte);
                self.state = State::CsiIntermediate;
                None
            }
            0x40..=0x7E => Some(self.dispatch_csi(byte)),
            0x1B => {
                self.enter_escape();
                None
            }
            0x00..=0x1F => Some(Token::Control(byte)),
            _ => {
                self.reset();
                None
            }
        }
    }

    fn csi_intermediate(&mut self, byte: u8) -> Option<Token> {
        match byte {
            0x20..=0x2F => {
                self.intermediates.push(byte);
                None
            }
            0x40..=0x7E => Some(self.dispatch_csi(byte)),
            0x30..=0x3F => {
                self.state = State::CsiIgnore;
                None
            }
            0x1B => {
                self.enter_escape();
                None
            }
            0x00..=0x1F => Some(Token::Control(byte)),
            _ => {
                self.reset();
                None
            }
        }
    }

    fn csi_ignore(&mut self, byte: u8) -> Option<Token> {
        match byte {
            0x40..=0x7E => {
                tracing::debug!("Dropping malformed CSI sequence");
                self.reset();
                None
            }
            0x1B => {
                self.enter_escape();
                None
            }
            0x00..=0x1F => Some(Token::Control(byte)),
            _ => None,
        }
    }

    fn finish_osc(&mut self) -> Token {
        self.osc_fields.push(std::mem::take(&mut self.osc_current));
        let token = Token::Osc(std::mem::take(&mut self.osc_fields));
        self.reset();
        token
    }

    fn osc_string(&mut self, byte: u8) -> Option<Token> {
        match byte {
            // BEL terminates OSC
            0x07 => Some(self.finish_osc()),
            // Possibly ST (ESC \)
            0x1B => {
                self.state = State::OscEscape;
                None
            }
            b';' if self.osc_fields.is_empty() => {
                self.osc_fields.push(std::mem::take(&mut self.osc_current));
                None
            }
            0x20..=0xFF => {
                self.osc_current.push(byte);
                None
            }
            // Ignore other C0
            _ => None,
        }
    }

    fn osc_escape(&mut self, byte: u8) -> Option<Token> {
        if byte == b'\\' {
            return Some(self.finish_osc());
        }
        // Not ST: the OSC is abandoned and a new escape begins
        let token = self.finish_osc();
        self.enter_escape();
        self.raw.push(byte);
        self.follow = self.escape(byte);
        Some(token)
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}
