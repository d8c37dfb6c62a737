//! ANSI interpreter
//!
//! Turns raw shell output plus the current [`StyleState`] into styled runs
//! and display operations. The interpreter never fails: unknown sequences
//! are logged at debug level and dropped.

use super::display::{DisplayOp, StyledRun};
use super::parser::{Category, Token, Tokenizer};
use super::style::StyleState;

/// Interpreter; style lives in [`StyleState`], only a cut UTF-8 character
/// is carried into the next chunk
#[derive(Debug, Default)]
pub struct AnsiInterpreter {
    tokenizer: Tokenizer,
    utf8_tail: Vec<u8>,
}

/// Accumulates bytes of the run being built
struct RunBuilder<'a> {
    ops: Vec<DisplayOp>,
    pending: Vec<u8>,
    style: &'a mut StyleState,
}

impl RunBuilder<'_> {
    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        self.ops.push(DisplayOp::Append(StyledRun::new(text, self.style)));
    }

    fn push_op(&mut self, op: DisplayOp) {
        self.flush();
        if op == DisplayOp::Clear && self.ops.last() == Some(&DisplayOp::Clear) {
            return;
        }
        self.ops.push(op);
    }
}

impl AnsiInterpreter {
    /// Create a new interpreter
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpret one chunk, updating `style` in place
    pub fn interpret(&mut self, chunk: &[u8], style: &mut StyleState) -> Vec<DisplayOp> {
        let joined;
        let input = if self.utf8_tail.is_empty() {
            chunk
        } else {
            let mut buf = std::mem::take(&mut self.utf8_tail);
            buf.extend_from_slice(chunk);
            joined = buf;
            &joined[..]
        };

        let tokens = self.tokenizer.tokenize(input);
        let ends_in_text = matches!(tokens.last(), Some(Token::Text(_)));
        let mut builder = RunBuilder {
            ops: Vec::new(),
            pending: Vec::new(),
            style,
        };

        for token in tokens {
            match token {
                Token::Text(bytes) => builder.pending.extend_from_slice(&bytes),
                Token::Control(b'\n') => builder.pending.push(b'\n'),
                Token::Control(b'\t') => builder.pending.push(b'\t'),
                // CR, BEL, BS and the rest have no meaning in an append-only log
                Token::Control(_) => {}
                Token::Incomplete(raw) => {
                    tracing::debug!(
                        "Dropping escape sequence cut at chunk boundary: {}",
                        hex::encode(&raw)
                    );
                }
                escape => Self::escape(&mut builder, escape),
            }
        }

        if ends_in_text {
            let cut = incomplete_utf8_tail(&builder.pending);
            if cut > 0 {
                let at = builder.pending.len() - cut;
                self.utf8_tail = builder.pending.split_off(at);
            }
        }
        builder.flush();
        builder.ops
    }

    fn escape(builder: &mut RunBuilder<'_>, token: Token) {
        match (token.category(), token) {
            (Some(Category::Sgr), Token::Csi { params, .. }) => {
                builder.flush();
                builder.style.apply_sgr(&params);
            }
            (Some(Category::CursorOrClear), Token::Csi { params, action, .. }) => {
                if is_clear(&params, action) {
                    builder.push_op(DisplayOp::Clear);
                }
            }
            (Some(Category::OscTitle), Token::Osc(fields)) => {
                let title = fields.get(1).map(|f| String::from_utf8_lossy(f).into_owned());
                builder.push_op(DisplayOp::SetTitle(title.unwrap_or_default()));
            }
            (Some(Category::PrivateMode | Category::CharsetSelect), _) => {}
            (_, other) => tracing::debug!("Ignoring escape sequence: {:?}", other),
        }
    }
}

/// Length of a UTF-8 sequence left open at the end of `bytes` (0 to 3)
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        let needed = match byte {
            0x80..=0xBF => continue,
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

/// Home or erase-display sequences that wipe the whole surface
fn is_clear(params: &[u16], action: u8) -> bool {
    match action {
        b'J' => matches!(params.first(), Some(2 | 3)),
        b'H' | b'f' => matches!(params, [] | [1] | [1, 1] | [0, 0]),
        _ => false,
    }
}
