//! Terminal output rendering
//!
//! Provides the ANSI/VT subset needed for an append-only styled log:
//! - Tokenizing CSI, OSC and plain escape sequences
//! - SGR colors (base, bright, 256-color and truecolor) and text attributes
//! - Clear screen / home, window title
//!
//! There is no cursor-addressable grid: cursor movement, erase-line and
//! private modes are consumed without effect.

pub mod color;
pub mod display;
pub mod interpreter;
pub mod parser;
pub mod style;

pub use color::{indexed, Rgb, BASE, BRIGHT, PALETTE_256};
pub use display::{BufferSurface, DisplayOp, DisplaySurface, StyledRun};
pub use interpreter::AnsiInterpreter;
pub use parser::{Category, Token, Tokenizer};
pub use style::StyleState;
