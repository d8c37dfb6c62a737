//! Display surface collaborator
//!
//! Output is an append-only log of styled runs. The surface itself lives
//! outside the library (a stdout renderer in the binary, a mock in tests).

use super::color::Rgb;
use super::style::StyleState;

/// Text in one rendition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledRun {
    /// Text content
    pub text: String,
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
}

impl StyledRun {
    /// Run of `text` in the given style
    pub fn new(text: impl Into<String>, style: &StyleState) -> Self {
        Self {
            text: text.into(),
            fg: style.fg,
            bg: style.bg,
            bold: style.bold,
            italic: style.italic,
            underline: style.underline,
        }
    }

    /// Same rendition as another run
    pub fn same_style(&self, other: &StyledRun) -> bool {
        self.fg == other.fg
            && self.bg == other.bg
            && self.bold == other.bold
            && self.italic == other.italic
            && self.underline == other.underline
    }
}

/// Operation produced by the interpreter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayOp {
    /// Append a styled run
    Append(StyledRun),
    /// Clear the whole surface
    Clear,
    /// Set the window title
    SetTitle(String),
}

/// Append-only styled text sink
#[cfg_attr(test, mockall::automock)]
pub trait DisplaySurface {
    /// Append a run at the end of the log
    fn append_run(&mut self, run: &StyledRun);

    /// Clear everything
    fn clear(&mut self);

    /// Update the title
    fn set_title(&mut self, title: &str);

    /// Apply one interpreter operation
    fn apply(&mut self, op: &DisplayOp) {
        match op {
            DisplayOp::Append(run) => self.append_run(run),
            DisplayOp::Clear => self.clear(),
            DisplayOp::SetTitle(title) => self.set_title(title),
        }
    }
}

/// In-memory surface keeping every run, useful for capture and tests
#[derive(Debug, Default, Clone)]
pub struct BufferSurface {
    /// Runs appended since the last clear
    pub runs: Vec<StyledRun>,
    /// Last title set
    pub title: Option<String>,
    /// Number of clears seen
    pub clears: usize,
}

impl BufferSurface {
    /// Concatenated plain text
    pub fn text(&self) -> String {
        self.runs.iter().map(|r| r.text.as_str()).collect()
    }
}

impl DisplaySurface for BufferSurface {
    fn append_run(&mut self, run: &StyledRun) {
        self.runs.push(run.clone());
    }

    fn clear(&mut self) {
        self.runs.clear();
        self.clears += 1;
    }

    fn set_title(&mut self, title: &str) {
        self.title = Some(title.to_string());
    }
}
