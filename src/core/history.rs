//! Command history
//!
//! Lines sent to the shell are remembered (at most [`HISTORY_LIMIT`], a
//! repeat of the newest entry is not stored again) and can be recalled with
//! the arrow keys. Stdin is line buffered, so a recall arrives as a line made
//! only of cursor-key sequences, e.g. `ESC [ A` twice for "two back".

use std::collections::VecDeque;

/// Entries kept
pub const HISTORY_LIMIT: usize = 100;

/// Recall direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKey {
    /// Older entry
    Up,
    /// Newer entry, or back to the line being edited
    Down,
}

/// Split a line into cursor-up/down keys
///
/// Returns `None` unless the whole line (newline aside) is arrow keys, in
/// either the normal (`ESC [`) or the application (`ESC O`) form.
pub fn parse_recall(line: &[u8]) -> Option<Vec<HistoryKey>> {
    let mut rest = trim_newline(line);
    let mut keys = Vec::new();
    while !rest.is_empty() {
        let key = match rest {
            [0x1B, b'[' | b'O', b'A', ..] => HistoryKey::Up,
            [0x1B, b'[' | b'O', b'B', ..] => HistoryKey::Down,
            _ => return None,
        };
        keys.push(key);
        rest = &rest[3..];
    }
    (!keys.is_empty()).then_some(keys)
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Bounded list of submitted commands with a recall cursor
#[derive(Debug, Clone)]
pub struct CommandHistory {
    entries: VecDeque<String>,
    limit: usize,
    /// Steps back from the newest entry; `None` when not recalling
    position: Option<usize>,
    /// Line that was being typed when recall started
    saved: String,
}

impl CommandHistory {
    /// Empty history holding at most `limit` entries
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(HISTORY_LIMIT)),
            limit: limit.max(1),
            position: None,
            saved: String::new(),
        }
    }

    /// Remember a submitted command; returns whether it was stored
    pub fn push(&mut self, command: &str) -> bool {
        self.position = None;
        let command = command.trim();
        if command.is_empty() || self.entries.back().is_some_and(|last| last == command) {
            return false;
        }
        self.entries.push_back(command.to_string());
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
        true
    }

    /// Step to an older entry
    ///
    /// `current` is what was typed before recall began; it comes back when
    /// stepping down past the newest entry. Stays on the oldest entry.
    pub fn up(&mut self, current: &str) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let next = match self.position {
            None => {
                self.saved = current.to_string();
                0
            }
            Some(p) if p + 1 < self.entries.len() => p + 1,
            Some(p) => p,
        };
        self.position = Some(next);
        self.entry(next)
    }

    /// Step to a newer entry, or back to the saved line
    pub fn down(&mut self) -> Option<&str> {
        match self.position? {
            0 => {
                self.position = None;
                Some(self.saved.as_str())
            }
            p => {
                self.position = Some(p - 1);
                self.entry(p - 1)
            }
        }
    }

    /// Apply a sequence of keys; the line they land on
    pub fn recall(&mut self, keys: &[HistoryKey]) -> Option<String> {
        let mut line = None;
        for key in keys {
            line = match key {
                HistoryKey::Up => self.up("").map(str::to_string),
                HistoryKey::Down => self.down().map(str::to_string),
            }
            .or(line);
        }
        line
    }

    fn entry(&self, back: usize) -> Option<&str> {
        let index = self.entries.len().checked_sub(back + 1)?;
        self.entries.get(index).map(String::as_str)
    }

    /// Stored entries, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No entries yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.entries.clear();
        self.position = None;
        self.saved.clear();
    }
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new(HISTORY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_to_limit() {
        let mut history = CommandHistory::default();
        for i in 0..150 {
            history.push(&format!("cmd {}", i));
        }
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.iter().next(), Some("cmd 50"));
        assert_eq!(history.iter().last(), Some("cmd 149"));
    }

    #[test]
    fn test_repeat_of_last_not_stored() {
        let mut history = CommandHistory::default();
        assert!(history.push("ls -l"));
        assert!(!history.push("ls -l"));
        assert!(!history.push("  ls -l \n"));
        assert!(!history.push(""));
        assert!(history.push("pwd"));
        // Only the newest entry is compared
        assert!(history.push("ls -l"));
        assert_eq!(history.iter().collect::<Vec<_>>(), vec!["ls -l", "pwd", "ls -l"]);
    }

    #[test]
    fn test_up_and_down() {
        let mut history = CommandHistory::default();
        history.push("one");
        history.push("two");
        history.push("three");

        assert_eq!(history.down(), None);
        assert_eq!(history.up("typing"), Some("three"));
        assert_eq!(history.up(""), Some("two"));
        assert_eq!(history.up(""), Some("one"));
        assert_eq!(history.up(""), Some("one"));
        assert_eq!(history.down(), Some("two"));
        assert_eq!(history.down(), Some("three"));
        assert_eq!(history.down(), Some("typing"));
        assert_eq!(history.down(), None);
    }

    #[test]
    fn test_push_resets_recall() {
        let mut history = CommandHistory::default();
        history.push("one");
        history.push("two");
        history.up("");
        history.up("");
        history.push("three");
        assert_eq!(history.up(""), Some("three"));
    }

    #[test]
    fn test_parse_recall() {
        assert_eq!(parse_recall(b"\x1b[A\n"), Some(vec![HistoryKey::Up]));
        assert_eq!(
            parse_recall(b"\x1b[A\x1bOA\x1b[B\r\n"),
            Some(vec![HistoryKey::Up, HistoryKey::Up, HistoryKey::Down])
        );
        assert_eq!(parse_recall(b"\n"), None);
        assert_eq!(parse_recall(b"ls\x1b[A\n"), None);
        assert_eq!(parse_recall(b"\x1b[C\n"), None);
    }

    #[test]
    fn test_recall_keys() {
        let mut history = CommandHistory::default();
        assert_eq!(history.recall(&[HistoryKey::Up]), None);
        history.push("make");
        history.push("make test");
        assert_eq!(
            history.recall(&[HistoryKey::Up, HistoryKey::Up]),
            Some("make".to_string())
        );
    }
}
