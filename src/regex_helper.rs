//! Shared regex capture holder, used by every concrete parser.
//!
//! A tiny utility that remembers the last successful match so a parser's
//! `on_new_line` can pull captured groups out without re-matching or
//! threading a `Captures` lifetime through its own state.
use regex::{Captures, Regex};

/// Remembers the most recent successful match against a line.
#[derive(Debug, Default)]
pub struct RegexHelper {
    last_match: Option<String>,
}

impl RegexHelper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to match `re` against `line`. Returns `true` and remembers the
    /// match on success, discarding any previous match.
    pub fn matches(&mut self, re: &Regex, line: &str) -> bool {
        if re.is_match(line) {
            self.last_match = Some(line.to_string());
            true
        } else {
            false
        }
    }

    /// Group `index` from the last remembered match against `re`, if any.
    pub fn group<'a>(&self, re: &Regex, index: usize) -> Option<String> {
        let line = self.last_match.as_deref()?;
        re.captures(line)?
            .get(index)
            .map(|m| m.as_str().to_string())
    }

    /// Named group from the last remembered match against `re`, if any.
    pub fn named_group(&self, re: &Regex, name: &str) -> Option<String> {
        let line = self.last_match.as_deref()?;
        re.captures(line)?
            .name(name)
            .map(|m| m.as_str().to_string())
    }

    /// Raw captures of the last remembered match against `re`, if any.
    pub fn captures<'a>(&'a self, re: &Regex) -> Option<Captures<'a>> {
        let line = self.last_match.as_deref()?;
        re.captures(line)
    }

    pub fn clear(&mut self) {
        self.last_match = None;
    }
}
