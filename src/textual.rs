//! Line assembly shared by the textual parser pipeline.
//!
//! Incoming chunks are concatenated to any leftover fragment from the
//! previous chunk and split on newline characters. A *full* line is one
//! that ended with a newline in the source bytes; a *partial* line is the
//! trailing fragment without a newline, carried over to the next call.

/// One line produced by [`LineAccumulator::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    pub is_full_line: bool,
}

/// Splits an incoming stream of chunks into lines, carrying a trailing
/// partial line across calls to `feed`.
#[derive(Debug, Default)]
pub struct LineAccumulator {
    pending: String,
}

impl LineAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of decoded text, returning the lines it completes.
    ///
    /// If the chunk ends mid-line, the trailing fragment is retained and
    /// prepended to the next call's first line instead of being yielded
    /// here.
    pub fn feed(&mut self, chunk: &str) -> Vec<Line> {
        self.pending.push_str(chunk);
        let mut lines = Vec::new();

        loop {
            match self.pending.find('\n') {
                Some(idx) => {
                    let mut text: String = self.pending.drain(..=idx).collect();
                    text.pop(); // drop the '\n'
                    if text.ends_with('\r') {
                        text.pop();
                    }
                    lines.push(Line {
                        text,
                        is_full_line: true,
                    });
                }
                None => break,
            }
        }

        lines
    }

    /// Current partial-line fragment (not yet newline-terminated), if any
    /// data has accumulated since the last full line.
    pub fn pending_partial(&self) -> Option<Line> {
        if self.pending.is_empty() {
            None
        } else {
            Some(Line {
                text: self.pending.clone(),
                is_full_line: false,
            })
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_full_lines_and_retains_partial() {
        let mut acc = LineAccumulator::new();
        let lines = acc.feed("first\nsecond\nthir");
        assert_eq!(
            lines,
            vec![
                Line { text: "first".into(), is_full_line: true },
                Line { text: "second".into(), is_full_line: true },
            ]
        );
        assert_eq!(acc.pending_partial().unwrap().text, "thir");

        let lines = acc.feed("d\n");
        assert_eq!(lines, vec![Line { text: "third".into(), is_full_line: true }]);
        assert!(acc.pending_partial().is_none());
    }

    #[test]
    fn strips_carriage_return() {
        let mut acc = LineAccumulator::new();
        let lines = acc.feed("host:~ # \r\n");
        assert_eq!(lines[0].text, "host:~ # ");
    }
}
