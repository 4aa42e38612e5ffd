/// Live marker counter printed next to a running test.
///
/// Shows the cumulative pass+fail count as one number updated in place: the
/// previous digits are backspaced over and the new value is printed in the
/// pass or fail color of the marker that produced it.
use crate::colors::ColorScheme;
use crate::scanner::{Marker, ProgressReporter};
use std::io::Write;

pub struct TerminalProgress<W: Write + Send> {
    out: W,
    scheme: ColorScheme,
    shown_width: usize,
}

impl TerminalProgress<std::io::Stdout> {
    pub fn stdout(scheme: ColorScheme) -> Self {
        Self::new(std::io::stdout(), scheme)
    }
}

impl<W: Write + Send> TerminalProgress<W> {
    pub fn new(out: W, scheme: ColorScheme) -> Self {
        Self {
            out,
            scheme,
            shown_width: 0,
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, text: &str) {
        // Progress is cosmetic; a closed terminal must not fail the run.
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|_| self.out.flush()) {
            tracing::debug!(error = %e, "failed to write progress");
        }
    }
}

impl<W: Write + Send> ProgressReporter for TerminalProgress<W> {
    fn marker(&mut self, kind: Marker, total: u64) {
        let digits = total.to_string();
        let style = match kind {
            Marker::Fail => self.scheme.fail,
            _ => self.scheme.pass,
        };
        let text = format!("{}{}", "\x08".repeat(self.shown_width), style.paint(&digits));
        self.shown_width = digits.len();
        self.emit(&text);
    }

    fn clear(&mut self) {
        if self.shown_width == 0 {
            return;
        }
        let text = "\x08 \x08".repeat(self.shown_width);
        self.shown_width = 0;
        self.emit(&text);
    }
}
