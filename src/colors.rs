use std::fmt::Display;
use std::io::IsTerminal;

const YELLOW: &str = "\x1b[0;33m";
const WHITE: &str = "\x1b[0;97m";
const GREEN_BOLD: &str = "\x1b[1;32m";
const RED_BOLD: &str = "\x1b[1;31m";
const GREY_BOLD: &str = "\x1b[1;90m";
const NC: &str = "\x1b[0m";

/// An ANSI color prefix; the empty style paints nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Style(&'static str);

impl Style {
    pub const PLAIN: Style = Style("");

    pub fn paint(self, text: impl Display) -> String {
        if self.0.is_empty() {
            text.to_string()
        } else {
            format!("{}{text}{NC}", self.0)
        }
    }
}

/// Styles for each kind of thing printed in the result tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorScheme {
    pub folder: Style,
    pub test_name: Style,
    pub pass: Style,
    pub fail: Style,
    pub ignore: Style,
}

impl Default for ColorScheme {
    fn default() -> Self {
        Self {
            folder: Style(YELLOW),
            test_name: Style(WHITE),
            pass: Style(GREEN_BOLD),
            fail: Style(RED_BOLD),
            ignore: Style(GREY_BOLD),
        }
    }
}

impl ColorScheme {
    pub fn plain() -> Self {
        Self {
            folder: Style::PLAIN,
            test_name: Style::PLAIN,
            pass: Style::PLAIN,
            fail: Style::PLAIN,
            ignore: Style::PLAIN,
        }
    }

    /// Colors on a terminal unless `NO_COLOR` is set.
    pub fn detect() -> Self {
        if std::env::var_os("NO_COLOR").is_some() || !std::io::stdout().is_terminal() {
            Self::plain()
        } else {
            Self::default()
        }
    }
}
