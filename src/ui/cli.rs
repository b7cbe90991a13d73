//! Command line interface UI.

use std::io::prelude::*;

use term::{
    color::{self, Color},
    Attr, StdoutTerminal,
};
use unicode_width::UnicodeWidthChar;

use super::Ui;
use crate::flow::ValidationWarning;

/// Greedy word wrapping. Lines are broken so their display width stays
/// within `width`; continuation lines are indented by `indent` spaces.
/// Definitions and unit strings can get long, so diagnostics go through
/// this before reaching the terminal.
fn wrap_text(text: &str, width: usize, indent: usize) -> String {
    fn display_width(word: &str) -> usize {
        word.chars().filter_map(UnicodeWidthChar::width).sum()
    }

    let mut lines: Vec<String> = Vec::new();
    let mut line = String::new();
    let mut col = 0;

    for word in text.split_whitespace() {
        let word_width = display_width(word);

        if col > 0 && col + 1 + word_width > width {
            lines.push(std::mem::take(&mut line));
            col = 0;
        }
        if col > 0 {
            line.push(' ');
            col += 1;
        }
        line.push_str(word);
        col += word_width;
    }
    if !line.is_empty() {
        lines.push(line);
    }

    let separator = format!("\n{}", " ".repeat(indent));
    lines.join(&separator)
}

pub struct CliUi {
    terminal: Box<StdoutTerminal>,
    n_warnings: usize,
}

impl CliUi {
    pub fn new() -> Option<Self> {
        Some(CliUi {
            terminal: term::stdout()?,
            n_warnings: 0,
        })
    }

    /// Prints the text styled as requested and resets the terminal after
    /// it. Terminal failures are ignored, a dumb terminal still gets the
    /// text itself.
    fn paint(&mut self, text: &str, fg: Option<Color>, bold: bool) {
        if let Some(fg) = fg {
            let _ = self.terminal.fg(fg);
        }
        if bold {
            let _ = self.terminal.attr(Attr::Bold);
        }
        let _ = write!(self.terminal, "{}", text);
        let _ = self.terminal.reset();
    }

    fn plain(&mut self, text: &str) {
        let _ = write!(self.terminal, "{}", text);
    }
}

impl Ui for CliUi {
    fn prolog(&mut self, n_inputs: usize, n_files: usize) {
        self.plain(&format!(
            "conforming {} input file(s) into {} output file(s)\n\n",
            n_inputs, n_files
        ));
    }

    fn file_started(&mut self, name: &str) {
        self.plain("producing ");
        self.paint(name, None, true);
        self.plain(" ...\n");

        self.n_warnings = 0;
    }

    fn file_written(&mut self, name: &str, n_variables: usize) {
        self.paint("done", Some(color::GREEN), false);
        self.plain(&format!(
            " {} ({} variable(s), {} warning(s))\n",
            name, n_variables, self.n_warnings
        ));
    }

    fn warning(&mut self, warning: &ValidationWarning) {
        self.n_warnings += 1;

        self.paint(
            &format!("  warning [{}] ", warning.check),
            Some(color::YELLOW),
            false,
        );
        self.plain(&wrap_text(&warning.to_string(), 76, 4));
        self.plain("\n");
    }

    fn epilog(&mut self) {
        self.plain("\n");
    }

    fn error(&mut self, error: &str) {
        self.paint("error: ", Some(color::RED), true);
        self.plain(&wrap_text(error, 72, 4));
        self.plain("\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_stays_on_one_line() {
        assert_eq!(wrap_text("units are fine", 40, 2), "units are fine");
    }

    #[test]
    fn long_text_breaks_at_word_boundaries() {
        let wrapped = wrap_text("one two three four", 9, 2);
        assert_eq!(wrapped, "one two\n  three\n  four");
    }

    #[test]
    fn oversized_word_gets_its_own_line() {
        let wrapped = wrap_text("a definitionlongerthanwidth b", 10, 0);
        assert_eq!(wrapped, "a\ndefinitionlongerthanwidth\nb");
    }

    #[test]
    fn whitespace_collapses() {
        assert_eq!(wrap_text("  a \n b  ", 40, 0), "a b");
    }
}
