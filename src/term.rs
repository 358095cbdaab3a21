//! A few ANSI escape codes for terminal output.
// See https://en.wikipedia.org/wiki/ANSI_escape_code#Escape_sequences
// Just need to use `\u{1b}` rather than `\033` for the ESC

/// Cease all formatting
pub const END: &str = "\u{1b}[0m";

/// Bold text
pub const BOLD: &str = "\u{1b}[1m";

/// "Faint" text
pub const FAINT: &str = "\u{1b}[2m";

/// Non-standard: Cursor Previous Line followed by Erase In Line.
/// Preface a progress line with this to overwrite the previous one.
pub const TTYJUMP: &str = "\u{1b}[F\u{1b}[2K";

/// Wrap a string in a decoration when stderr is a terminal, so piped
/// output stays clean.
pub fn decorate_if_tty(input: &str, which: &str) -> String {
    use std::io::IsTerminal;
    if std::io::stderr().is_terminal() {
        format!("{which}{input}{END}")
    } else {
        input.to_string()
    }
}
