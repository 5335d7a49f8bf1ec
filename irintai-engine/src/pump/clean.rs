//! Line cleaning and completion marker detection

use std::sync::LazyLock;

use regex::Regex;

/// CSI sequences, two-byte escapes, and C0 controls other than tab/newline.
static CONTROL_SEQUENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]|\x1B[@-_]|[\x00-\x08\x0B-\x1F\x7F]")
        .expect("control sequence pattern is valid")
});

/// Remove terminal escape and control sequences from `text`.
pub fn strip_control_sequences(text: &str) -> String {
    CONTROL_SEQUENCE.replace_all(text, "").into_owned()
}

/// Strip control sequences and surrounding whitespace.
pub fn clean_line(raw: &str) -> String {
    strip_control_sequences(raw).trim().to_string()
}

/// Whether a cleaned line is the engine's "ready for input" prompt.
///
/// Matches a bare `>`, the interactive `>>>` prompt (with or without its
/// placeholder text), and the block cursor some engine builds print.
pub fn is_completion_marker(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed == ">" || trimmed.starts_with(">>>") || trimmed.contains('\u{258C}')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_codes() {
        assert_eq!(strip_control_sequences("\x1B[31mHello\x1B[0m"), "Hello");
    }

    #[test]
    fn strips_cursor_movement_and_spinner_controls() {
        let raw = "\x1B[?25l\x1B[2K\x1B[1Gpulling manifest\x1B[?25h";
        assert_eq!(strip_control_sequences(raw), "pulling manifest");
    }

    #[test]
    fn strips_c0_controls_but_keeps_tabs() {
        assert_eq!(strip_control_sequences("a\x07b\tc\x7F"), "ab\tc");
    }

    #[test]
    fn clean_line_trims() {
        assert_eq!(clean_line("  \x1B[1mhello\x1B[0m \r"), "hello");
        assert_eq!(clean_line("\x1B[K"), "");
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(strip_control_sequences("42% ▕██▏ 1.2 GB"), "42% ▕██▏ 1.2 GB");
    }

    #[test]
    fn detects_markers() {
        assert!(is_completion_marker(">"));
        assert!(is_completion_marker(" > "));
        assert!(is_completion_marker(">>>"));
        assert!(is_completion_marker(">>> Send a message (/? for help)"));
        assert!(is_completion_marker("\u{258C}"));
    }

    #[test]
    fn ordinary_lines_are_not_markers() {
        assert!(!is_completion_marker("hello"));
        assert!(!is_completion_marker("a > b"));
        assert!(!is_completion_marker("-> arrow"));
        assert!(!is_completion_marker(""));
    }
}
