//! Output transforms applied by the execution aggregator before a cycle's
//! bytes are considered for stop-mark matching or handed to a stop-marked
//! process's response.
//!
//! Ported from the sanitization shim in the terminal reference
//! implementation: strip ANSI CSI sequences, normalize line endings, and
//! drop a leading shell prompt.

use std::sync::OnceLock;

use regex::Regex;

fn ansi_csi() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("valid ANSI CSI regex"))
}

fn leading_prompt() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^(?:cmd> ?)+").expect("valid prompt regex"))
}

/// Strip ANSI escapes, normalize CRLF/CR to LF, and remove a leading shell
/// prompt from each line. Used when a stop mark is active for a process —
/// sanitized output, not raw bytes, is what that process sees in the cycle.
pub fn sanitize(text: &str) -> String {
    let without_ansi = ansi_csi().replace_all(text, "");
    let normalized = without_ansi.replace("\r\n", "\n").replace('\r', "\n");
    leading_prompt().replace_all(&normalized, "").into_owned()
}

/// `true` if `stop_mark` appears anywhere in the raw (unsanitized) text,
/// matching the reference implementation's "detect in raw text with CRLF"
/// behavior.
pub fn contains_stop_mark(text: &str, stop_mark: &str) -> bool {
    text.contains(stop_mark)
}

/// Prefix `^C\n` to `text` if a ctrl-C was sent recently and the shell
/// hasn't echoed it itself yet.
pub fn apply_ctrl_c_echo_fix(text: &str, last_ctrl_c_within_window: bool) -> String {
    if last_ctrl_c_within_window && !text.starts_with("^C") {
        format!("^C\n{}", text)
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi_csi_sequences() {
        let raw = "\x1B[31mred\x1B[0m text";
        assert_eq!(sanitize(raw), "red text");
    }

    #[test]
    fn normalizes_crlf_and_cr() {
        let raw = "line1\r\nline2\rline3";
        assert_eq!(sanitize(raw), "line1\nline2\nline3");
    }

    #[test]
    fn strips_leading_prompt_per_line() {
        let raw = "cmd> echo hi\ncmd> hi";
        assert_eq!(sanitize(raw), "echo hi\nhi");
    }

    #[test]
    fn repeated_prompt_tokens_collapse() {
        let raw = "cmd> cmd> ls";
        assert_eq!(sanitize(raw), "ls");
    }

    #[test]
    fn stop_mark_is_detected_in_raw_text() {
        assert!(contains_stop_mark("some output\r\n__STOP__\r\n", "__STOP__"));
        assert!(!contains_stop_mark("some output", "__STOP__"));
    }

    #[test]
    fn ctrl_c_echo_fix_prefixes_when_missing() {
        assert_eq!(apply_ctrl_c_echo_fix("cmd> ", true), "^C\ncmd> ");
    }

    #[test]
    fn ctrl_c_echo_fix_is_noop_when_already_echoed() {
        assert_eq!(apply_ctrl_c_echo_fix("^C\ncmd> ", true), "^C\ncmd> ");
    }

    #[test]
    fn ctrl_c_echo_fix_is_noop_outside_window() {
        assert_eq!(apply_ctrl_c_echo_fix("cmd> ", false), "cmd> ");
    }
}
