//! Best-effort parsing of Python tracebacks.

use crate::html;

/// Message used when a trace carries no text at all.
const UNKNOWN_ERROR: &str = "Unknown error";

/// A condensed view of an interpreter error trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedError {
    /// Line number of the innermost frame, if any frame was found.
    pub line_number: Option<u32>,

    /// Last `Type: message` line, e.g. `ValueError: bad input`.
    pub condensed_message: String,

    /// The trace as received.
    pub raw_trace: String,
}

impl ParsedError {
    /// Render as an error container.
    pub fn to_html(&self) -> String {
        html::error_output(&self.condensed_message, self.line_number)
    }
}

/// Parse a raw multi-line trace.
///
/// The line number comes from the last `File "...", line N` marker, scanning
/// from the end. The condensed message comes from the last non-indented
/// `Type: message` line. Neither has to be present.
pub fn parse_traceback(raw: &str) -> ParsedError {
    let line_number = raw.lines().rev().find_map(frame_line_number);

    let condensed_message = raw
        .lines()
        .rev()
        .find(|line| is_exception_line(line))
        .or_else(|| raw.lines().rev().find(|line| !line.trim().is_empty()))
        .map(|line| line.trim().to_string())
        .unwrap_or_else(|| UNKNOWN_ERROR.to_string());

    ParsedError {
        line_number,
        condensed_message,
        raw_trace: raw.to_string(),
    }
}

/// Extract `N` from `File "<anything>", line N[, in scope]`.
fn frame_line_number(line: &str) -> Option<u32> {
    let rest = line.trim_start().strip_prefix("File \"")?;
    let (_, after_file) = rest.rsplit_once("\", line ")?;
    let digits: String = after_file.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Whether `line` is a top-level `Type: message` (or bare `Type`) line.
fn is_exception_line(line: &str) -> bool {
    if line.starts_with(char::is_whitespace) {
        return false;
    }
    let line = line.trim_end();
    let type_name = match line.split_once(':') {
        Some((name, _)) => name,
        None => line,
    };
    is_dotted_identifier(type_name)
}

fn is_dotted_identifier(text: &str) -> bool {
    !text.is_empty()
        && text.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
                && chars.all(|c| c.is_alphanumeric() || c == '_')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_and_message() {
        let trace = r#"Traceback (most recent call last):
  File "<exec>", line 7, in <module>
ValueError: bad input"#;
        let parsed = parse_traceback(trace);
        assert_eq!(parsed.line_number, Some(7));
        assert_eq!(parsed.condensed_message, "ValueError: bad input");
        assert_eq!(parsed.raw_trace, trace);
    }

    #[test]
    fn test_last_frame_wins() {
        let trace = r#"PythonError: Traceback (most recent call last):
  File "/lib/python3.12/site-packages/_pyodide/_base.py", line 596, in eval_code_async
    await CodeRunner(
  File "<exec>", line 3, in <module>
  File "<exec>", line 2, in helper
ZeroDivisionError: division by zero
"#;
        let parsed = parse_traceback(trace);
        assert_eq!(parsed.line_number, Some(2));
        assert_eq!(parsed.condensed_message, "ZeroDivisionError: division by zero");
    }

    #[test]
    fn test_no_frame_marker() {
        let parsed = parse_traceback("RuntimeError: raised outside user code");
        assert_eq!(parsed.line_number, None);
        assert_eq!(parsed.condensed_message, "RuntimeError: raised outside user code");
    }

    #[test]
    fn test_syntax_error_caret_lines_are_skipped() {
        let trace = r#"  File "<exec>", line 4
    x = (1,
        ^
SyntaxError: '(' was never closed"#;
        let parsed = parse_traceback(trace);
        assert_eq!(parsed.line_number, Some(4));
        assert_eq!(parsed.condensed_message, "SyntaxError: '(' was never closed");
    }

    #[test]
    fn test_dotted_and_bare_exception_names() {
        let parsed = parse_traceback("Traceback (most recent call last):\nKeyboardInterrupt");
        assert_eq!(parsed.condensed_message, "KeyboardInterrupt");

        let parsed = parse_traceback("json.decoder.JSONDecodeError: Expecting value");
        assert_eq!(parsed.condensed_message, "json.decoder.JSONDecodeError: Expecting value");
    }

    #[test]
    fn test_fallbacks() {
        let parsed = parse_traceback("");
        assert_eq!(parsed.line_number, None);
        assert_eq!(parsed.condensed_message, "Unknown error");

        let parsed = parse_traceback("something odd happened (really)\n\n");
        assert_eq!(parsed.condensed_message, "something odd happened (really)");
    }

    #[test]
    fn test_malformed_frame_marker() {
        assert_eq!(frame_line_number(r#"File "x.py", line abc"#), None);
        assert_eq!(frame_line_number(r#"File "x.py""#), None);
        assert_eq!(frame_line_number(r#"  File "a, line 1.py", line 12, in f"#), Some(12));
    }

    #[test]
    fn test_to_html() {
        let parsed = parse_traceback("  File \"<exec>\", line 1\nNameError: name 'x' is not defined");
        assert_eq!(
            parsed.to_html(),
            r#"<pre class="notebook-error-output">Line 1: NameError: name &#x27;x&#x27; is not defined</pre>"#
        );
    }
}
