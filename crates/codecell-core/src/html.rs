//! HTML output conventions.
//!
//! The rendering layer styles output by these exact class markers, so the
//! markup produced here must not change shape.

/// Rendered when an execution produced nothing at all.
pub const NO_OUTPUT: &str = r#"<div class="text-sm text-muted-foreground italic">No output</div>"#;

/// Result of an execution the user interrupted.
pub const INTERRUPTED: &str =
    r#"<pre class="notebook-error-output">Execution interrupted by user.</pre>"#;

/// Result of a queued execution dropped after an interrupt.
pub const CANCELLED: &str =
    r#"<pre class="notebook-error-output">Execution cancelled due to previous interruption.</pre>"#;

/// Maximum characters of a plain-text value before truncation.
pub const MAX_REPR_CHARS: usize = 10_000;

/// Appended to truncated plain-text values.
pub const TRUNCATION_MARKER: &str = "... (output truncated)";

/// Escape text for inclusion in HTML.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// A line the program printed to standard output.
pub fn stream_output(text: &str) -> String {
    format!(r#"<pre class="notebook-stream-output">{}</pre>"#, escape(text))
}

/// A progress-bar update.
pub fn progress_output(text: &str) -> String {
    format!(r#"<pre class="notebook-tqdm-output">{}</pre>"#, escape(text))
}

/// A line the program printed to standard error.
pub fn stderr_output(text: &str) -> String {
    format!("<pre class=\"notebook-error-output\">{}\n</pre>", escape(text))
}

/// An error message, optionally pinned to a line of user code.
pub fn error_output(message: &str, line_number: Option<u32>) -> String {
    let text = match line_number {
        Some(line) => format!("Line {}: {}", line, message),
        None => message.to_string(),
    };
    format!(r#"<pre class="notebook-error-output">{}</pre>"#, escape(&text))
}

/// A plain value representation, truncated and escaped.
pub fn text_output(repr: &str) -> String {
    let truncated = match repr.char_indices().nth(MAX_REPR_CHARS) {
        Some((cut, _)) => format!("{}{}", &repr[..cut], TRUNCATION_MARKER),
        None => repr.to_string(),
    };
    format!(r#"<pre class="notebook-output">{}</pre>"#, escape(&truncated))
}

/// Whether `output` is already wrapped in one of the known containers.
pub fn is_formatted(output: &str) -> bool {
    output.contains(r#"<pre class="notebook-"#)
        || output.contains(r#"<div class="notebook-"#)
        || output.contains(r#"<div class="text-sm text-muted-foreground italic">"#)
}

/// Classify raw output (or an error) into a renderable container.
///
/// Errors win. Empty output becomes [`NO_OUTPUT`]. Output that is already
/// formatted passes through; other markup is wrapped as an HTML fragment;
/// anything else is treated as stream text.
pub fn format_output(output: &str, error: Option<&str>) -> String {
    if let Some(error) = error {
        return format!(r#"<pre class="notebook-error-output">{}</pre>"#, escape(error));
    }

    if output.trim().is_empty() {
        return NO_OUTPUT.to_string();
    }

    if is_formatted(output) {
        return output.to_string();
    }

    if output.contains('<') && output.contains('>') {
        return format!(r#"<div class="notebook-html-output">{}</div>"#, output);
    }

    stream_output(output)
}
