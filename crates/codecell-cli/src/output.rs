//! Rendering of execution output for the terminal and for HTML pages.

use codecell_core::{ExecutionOutput, html};

use crate::blocks::CodeBlock;

/// Turn output HTML into plain terminal text.
///
/// Tags are dropped, figures become a `[figure]` placeholder and entities
/// are decoded. Every closed container ends on its own line.
pub fn to_terminal(markup: &str) -> String {
    let mut text = String::with_capacity(markup.len());
    let mut rest = markup;

    while let Some(start) = rest.find('<') {
        text.push_str(&rest[..start]);
        let Some(len) = rest[start..].find('>') else {
            text.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let tag = &rest[start..start + len + 1];
        if tag.starts_with("<img") {
            text.push_str("[figure]");
        } else if tag.starts_with("</pre") || tag.starts_with("</div") || tag.starts_with("</tr") {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
        } else if tag.starts_with("<td") || tag.starts_with("<th") {
            text.push('\t');
        }
        rest = &rest[start + len + 1..];
    }
    text.push_str(rest);

    unescape(&text)
}

/// Decode the entities produced by [`html::escape`] (and `&nbsp;`).
fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// CSS for the output containers, so an exported page reads like the site.
const PAGE_STYLE: &str = r#"
body { font-family: system-ui, sans-serif; max-width: 960px; margin: 2rem auto; padding: 0 1rem; color: #1f2328; }
h1 { font-size: 1.4rem; }
section { margin: 1.5rem 0; }
.codecell-location { color: #57606a; font-size: 0.8rem; margin-bottom: 0.25rem; }
.codecell-source { background: #f6f8fa; border: 1px solid #d0d7de; border-radius: 6px; padding: 0.75rem; overflow-x: auto; }
.codecell-output { border-left: 3px solid #d0d7de; padding-left: 0.75rem; margin-top: 0.5rem; }
pre { margin: 0; white-space: pre-wrap; }
.notebook-error-output { color: #cf222e; }
.notebook-tqdm-output { color: #0969da; }
.notebook-table-container { overflow-x: auto; }
.notebook-dataframe-output { border-collapse: collapse; }
.notebook-dataframe-output th, .notebook-dataframe-output td { border: 1px solid #d0d7de; padding: 0.2rem 0.5rem; }
.notebook-image-output img { max-width: 100%; }
.text-sm { font-size: 0.875rem; }
.text-muted-foreground { color: #57606a; }
.italic { font-style: italic; }
"#;

/// A standalone HTML page listing every block with its output.
pub fn render_page(title: &str, results: &[(CodeBlock, ExecutionOutput)]) -> String {
    let mut page = String::new();
    page.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
    page.push_str(&format!("<title>{}</title>\n", html::escape(title)));
    page.push_str(&format!("<style>{}</style>\n", PAGE_STYLE));
    page.push_str("</head>\n<body>\n");
    page.push_str(&format!("<h1>{}</h1>\n", html::escape(title)));

    for (block, output) in results {
        page.push_str("<section>\n");
        page.push_str(&format!(
            "<div class=\"codecell-location\">{}</div>\n",
            html::escape(&block.location.to_string())
        ));
        page.push_str(&format!(
            "<pre class=\"codecell-source\"><code>{}</code></pre>\n",
            html::escape(&block.source)
        ));
        page.push_str(&format!(
            "<div class=\"codecell-output\">{}</div>\n",
            output.html
        ));
        page.push_str("</section>\n");
    }

    page.push_str("</body>\n</html>\n");
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::Location;
    use codecell_core::ExecutionStatus;

    #[test]
    fn test_stream_and_value() {
        let markup = format!(
            "{}{}",
            html::stream_output("a < b"),
            html::text_output("'x' & \"y\"")
        );
        assert_eq!(to_terminal(&markup), "a < b\n'x' & \"y\"\n");
    }

    #[test]
    fn test_stderr_keeps_single_newline() {
        assert_eq!(to_terminal(&html::stderr_output("warn")), "warn\n");
    }

    #[test]
    fn test_figure_placeholder() {
        let markup = r#"<div class="notebook-image-output"><img src="data:image/png;base64,AAAA" alt="Plot output" /></div>"#;
        assert_eq!(to_terminal(markup), "[figure]\n");
    }

    #[test]
    fn test_no_output_sentinel() {
        assert_eq!(to_terminal(html::NO_OUTPUT), "No output\n");
    }

    #[test]
    fn test_escaped_entities_roundtrip() {
        assert_eq!(to_terminal("&amp;lt;"), "&lt;");
    }

    #[test]
    fn test_render_page_escapes_source() {
        let results = vec![(
            CodeBlock {
                location: Location::Line(3),
                source: "print('<b>')".to_string(),
            },
            ExecutionOutput {
                id: 2,
                html: html::stream_output("<b>"),
                status: ExecutionStatus::Completed,
            },
        )];
        let page = render_page("post.md", &results);
        assert!(page.contains("<title>post.md</title>"));
        assert!(page.contains("print(&#x27;&lt;b&gt;&#x27;)"));
        assert!(page.contains(r#"<pre class="notebook-stream-output">&lt;b&gt;</pre>"#));
        assert!(page.contains("line 3"));
    }
}
