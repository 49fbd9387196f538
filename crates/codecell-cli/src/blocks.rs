//! Extraction of runnable Python blocks from content files.
//!
//! - Markdown: fenced blocks tagged `python`, `py` or `python3`
//! - Jupyter notebooks: code cells
//! - Python scripts: the whole file

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Fence info strings that mark a runnable block.
const PYTHON_TAGS: &[&str] = &["python", "py", "python3"];

/// Where a block came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Markdown line of the opening fence (1-based).
    Line(usize),
    /// Notebook cell index (1-based, counting every cell).
    Cell(usize),
    /// The whole file.
    File,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Line(line) => write!(f, "line {}", line),
            Location::Cell(cell) => write!(f, "cell {}", cell),
            Location::File => write!(f, "file"),
        }
    }
}

/// A runnable block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub location: Location,
    pub source: String,
}

/// Extract the runnable blocks of `path`, choosing the format by extension.
pub fn extract(path: &Path) -> anyhow::Result<Vec<CodeBlock>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("ipynb") => from_notebook(&text)
            .with_context(|| format!("Failed to parse notebook {}", path.display())),
        Some("py") => Ok(from_script(&text)),
        _ => Ok(from_markdown(&text)),
    }
}

/// A Python script is one block.
pub fn from_script(text: &str) -> Vec<CodeBlock> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    vec![CodeBlock {
        location: Location::File,
        source: text.to_string(),
    }]
}

/// An open fenced block while scanning Markdown.
struct Fence<'a> {
    marker: char,
    width: usize,
    line: usize,
    runnable: bool,
    lines: Vec<&'a str>,
}

impl Fence<'_> {
    fn into_block(self) -> Option<CodeBlock> {
        if !self.runnable {
            return None;
        }
        Some(CodeBlock {
            location: Location::Line(self.line),
            source: self.lines.join("\n"),
        })
    }
}

/// Fence character and run length at the start of `line`, if it opens or
/// closes a fenced block.
fn fence_run(line: &str) -> Option<(char, usize)> {
    let marker = line.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let width = line.chars().take_while(|c| *c == marker).count();
    (width >= 3).then_some((marker, width))
}

/// Fenced Python blocks of a Markdown document.
pub fn from_markdown(text: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut open: Option<Fence<'_>> = None;

    for (index, line) in text.lines().enumerate() {
        let trimmed = line.trim_start();

        match open.take() {
            None => {
                if let Some((marker, width)) = fence_run(trimmed) {
                    let info = trimmed[width * marker.len_utf8()..].trim();
                    let language = info
                        .split(|c: char| c.is_whitespace() || c == '{' || c == ',')
                        .next()
                        .unwrap_or("")
                        .to_ascii_lowercase();
                    open = Some(Fence {
                        marker,
                        width,
                        line: index + 1,
                        runnable: PYTHON_TAGS.contains(&language.as_str()),
                        lines: Vec::new(),
                    });
                }
            }
            Some(mut fence) => {
                let closes = fence_run(trimmed).is_some_and(|(marker, width)| {
                    marker == fence.marker
                        && width >= fence.width
                        && trimmed[width * marker.len_utf8()..].trim().is_empty()
                });
                if closes {
                    blocks.extend(fence.into_block());
                } else {
                    fence.lines.push(line);
                    open = Some(fence);
                }
            }
        }
    }

    // An unclosed fence runs to the end of the document.
    if let Some(fence) = open {
        blocks.extend(fence.into_block());
    }

    blocks.retain(|block| !block.source.trim().is_empty());
    blocks
}

#[derive(Deserialize)]
struct Notebook {
    cells: Vec<NotebookCell>,
}

#[derive(Deserialize)]
struct NotebookCell {
    cell_type: String,
    #[serde(default)]
    source: CellSource,
}

/// Cell source: one string, or a list of lines that keep their newlines.
#[derive(Deserialize)]
#[serde(untagged)]
enum CellSource {
    Text(String),
    Lines(Vec<String>),
}

impl Default for CellSource {
    fn default() -> Self {
        CellSource::Text(String::new())
    }
}

impl CellSource {
    fn into_text(self) -> String {
        match self {
            CellSource::Text(text) => text,
            CellSource::Lines(lines) => lines.concat(),
        }
    }
}

/// Code cells of a Jupyter notebook.
pub fn from_notebook(text: &str) -> anyhow::Result<Vec<CodeBlock>> {
    let notebook: Notebook = serde_json::from_str(text)?;

    Ok(notebook
        .cells
        .into_iter()
        .enumerate()
        .filter(|(_, cell)| cell.cell_type == "code")
        .map(|(index, cell)| CodeBlock {
            location: Location::Cell(index + 1),
            source: cell.source.into_text(),
        })
        .filter(|block| !block.source.trim().is_empty())
        .collect())
}
