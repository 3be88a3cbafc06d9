//! Hands YAML documents to the operator for editing.
//!
//! Each document is shown with a comment guide on top, terminated by
//! [`HELPER_COMMENT_FOOTER`]. Everything up to the footer is dropped from the
//! edited text, together with empty lines.
use std::env;
use std::fs;
use std::io::Write;
use std::process::Command;

use anyhow::Context;
use regex::Regex;

/// Marks the end of the comment guide. Everything above it is discarded.
pub const HELPER_COMMENT_FOOTER: &str = "# ------- everything below will be written -------\n";

lazy_static::lazy_static! {
    static ref HELPER_COMMENTS: Regex = Regex::new(&format!(
        "(?s).*?{} *",
        regex::escape(HELPER_COMMENT_FOOTER)
    ))
    .expect("helper comment pattern is valid");
}

/// Lets an operator change a text document.
pub trait Editor {
    /// Returns `content` as changed by the operator.
    fn edit(&self, content: &str) -> anyhow::Result<String>;
}

/// Opens the document in `$VISUAL`, `$EDITOR` or `vi`, in that order.
#[derive(Clone, Debug, Default)]
pub struct ExternalEditor;

impl ExternalEditor {
    fn command() -> String {
        ["VISUAL", "EDITOR"]
            .iter()
            .filter_map(|var| env::var(var).ok())
            .find(|cmd| !cmd.trim().is_empty())
            .unwrap_or_else(|| "vi".to_string())
    }
}

impl Editor for ExternalEditor {
    fn edit(&self, content: &str) -> anyhow::Result<String> {
        let mut file = tempfile::Builder::new()
            .prefix("k8sd-recover-")
            .suffix(".yaml")
            .tempfile()
            .context("failed to create temporary file")?;
        file.write_all(content.as_bytes())
            .context("failed to write temporary file")?;
        file.as_file().sync_all()?;

        let command = Self::command();
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("no editor configured"))?;
        let status = Command::new(program)
            .args(parts)
            .arg(file.path())
            .status()
            .with_context(|| format!("failed to start editor {}", program))?;
        if !status.success() {
            anyhow::bail!("editor {} exited with {}", program, status);
        }

        fs::read_to_string(file.path()).context("failed to read edited file")
    }
}

/// Drops everything up to and including the helper comment footer.
pub fn strip_helper_comments(content: &str) -> String {
    HELPER_COMMENTS.replace_all(content, "").into_owned()
}

/// Drops lines that are empty or only hold whitespace.
pub fn remove_empty_lines(content: &str) -> String {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| format!("{}\n", line))
        .collect()
}

/// Turns every line of `content` into a YAML comment line.
pub fn yaml_comment_lines(content: &str) -> String {
    content
        .lines()
        .map(|line| match line {
            "" => "#\n".to_string(),
            line => format!("# {}\n", line),
        })
        .collect()
}

/// Shows `guide` followed by `current` to the operator and returns the
/// edited text with the guide and empty lines removed.
pub fn edit_with_guide(editor: &dyn Editor, guide: &str, current: &str) -> anyhow::Result<String> {
    let content = format!("{}\n{}", guide, current);
    let edited = editor.edit(&content)?;
    Ok(remove_empty_lines(&strip_helper_comments(&edited)))
}
