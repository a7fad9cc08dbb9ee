//! Source file cleaning and the processed copy written next to the registry.

use std::fs;
use std::path::{Path, PathBuf};
use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};
use regex::Regex;
use sha2::{Digest, Sha256};
use crate::error::{Result, RagsyncError};
use crate::store::FileIdentity;

/// A cleaned document and where its chunks are filed
#[derive(Debug, Clone)]
pub struct ProcessedDocument {
    pub identity: FileIdentity,
    pub processed_path: PathBuf,
    pub text: String,
}

/// Normalizes whitespace after Markdown flattening
#[derive(Debug, Clone)]
pub struct TextCleaner {
    trailing_space: Regex,
    blank_runs: Regex,
}

impl TextCleaner {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| RagsyncError::Config(format!("Invalid pattern {}: {}", pattern, e)))
        };
        Ok(Self {
            trailing_space: compile(r"(?m)[ \t]+$")?,
            blank_runs: compile(r"\n{3,}")?,
        })
    }

    /// Clean `raw` according to the file's extension
    ///
    /// NUL characters are removed, line endings normalized and Markdown
    /// (`md`, `markdown`) flattened to plain text. Trailing spaces go and
    /// runs of blank lines collapse to one.
    pub fn clean(&self, raw: &str, extension: &str) -> String {
        let text = raw.replace('\0', "").replace("\r\n", "\n").replace('\r', "\n");
        let text = match extension.to_lowercase().as_str() {
            "md" | "markdown" => flatten_markdown(&text),
            _ => text,
        };

        let text = self.trailing_space.replace_all(&text, "");
        let text = self.blank_runs.replace_all(&text, "\n\n");
        let trimmed = text.trim();
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}\n", trimmed)
        }
    }
}

/// Drop a leading YAML frontmatter block
fn strip_frontmatter(content: &str) -> &str {
    if let Some(rest) = content.strip_prefix("---\n") {
        if let Some(end) = rest.find("\n---\n") {
            return &rest[end + 5..];
        }
    }
    content
}

/// Render Markdown as plain text, keeping headings, list items and code
fn flatten_markdown(content: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let mut out = String::with_capacity(content.len());
    // One entry per open list: next number for ordered lists
    let mut lists: Vec<Option<u64>> = Vec::new();

    for event in Parser::new_ext(strip_frontmatter(content), options) {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                out.push_str(&"#".repeat(level as usize));
                out.push(' ');
            }
            Event::End(TagEnd::Heading(_)) | Event::End(TagEnd::Paragraph) => out.push_str("\n\n"),
            Event::Start(Tag::List(first)) => {
                if !lists.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                lists.push(first);
            }
            Event::End(TagEnd::List(_)) => {
                lists.pop();
                if lists.is_empty() {
                    out.push('\n');
                }
            }
            Event::Start(Tag::Item) => {
                out.push_str(&"  ".repeat(lists.len().saturating_sub(1)));
                match lists.last_mut() {
                    Some(Some(n)) => {
                        out.push_str(&format!("{}. ", n));
                        *n += 1;
                    }
                    _ => out.push_str("- "),
                }
            }
            Event::End(TagEnd::Item) => {
                // Tight list items carry no paragraph end
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Event::Start(Tag::CodeBlock(kind)) => {
                let lang = match kind {
                    CodeBlockKind::Fenced(lang) => lang.to_string(),
                    CodeBlockKind::Indented => String::new(),
                };
                out.push_str(&format!("```{}\n", lang));
            }
            Event::End(TagEnd::CodeBlock) => out.push_str("```\n\n"),
            Event::End(TagEnd::TableCell) => out.push_str(" | "),
            Event::End(TagEnd::TableHead) | Event::End(TagEnd::TableRow) => out.push('\n'),
            Event::End(TagEnd::Table) => out.push('\n'),
            Event::Text(text) | Event::Code(text) => out.push_str(&text),
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            Event::Rule => out.push_str("---\n\n"),
            _ => {}
        }
    }
    out
}

/// Hex digits of the path tag appended to processed names
const PATH_TAG_LEN: usize = 12;

/// Name of the processed copy of `source`
///
/// `<stem>[_<dirs below the source root joined by _>][_<ext>]_<tag>.md`.
/// The readable part alone is ambiguous (`guide/a.md` and `a_guide.md`
/// read the same), so `<tag>` is a SHA-256 prefix of the path relative to
/// `source_root` and keeps each source file on its own processed copy.
pub fn processed_file_name(source_root: &Path, source: &Path) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let dirs: Vec<String> = source
        .parent()
        .and_then(|parent| parent.strip_prefix(source_root).ok())
        .map(|rel| rel.components().map(|c| c.as_os_str().to_string_lossy().to_string()).collect())
        .unwrap_or_default();

    let mut name = stem;
    if !dirs.is_empty() {
        name.push('_');
        name.push_str(&dirs.join("_"));
    }
    if let Some(ext) = source.extension().map(|e| e.to_string_lossy().to_lowercase()) {
        if ext != "md" {
            name.push('_');
            name.push_str(&ext);
        }
    }
    name.retain(|c| c != '\0');
    format!("{}_{}.md", name, path_tag(source_root, source))
}

fn path_tag(source_root: &Path, source: &Path) -> String {
    let relative = source.strip_prefix(source_root).unwrap_or(source);
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    let digest = format!("{:x}", Sha256::digest(parts.join("/").as_bytes()));
    digest[..PATH_TAG_LEN].to_string()
}

pub fn processed_path(source_root: &Path, processed_dir: &Path, source: &Path) -> PathBuf {
    processed_dir.join(processed_file_name(source_root, source))
}

/// Read, clean and write the processed copy of one source file
///
/// Invalid UTF-8 is replaced rather than rejected. The returned identity
/// files chunks under the processed copy and remembers the source path.
pub fn preprocess_file(
    cleaner: &TextCleaner,
    source_root: &Path,
    processed_dir: &Path,
    source: &Path,
) -> Result<ProcessedDocument> {
    let bytes = fs::read(source).map_err(|e| RagsyncError::FileProcessing {
        path: source.display().to_string(),
        reason: format!("cannot read: {}", e),
    })?;
    let extension = source
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();
    let text = cleaner.clean(&String::from_utf8_lossy(&bytes), &extension);

    let processed_path = processed_path(source_root, processed_dir, source);
    fs::create_dir_all(processed_dir)?;
    fs::write(&processed_path, &text).map_err(|e| RagsyncError::FileProcessing {
        path: source.display().to_string(),
        reason: format!("cannot write {}: {}", processed_path.display(), e),
    })?;
    log::debug!("Wrote processed copy {}", processed_path.display());

    let filename = processed_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    Ok(ProcessedDocument {
        identity: FileIdentity {
            filename,
            filepath: processed_path.to_string_lossy().to_string(),
            original_filepath: Some(source.to_string_lossy().to_string()),
        },
        processed_path,
        text,
    })
}
