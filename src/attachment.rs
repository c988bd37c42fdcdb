use std::collections::HashSet;
use std::path::Path;

use crate::error::AttachmentError;

pub const MAX_ATTACHMENT_LINES: usize = 200;

const ATTACHMENT_NOTE: &str =
    "[This is the content of a text file sent by the user. Interpret or summarize it if possible:]";

// Extensions whose media type is `text/*`.
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "text", "md", "markdown", "csv", "tsv", "log", "html", "htm", "css", "xml", "ics",
    "vtt", "srt", "rtf", "conf", "ini",
];

/// A file staged for the next send.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub name: String,
    pub reference: String,
    pub extracted_text: Option<String>,
}

impl Attachment {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, AttachmentError> {
        let path = path.as_ref();
        let io_error = |source| AttachmentError::Io {
            path: path.to_path_buf(),
            source,
        };

        let canonical = tokio::fs::canonicalize(path).await.map_err(io_error)?;
        let extracted_text = if is_text_file(&canonical) {
            let raw = tokio::fs::read(&canonical).await.map_err(io_error)?;
            Some(extract_text(&String::from_utf8_lossy(&raw)))
        } else {
            None
        };

        Ok(Self {
            name: canonical
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            reference: file_reference(&canonical),
            extracted_text,
        })
    }

    pub fn is_text(&self) -> bool {
        self.extracted_text.is_some()
    }
}

pub fn is_text_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            TEXT_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// First [`MAX_ATTACHMENT_LINES`] lines of `raw`, duplicates removed keeping
/// the first occurrence.
pub fn extract_text(raw: &str) -> String {
    let mut seen = HashSet::new();
    raw.split('\n')
        .take(MAX_ATTACHMENT_LINES)
        .filter(|line| seen.insert(*line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Text of the outgoing user message, with any extracted file content
/// appended after a note telling the model what it is.
pub fn compose_user_content(input: &str, extracted: Option<&str>) -> String {
    let input = input.trim();
    match extracted {
        Some(text) if !text.is_empty() => format!("{input}\n\n{ATTACHMENT_NOTE}\n\n{text}"),
        _ => input.to_string(),
    }
}

fn file_reference(path: &Path) -> String {
    match reqwest::Url::from_file_path(path) {
        Ok(url) => url.to_string(),
        Err(()) => format!("file://{}", path.to_string_lossy().replace('\\', "/")),
    }
}
