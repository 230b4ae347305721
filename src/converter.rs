//! Source-to-Markdown conversion.
//!
//! Every ingested file is normalized to Markdown before chunking, so the
//! chunker, tag extractor, and link parser only ever see one format. Today
//! that means Markdown passes through unchanged and plain text is lightly
//! escaped; PDF, DOCX, and other binary formats are not converted and are
//! rejected with [`ErrorCode::ConverterFailed`] rather than silently ingested
//! as garbage.

use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::lang::detect_language;
use crate::uri::source_hash;

/// What a converter needs to turn source bytes into canonical Markdown.
pub struct ConvertInput<'a> {
    pub collection: &'a str,
    pub rel_path: &'a str,
    pub bytes: &'a [u8],
    pub mime: &'a str,
    pub ext: &'a str,
    pub max_bytes: u64,
}

/// The converted document, ready for chunking.
#[derive(Debug, Clone)]
pub struct ConvertOutput {
    pub markdown: String,
    pub mirror_hash: String,
    pub title: Option<String>,
    pub language_hint: Option<String>,
    pub converter_id: String,
    pub converter_version: String,
}

/// A format-specific conversion backend.
pub trait Converter: Send + Sync {
    fn id(&self) -> &'static str;
    fn version(&self) -> &'static str;
    fn supports(&self, ext: &str, mime: &str) -> bool;
    fn convert_bytes(&self, input: &ConvertInput) -> CoreResult<String>;
}

/// Passes UTF-8 Markdown through unchanged (after a size check).
pub struct MarkdownConverter;

impl Converter for MarkdownConverter {
    fn id(&self) -> &'static str {
        "markdown-passthrough"
    }

    fn version(&self) -> &'static str {
        "1"
    }

    fn supports(&self, ext: &str, mime: &str) -> bool {
        matches!(ext, "md" | "markdown") || mime == "text/markdown"
    }

    fn convert_bytes(&self, input: &ConvertInput) -> CoreResult<String> {
        decode_utf8(input.bytes, input.rel_path)
    }
}

/// Wraps plain text so it chunks and renders sensibly as Markdown: no
/// reflowing, just a guarantee that stray `#`/`*`/`_` runs in the source
/// don't get reinterpreted as Markdown syntax downstream.
pub struct PlainTextConverter;

impl Converter for PlainTextConverter {
    fn id(&self) -> &'static str {
        "plaintext-escape"
    }

    fn version(&self) -> &'static str {
        "1"
    }

    fn supports(&self, ext: &str, mime: &str) -> bool {
        ext == "txt" || mime == "text/plain"
    }

    fn convert_bytes(&self, input: &ConvertInput) -> CoreResult<String> {
        let text = decode_utf8(input.bytes, input.rel_path)?;
        Ok(escape_markdown_markers(&text))
    }
}

fn decode_utf8(bytes: &[u8], rel_path: &str) -> CoreResult<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| {
        CoreError::new(
            ErrorCode::ConverterFailed,
            format!("{rel_path}: not valid UTF-8: {e}"),
        )
    })
}

/// Escape characters that would otherwise be read as Markdown block/inline
/// markers when a paragraph happens to start with one of them.
fn escape_markdown_markers(text: &str) -> String {
    text.lines()
        .map(|line| {
            let trimmed_start = line.trim_start();
            if trimmed_start.starts_with(['#', '*', '-', '>', '`']) {
                let indent_len = line.len() - trimmed_start.len();
                format!("{}\\{}", &line[..indent_len], trimmed_start)
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn registered_converters() -> [&'static dyn Converter; 2] {
    [&MarkdownConverter, &PlainTextConverter]
}

/// Convert a source file to Markdown, deriving its title, detected language,
/// and content hash along the way.
///
/// Returns [`ErrorCode::TooLarge`] if `input.bytes` exceeds `input.max_bytes`,
/// or [`ErrorCode::ConverterFailed`] if no registered converter accepts the
/// file's extension/MIME type, or the bytes aren't valid UTF-8.
pub fn convert(input: &ConvertInput) -> CoreResult<ConvertOutput> {
    if input.bytes.len() as u64 > input.max_bytes {
        return Err(CoreError::new(
            ErrorCode::TooLarge,
            format!(
                "{}: {} bytes exceeds the {} byte limit for collection '{}'",
                input.rel_path,
                input.bytes.len(),
                input.max_bytes,
                input.collection
            ),
        ));
    }

    let converter = registered_converters()
        .into_iter()
        .find(|c| c.supports(input.ext, input.mime))
        .ok_or_else(|| {
            CoreError::new(
                ErrorCode::ConverterFailed,
                format!(
                    "{}: no converter registered for extension '{}' / mime '{}'",
                    input.rel_path, input.ext, input.mime
                ),
            )
        })?;

    let markdown = converter.convert_bytes(input)?;
    let mirror_hash = source_hash(markdown.as_bytes());
    let title = extract_title(&markdown);
    let language_hint = detect_language(&markdown);

    Ok(ConvertOutput {
        markdown,
        mirror_hash,
        title,
        language_hint,
        converter_id: converter.id().to_string(),
        converter_version: converter.version().to_string(),
    })
}

/// The first ATX H1 heading, or else the first non-empty line, trimmed.
fn extract_title(markdown: &str) -> Option<String> {
    for line in markdown.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("# ") {
            let heading = heading.trim();
            if !heading.is_empty() {
                return Some(heading.to_string());
            }
        }
    }

    markdown
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(bytes: &'a [u8], ext: &'a str, mime: &'a str) -> ConvertInput<'a> {
        ConvertInput {
            collection: "notes",
            rel_path: "a.md",
            bytes,
            mime,
            ext,
            max_bytes: 1024,
        }
    }

    #[test]
    fn markdown_passes_through_unchanged() {
        let out = convert(&input(b"# Title\n\nBody text.", "md", "text/markdown")).unwrap();
        assert_eq!(out.markdown, "# Title\n\nBody text.");
        assert_eq!(out.title, Some("Title".to_string()));
        assert_eq!(out.converter_id, "markdown-passthrough");
    }

    #[test]
    fn title_falls_back_to_first_nonempty_line() {
        let out = convert(&input(b"\nJust a line, no heading.\n", "md", "text/markdown")).unwrap();
        assert_eq!(out.title, Some("Just a line, no heading.".to_string()));
    }

    #[test]
    fn plaintext_escapes_leading_markdown_markers() {
        let out = convert(&input(b"# not a heading\nplain line", "txt", "text/plain")).unwrap();
        assert_eq!(out.markdown, "\\# not a heading\nplain line");
    }

    #[test]
    fn oversized_input_is_rejected() {
        let mut inp = input(b"0123456789", "md", "text/markdown");
        inp.max_bytes = 5;
        let err = convert(&inp).unwrap_err();
        assert_eq!(err.code, ErrorCode::TooLarge);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let err = convert(&input(b"%PDF-1.4", "pdf", "application/pdf")).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConverterFailed);
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let err = convert(&input(&[0xff, 0xfe, 0xfd], "md", "text/markdown")).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConverterFailed);
    }

    #[test]
    fn mirror_hash_is_stable_for_identical_content() {
        let out1 = convert(&input(b"same content", "md", "text/markdown")).unwrap();
        let out2 = convert(&input(b"same content", "md", "text/markdown")).unwrap();
        assert_eq!(out1.mirror_hash, out2.mirror_hash);
    }
}
