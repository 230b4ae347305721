//! Markdown/wiki link parsing, normalization, and resolution.
//!
//! Parsing is pure (text in, structured links out) and independent of the
//! store; resolution takes a candidate list the caller assembles from the
//! store (kept out of this module so it stays unit-testable without a
//! database).

use unicode_normalization::UnicodeNormalization;

use crate::models::{Link, LinkSource, LinkType};

/// A link freshly parsed out of a document's Markdown, before resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLink {
    pub target_ref: String,
    pub target_ref_norm: String,
    pub target_anchor: Option<String>,
    pub target_collection: Option<String>,
    pub link_type: LinkType,
    pub link_text: Option<String>,
    pub start_line: i64,
    pub start_col: i64,
    pub end_line: i64,
    pub end_col: i64,
}

impl ParsedLink {
    pub fn into_link(self, source_document_id: i64, ordinal: i64) -> Link {
        Link {
            source_document_id,
            ordinal,
            target_ref: self.target_ref,
            target_ref_norm: self.target_ref_norm,
            target_anchor: self.target_anchor,
            target_collection: self.target_collection,
            link_type: self.link_type,
            link_text: self.link_text,
            start_line: self.start_line,
            start_col: self.start_col,
            end_line: self.end_line,
            end_col: self.end_col,
            source: LinkSource::Parsed,
        }
    }
}

/// A minimal view of a document, sufficient for link resolution tie-breaks.
#[derive(Debug, Clone)]
pub struct ResolutionCandidate {
    pub document_id: i64,
    pub docid: String,
    pub collection: String,
    pub rel_path: String,
    pub title: Option<String>,
}

/// Byte ranges (start, end) that must not contribute parsed links: fenced
/// code blocks, inline code spans, HTML comments, and leading YAML
/// frontmatter.
pub fn excluded_ranges(markdown: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();

    if let Some(fm_end) = frontmatter_end(markdown) {
        ranges.push((0, fm_end));
    }

    let bytes = markdown.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if markdown[i..].starts_with("```") {
            if let Some(rel_end) = markdown[i + 3..].find("```") {
                let end = i + 3 + rel_end + 3;
                ranges.push((i, end));
                i = end;
                continue;
            } else {
                ranges.push((i, markdown.len()));
                break;
            }
        }
        if bytes[i] == b'`' {
            if let Some(rel_end) = markdown[i + 1..].find('`') {
                let end = i + 1 + rel_end + 1;
                ranges.push((i, end));
                i = end;
                continue;
            }
        }
        if markdown[i..].starts_with("<!--") {
            if let Some(rel_end) = markdown[i + 4..].find("-->") {
                let end = i + 4 + rel_end + 3;
                ranges.push((i, end));
                i = end;
                continue;
            }
        }
        i += next_char_len(markdown, i);
    }

    ranges
}

fn next_char_len(s: &str, i: usize) -> usize {
    s[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1)
}

fn frontmatter_end(markdown: &str) -> Option<usize> {
    if !markdown.starts_with("---\n") && markdown != "---" {
        return None;
    }
    let after = &markdown[4..];
    let close = after.find("\n---")?;
    Some(4 + close + 4)
}

fn is_excluded(pos: usize, ranges: &[(usize, usize)]) -> bool {
    ranges.iter().any(|(s, e)| pos >= *s && pos < *e)
}

/// Parse all wiki-style and Markdown links out of `markdown`, dropping any
/// whose start falls inside an excluded range. Output is sorted by
/// `(start_line, start_col)`.
pub fn parse_links(markdown: &str) -> Vec<ParsedLink> {
    let ranges = excluded_ranges(markdown);
    let mut links = Vec::new();

    links.extend(parse_wiki_links(markdown, &ranges));
    links.extend(parse_markdown_links(markdown, &ranges));

    links.sort_by_key(|l| (l.start_line, l.start_col));
    links
}

fn line_col_at(markdown: &str, byte_pos: usize) -> (i64, i64) {
    let mut line = 1i64;
    let mut col = 1i64;
    for (i, c) in markdown.char_indices() {
        if i >= byte_pos {
            break;
        }
        if c == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

fn parse_wiki_links(markdown: &str, ranges: &[(usize, usize)]) -> Vec<ParsedLink> {
    let mut out = Vec::new();
    let bytes = markdown.as_bytes();
    let mut i = 0;

    while i + 1 < bytes.len() {
        if bytes[i] == b'[' && bytes[i + 1] == b'[' {
            if let Some(rel_close) = markdown[i + 2..].find("]]") {
                let inner_start = i + 2;
                let inner_end = inner_start + rel_close;
                let inner = &markdown[inner_start..inner_end];
                let full_end = inner_end + 2;

                if !is_excluded(i, ranges) {
                    if let Some(link) = build_wiki_link(markdown, inner, i, full_end) {
                        out.push(link);
                    }
                }
                i = full_end;
                continue;
            }
        }
        i += next_char_len(markdown, i);
    }

    out
}

fn build_wiki_link(markdown: &str, inner: &str, start: usize, end: usize) -> Option<ParsedLink> {
    if inner.is_empty() {
        return None;
    }

    let (ref_part, display) = match inner.split_once('|') {
        Some((r, d)) => (r, Some(d.to_string())),
        None => (inner, None),
    };

    let (ref_part, anchor) = match ref_part.split_once('#') {
        Some((r, a)) => (r, Some(a.to_string())),
        None => (ref_part, None),
    };

    let (collection, rel_ref) = match ref_part.split_once(':') {
        Some((c, r)) => (Some(c.to_string()), r.to_string()),
        None => (None, ref_part.to_string()),
    };

    if rel_ref.trim().is_empty() {
        return None;
    }

    let target_ref_norm = normalize_wiki_ref(&rel_ref);
    let link_text = display.filter(|d| d != &rel_ref);

    let (start_line, start_col) = line_col_at(markdown, start);
    let (end_line, end_col) = line_col_at(markdown, end);

    Some(ParsedLink {
        target_ref: rel_ref,
        target_ref_norm,
        target_anchor: anchor,
        target_collection: collection,
        link_type: LinkType::Wiki,
        link_text,
        start_line,
        start_col,
        end_line,
        end_col,
    })
}

/// NFC + lowercase + trim.
pub fn normalize_wiki_ref(raw: &str) -> String {
    raw.trim().nfc().collect::<String>().to_lowercase()
}

fn parse_markdown_links(markdown: &str, ranges: &[(usize, usize)]) -> Vec<ParsedLink> {
    let mut out = Vec::new();
    let bytes = markdown.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'[' {
            // skip image links: `![...]`
            let is_image = i > 0 && bytes[i - 1] == b'!';
            if let Some(rel_close) = markdown[i + 1..].find(']') {
                let text_end = i + 1 + rel_close;
                if text_end + 1 < bytes.len() && bytes[text_end + 1] == b'(' {
                    if let Some(rel_paren) = markdown[text_end + 2..].find(')') {
                        let url_start = text_end + 2;
                        let url_end = url_start + rel_paren;
                        let full_end = url_end + 1;

                        if !is_image && !is_excluded(i, ranges) {
                            let text = &markdown[i + 1..text_end];
                            let url = &markdown[url_start..url_end];
                            if let Some(link) = build_markdown_link(markdown, text, url, i, full_end) {
                                out.push(link);
                            }
                        }
                        i = full_end;
                        continue;
                    }
                }
            }
        }
        i += next_char_len(markdown, i);
    }

    out
}

fn build_markdown_link(
    markdown: &str,
    text: &str,
    url: &str,
    start: usize,
    end: usize,
) -> Option<ParsedLink> {
    if url.starts_with('#') || url.starts_with("//") || has_scheme(url) {
        return None;
    }
    if !url.ends_with(".md") && !url.contains(".md#") {
        return None;
    }

    let (path, anchor) = match url.split_once('#') {
        Some((p, a)) => (p, Some(a.to_string())),
        None => (url, None),
    };

    if path.is_empty() {
        return None;
    }

    let rel_path = percent_decode_except_slash(path);

    let (start_line, start_col) = line_col_at(markdown, start);
    let (end_line, end_col) = line_col_at(markdown, end);

    Some(ParsedLink {
        target_ref: rel_path.clone(),
        target_ref_norm: rel_path,
        target_anchor: anchor,
        target_collection: None,
        link_type: LinkType::Markdown,
        link_text: if text.is_empty() { None } else { Some(text.to_string()) },
        start_line,
        start_col,
        end_line,
        end_col,
    })
}

fn has_scheme(url: &str) -> bool {
    match url.find(':') {
        Some(idx) => url[..idx].chars().all(|c| c.is_alphanumeric() || c == '+' || c == '-' || c == '.') && idx > 0,
        None => false,
    }
}

fn percent_decode_except_slash(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &path[i + 1..i + 3];
            if hex.eq_ignore_ascii_case("2f") {
                out.push(b'%');
                i += 1;
                continue;
            }
            if let Ok(v) = u8::from_str_radix(hex, 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| path.to_string())
}

/// Resolve a relative path reference against `source_rel_path`'s directory,
/// rejecting anything that escapes the collection root or uses an absolute
/// or backslash form.
pub fn resolve_markdown_path(source_rel_path: &str, raw_ref: &str) -> Option<String> {
    if raw_ref.starts_with('/') || raw_ref.contains('\\') {
        return None;
    }

    let base_dir = std::path::Path::new(source_rel_path)
        .parent()
        .unwrap_or_else(|| std::path::Path::new(""));

    let mut stack: Vec<&str> = base_dir
        .to_str()
        .unwrap_or("")
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    for seg in raw_ref.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                stack.pop()?;
            }
            other => stack.push(other),
        }
    }

    Some(stack.join("/"))
}

/// Resolve a Markdown link's target against the candidate set.
pub fn resolve_markdown_link(
    candidates: &[ResolutionCandidate],
    normalized_rel_path: &str,
    collection: &str,
) -> Option<i64> {
    candidates
        .iter()
        .filter(|c| c.collection == collection)
        .find(|c| c.rel_path == normalized_rel_path)
        .map(|c| c.document_id)
}

/// Resolve a wiki link's target, in the deterministic precedence order:
/// exact `rel_path`, `rel_path + ".md"`, normalized `title` basename,
/// `rel_path` basename. Ties break on the smallest `document_id`.
pub fn resolve_wiki_link(
    candidates: &[ResolutionCandidate],
    ref_norm: &str,
    collection: Option<&str>,
) -> Option<i64> {
    let pool: Vec<&ResolutionCandidate> = match collection {
        Some(c) => candidates.iter().filter(|cand| cand.collection == c).collect(),
        None => candidates.iter().collect(),
    };

    let by_rel_path = |c: &&ResolutionCandidate| normalize_wiki_ref(&c.rel_path) == ref_norm;
    if let Some(id) = best_match(&pool, by_rel_path) {
        return Some(id);
    }

    let with_md = format!("{ref_norm}.md");
    let by_rel_path_md = |c: &&ResolutionCandidate| normalize_wiki_ref(&c.rel_path) == with_md;
    if let Some(id) = best_match(&pool, by_rel_path_md) {
        return Some(id);
    }

    let by_title = |c: &&ResolutionCandidate| {
        c.title
            .as_deref()
            .map(|t| basename(&normalize_wiki_ref(t)) == ref_norm)
            .unwrap_or(false)
    };
    if let Some(id) = best_match(&pool, by_title) {
        return Some(id);
    }

    let by_rel_basename = |c: &&ResolutionCandidate| basename(&normalize_wiki_ref(&c.rel_path)) == ref_norm;
    best_match(&pool, by_rel_basename)
}

fn best_match<'a>(
    pool: &[&'a ResolutionCandidate],
    pred: impl Fn(&&&'a ResolutionCandidate) -> bool,
) -> Option<i64> {
    pool.iter()
        .filter(pred)
        .map(|c| c.document_id)
        .min()
}

fn basename(rel_path: &str) -> String {
    let stem = rel_path.rsplit('/').next().unwrap_or(rel_path);
    stem.strip_suffix(".md").unwrap_or(stem).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: i64, collection: &str, rel_path: &str, title: Option<&str>) -> ResolutionCandidate {
        ResolutionCandidate {
            document_id: id,
            docid: format!("#{id:08x}"),
            collection: collection.to_string(),
            rel_path: rel_path.to_string(),
            title: title.map(|s| s.to_string()),
        }
    }

    #[test]
    fn parses_wiki_link_with_display_and_anchor() {
        let md = "See [[Wiki:FAQ#Billing|FAQ]] for details.";
        let links = parse_links(md);
        assert_eq!(links.len(), 1);
        let l = &links[0];
        assert_eq!(l.link_type, LinkType::Wiki);
        assert_eq!(l.target_ref, "FAQ");
        assert_eq!(l.target_anchor, Some("Billing".to_string()));
        assert_eq!(l.target_collection, Some("Wiki".to_string()));
        assert_eq!(l.link_text, Some("FAQ".to_string()));
    }

    #[test]
    fn parses_markdown_link() {
        let md = "[text](path.md#anchor)";
        let links = parse_links(md);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].link_type, LinkType::Markdown);
        assert_eq!(links[0].target_ref, "path.md");
        assert_eq!(links[0].target_anchor, Some("anchor".to_string()));
    }

    #[test]
    fn ignores_image_links() {
        let md = "![alt](image.png)";
        assert!(parse_links(md).is_empty());
    }

    #[test]
    fn ignores_scheme_and_fragment_only_links() {
        let md = "[ext](https://example.com/x.md) and [frag](#section)";
        assert!(parse_links(md).is_empty());
    }

    #[test]
    fn excludes_links_in_code_fences_and_inline_code() {
        let md = "```\n[[not a link]]\n```\n\n`[[also not]]`\n\n[[Real Link]]";
        let links = parse_links(md);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target_ref, "Real Link");
    }

    #[test]
    fn excludes_links_inside_frontmatter() {
        let md = "---\ntitle: [[not a link]]\n---\n\n[[Real]]";
        let links = parse_links(md);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target_ref, "Real");
    }

    #[test]
    fn resolve_markdown_path_rejects_escape() {
        assert_eq!(resolve_markdown_path("a/b.md", "../../../etc/passwd"), None);
    }

    #[test]
    fn resolve_markdown_path_relative() {
        assert_eq!(
            resolve_markdown_path("folder/a.md", "../b.md"),
            Some("b.md".to_string())
        );
    }

    #[test]
    fn wiki_resolution_precedence() {
        let candidates = vec![
            cand(5, "notes", "faq.md", Some("FAQ")),
            cand(2, "notes", "guides/faq.md", Some("Guides FAQ")),
        ];
        assert_eq!(resolve_wiki_link(&candidates, "faq", Some("notes")), Some(5));
        assert_eq!(
            resolve_wiki_link(&candidates, "guides/faq", Some("notes")),
            Some(2)
        );
    }

    #[test]
    fn wiki_resolution_tie_break_smallest_id() {
        let candidates = vec![
            cand(9, "notes", "a/faq.md", None),
            cand(3, "notes", "b/faq.md", None),
        ];
        assert_eq!(resolve_wiki_link(&candidates, "faq", Some("notes")), Some(3));
    }
}
