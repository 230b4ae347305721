//! Tag grammar, normalization, and extraction from converted Markdown.

use unicode_normalization::UnicodeNormalization;

use crate::models::TagSource;

/// Normalize a raw tag string to its canonical form (NFC, lowercase) and
/// validate it against the tag grammar. Returns `None` for anything outside
/// the grammar rather than erroring — callers filter out invalid tags
/// silently, matching how stray `#` characters in body text are ignored.
pub fn normalize_tag(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let normalized: String = trimmed.nfc().collect::<String>().to_lowercase();

    if is_valid_tag(&normalized) {
        Some(normalized)
    } else {
        None
    }
}

/// Unicode letters/digits, `.`, `-`, `/`; no leading/trailing/double `/`, no
/// whitespace.
fn is_valid_tag(tag: &str) -> bool {
    if tag.is_empty() {
        return false;
    }
    if tag.starts_with('/') || tag.ends_with('/') || tag.contains("//") {
        return false;
    }
    tag.chars()
        .all(|c| c.is_alphanumeric() || c == '.' || c == '-' || c == '/')
}

/// Extract tags from YAML frontmatter's `tags:` field (already parsed into a
/// list of raw strings by the caller) plus inline `#hashtag` occurrences in
/// the body, outside code spans/fences.
pub fn extract_tags(frontmatter_tags: &[String], body: &str) -> Vec<(String, TagSource)> {
    let mut out = Vec::new();

    for raw in frontmatter_tags {
        if let Some(tag) = normalize_tag(raw) {
            out.push((tag, TagSource::Frontmatter));
        }
    }

    for tag in extract_body_hashtags(body) {
        out.push((tag, TagSource::Body));
    }

    out
}

fn extract_body_hashtags(body: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut in_fence = false;
    let mut chars = body.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if body[i..].starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if c == '`' {
            // skip inline code span
            if let Some(end) = body[i + 1..].find('`') {
                for _ in 0..=end {
                    chars.next();
                }
            }
            continue;
        }
        if c == '#' {
            let preceded_by_word = i > 0
                && body[..i]
                    .chars()
                    .last()
                    .map(|p| p.is_alphanumeric())
                    .unwrap_or(false);
            if preceded_by_word {
                continue;
            }
            let rest = &body[i + 1..];
            let end = rest
                .find(|c: char| c.is_whitespace() || "#[]()*_,.;:!?\"'".contains(c))
                .unwrap_or(rest.len());
            let candidate = &rest[..end];
            if !candidate.is_empty() {
                if let Some(tag) = normalize_tag(candidate) {
                    tags.push(tag);
                }
            }
        }
    }

    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_nfc() {
        assert_eq!(normalize_tag("Important"), Some("important".to_string()));
    }

    #[test]
    fn rejects_leading_trailing_slash() {
        assert_eq!(normalize_tag("/foo"), None);
        assert_eq!(normalize_tag("foo/"), None);
        assert_eq!(normalize_tag("foo//bar"), None);
    }

    #[test]
    fn rejects_spaces() {
        assert_eq!(normalize_tag("foo bar"), None);
    }

    #[test]
    fn allows_nested_tags() {
        assert_eq!(normalize_tag("project/alpha"), Some("project/alpha".to_string()));
    }

    #[test]
    fn extracts_body_hashtags() {
        let tags = extract_body_hashtags("This is #work related to #project/alpha.");
        assert_eq!(tags, vec!["work".to_string(), "project/alpha".to_string()]);
    }

    #[test]
    fn ignores_hashtags_in_code_fences() {
        let tags = extract_body_hashtags("```\n#notatag\n```\n\nReal #tag here.");
        assert_eq!(tags, vec!["tag".to_string()]);
    }

    #[test]
    fn ignores_markdown_headings() {
        // a `#` directly followed by space at line start is a heading marker
        // in practice, but since headings are usually `# Title` the digit
        // check only excludes a preceding word character, not position.
        let tags = extract_body_hashtags("word#nottag #realtag");
        assert_eq!(tags, vec!["realtag".to_string()]);
    }
}
