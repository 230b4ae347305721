//! Lightweight, deterministic language detection for chunk tagging.
//!
//! This is not meant to rival a real language-ID model — it is a single-pass
//! heuristic cheap enough to run per chunk: classify CJK scripts by codepoint
//! range, and otherwise fall back to marker-word frequency for a handful of
//! Latin-script languages. Below a minimum length the text is left
//! undetermined rather than guessed at.

const MIN_LEN_FOR_DETECTION: usize = 50;
const CJK_THRESHOLD: f64 = 0.10;
const MARKER_THRESHOLD: f64 = 0.02;

/// Detect a language code for `text`, or `None` if the signal is too weak.
pub fn detect_language(text: &str) -> Option<String> {
    if text.chars().filter(|c| !c.is_whitespace()).count() < MIN_LEN_FOR_DETECTION {
        return None;
    }

    if let Some(cjk) = detect_cjk(text) {
        return Some(cjk);
    }

    detect_latin_marker_language(text)
}

fn detect_cjk(text: &str) -> Option<String> {
    let mut hiragana_katakana = 0usize;
    let mut hangul = 0usize;
    let mut han = 0usize;
    let mut non_ws = 0usize;

    for c in text.chars() {
        if c.is_whitespace() {
            continue;
        }
        non_ws += 1;
        let cp = c as u32;
        match cp {
            0x3040..=0x30FF => hiragana_katakana += 1,
            0xAC00..=0xD7A3 => hangul += 1,
            0x4E00..=0x9FFF => han += 1,
            _ => {}
        }
    }

    if non_ws == 0 {
        return None;
    }

    let cjk_total = hiragana_katakana + hangul + han;
    if (cjk_total as f64) / (non_ws as f64) < CJK_THRESHOLD {
        return None;
    }

    if hiragana_katakana > 0 {
        Some("ja".to_string())
    } else if hangul > 0 {
        Some("ko".to_string())
    } else {
        Some("zh".to_string())
    }
}

/// Marker words chosen to be common function words unlikely to appear as
/// false positives across these four languages.
fn markers() -> [(&'static str, &'static [&'static str]); 4] {
    [
        (
            "en",
            &["the", "and", "of", "to", "in", "is", "that", "for", "with"],
        ),
        (
            "de",
            &["der", "die", "das", "und", "ist", "nicht", "mit", "auch"],
        ),
        (
            "fr",
            &["le", "la", "les", "et", "est", "des", "une", "pour"],
        ),
        (
            "it",
            &["il", "la", "che", "di", "per", "non", "con", "una"],
        ),
    ]
}

fn detect_latin_marker_language(text: &str) -> Option<String> {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();

    if words.is_empty() {
        return None;
    }

    let total = words.len() as f64;
    let mut best: Option<(&'static str, f64)> = None;

    for (lang, marker_words) in markers() {
        let count = words.iter().filter(|w| marker_words.contains(&w.as_str())).count();
        let ratio = count as f64 / total;
        if ratio >= MARKER_THRESHOLD && best.map(|(_, r)| ratio > r).unwrap_or(true) {
            best = Some((lang, ratio));
        }
    }

    best.map(|(lang, _)| lang.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_undetermined() {
        assert_eq!(detect_language("hi there"), None);
    }

    #[test]
    fn detects_english() {
        let text = "The quick brown fox jumps over the lazy dog and then runs away with the ball for a while.";
        assert_eq!(detect_language(text), Some("en".to_string()));
    }

    #[test]
    fn detects_japanese() {
        let text = "これは日本語のテキストです。ひらがなとカタカナと漢字が含まれています。".repeat(2);
        assert_eq!(detect_language(&text), Some("ja".to_string()));
    }

    #[test]
    fn detects_korean() {
        let text = "이것은 한국어 텍스트입니다 여러 단어가 포함되어 있습니다 확인용 문장입니다".repeat(2);
        assert_eq!(detect_language(&text), Some("ko".to_string()));
    }
}
