//! Document identifiers and canonical URIs.
//!
//! Every document has two handles: a short `docid` (`"#" + first 8 hex chars
//! of its source hash`) used for display and link resolution, and a
//! canonical `gno://<collection>/<relPath>` URI used for addressing. Both are
//! derived, never stored independently of `(collection, relPath, sourceHash)`.

use sha2::{Digest, Sha256};

use crate::error::{CoreError, ErrorCode};

/// Hex-encoded SHA-256 digest of raw file bytes.
pub fn source_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Derive the short document id from a source hash.
///
/// Panics if `source_hash` is shorter than 8 hex characters, which would
/// indicate a caller passed something other than a SHA-256 hex digest.
pub fn docid_from_source_hash(source_hash: &str) -> String {
    assert!(
        source_hash.len() >= 8,
        "source_hash must be at least 8 hex chars"
    );
    format!("#{}", &source_hash[..8])
}

/// Build the canonical `gno://<collection>/<relPath>` URI.
///
/// Each path segment is percent-encoded individually so that `/` remains a
/// segment separator; non-ASCII and reserved characters within a segment are
/// escaped.
pub fn build_uri(collection: &str, rel_path: &str) -> String {
    let encoded_segments: Vec<String> = rel_path
        .split('/')
        .map(|seg| percent_encode_segment(seg))
        .collect();
    format!("gno://{}/{}", collection, encoded_segments.join("/"))
}

/// Parse a canonical URI back into `(collection, relPath)`.
pub fn parse_uri(uri: &str) -> Result<(String, String), CoreError> {
    let rest = uri.strip_prefix("gno://").ok_or_else(|| {
        CoreError::new(ErrorCode::InvalidUri, format!("not a gno:// uri: {uri}"))
    })?;

    let (collection, path) = rest.split_once('/').ok_or_else(|| {
        CoreError::new(
            ErrorCode::InvalidUri,
            format!("uri missing path component: {uri}"),
        )
    })?;

    if collection.is_empty() || path.is_empty() {
        return Err(CoreError::new(
            ErrorCode::InvalidUri,
            format!("uri missing collection or path: {uri}"),
        ));
    }

    let decoded_segments: Result<Vec<String>, CoreError> = path
        .split('/')
        .map(|seg| percent_decode_segment(seg, uri))
        .collect();

    Ok((collection.to_string(), decoded_segments?.join("/")))
}

fn percent_encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn percent_decode_segment(segment: &str, uri: &str) -> Result<String, CoreError> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = segment.get(i + 1..i + 3).ok_or_else(|| {
                CoreError::new(
                    ErrorCode::InvalidUri,
                    format!("truncated percent-escape in uri: {uri}"),
                )
            })?;
            let value = u8::from_str_radix(hex, 16).map_err(|_| {
                CoreError::new(
                    ErrorCode::InvalidUri,
                    format!("invalid percent-escape in uri: {uri}"),
                )
            })?;
            out.push(value);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|_| CoreError::new(ErrorCode::InvalidUri, format!("non-utf8 uri segment: {uri}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docid_is_hash_prefix() {
        let hash = source_hash(b"# Hello World");
        let docid = docid_from_source_hash(&hash);
        assert_eq!(docid, format!("#{}", &hash[..8]));
        assert_eq!(docid.len(), 9);
    }

    #[test]
    fn uri_round_trips_plain_path() {
        let uri = build_uri("notes", "folder/hello.md");
        let (collection, rel_path) = parse_uri(&uri).unwrap();
        assert_eq!(collection, "notes");
        assert_eq!(rel_path, "folder/hello.md");
    }

    #[test]
    fn uri_round_trips_special_characters() {
        let uri = build_uri("notes", "a b/c#d.md");
        assert!(uri.contains("%20"));
        let (collection, rel_path) = parse_uri(&uri).unwrap();
        assert_eq!(collection, "notes");
        assert_eq!(rel_path, "a b/c#d.md");
    }

    #[test]
    fn rejects_non_gno_scheme() {
        assert!(parse_uri("https://example.com/x").is_err());
    }

    #[test]
    fn rejects_missing_path() {
        assert!(parse_uri("gno://notes").is_err());
    }
}
