//! Content normalization and fingerprinting.
//!
//! Converts raw, possibly markup-bearing source content into a canonical
//! plain-text form suitable for hashing and chunking: tags stripped, block
//! elements turned into line breaks, whitespace collapsed, control
//! characters removed. Normalization is a pure function; identical input
//! always yields byte-identical output, which is what makes fingerprint
//! comparison meaningful across runs and hosts.

use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::{Digest, Sha256};

use crate::error::PipelineError;
use crate::models::{NormalizedDocument, SourceDocument};

/// Tags that separate blocks of text. Start/end of any of these becomes a
/// line break in the canonical output.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "li", "ul", "ol", "h1", "h2", "h3", "h4", "h5", "h6", "tr", "table",
    "blockquote", "pre", "section", "article",
];

/// Normalize a source document and compute its fingerprint.
pub fn normalize_document(doc: &SourceDocument) -> Result<NormalizedDocument, PipelineError> {
    let canonical_text = normalize(&doc.id, &doc.raw_content)?;
    let fingerprint = fingerprint(&canonical_text);
    Ok(NormalizedDocument {
        id: doc.id.clone(),
        canonical_text,
        metadata: doc.metadata.clone(),
        fingerprint,
    })
}

/// Produce the canonical plain-text form of `raw`.
///
/// Content that does not look like markup passes through with only
/// whitespace normalization applied.
pub fn normalize(id: &str, raw: &str) -> Result<String, PipelineError> {
    let text = if looks_like_markup(raw) {
        strip_markup(id, raw)?
    } else {
        raw.to_string()
    };
    Ok(collapse_whitespace(&text))
}

/// Hex SHA-256 over the canonical text bytes. Stable across platforms and
/// process restarts.
pub fn fingerprint(canonical_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A `<` followed by a tag-like character is treated as markup; a bare `<`
/// in prose (`a < b`) is not.
fn looks_like_markup(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.windows(2).any(|w| {
        w[0] == b'<' && (w[1].is_ascii_alphabetic() || w[1] == b'/' || w[1] == b'!')
    })
}

/// Event-driven tag stripping. End-tag checking is relaxed because source
/// content is HTML-ish rather than well-formed XML; structurally broken
/// markup still fails and is surfaced as a per-document error.
fn strip_markup(id: &str, raw: &str) -> Result<String, PipelineError> {
    let mut reader = Reader::from_str(raw);
    reader.config_mut().check_end_names = false;
    reader.config_mut().allow_unmatched_ends = true;

    let mut out = String::with_capacity(raw.len());
    // Depth inside <script>/<style>, whose text content is dropped.
    let mut skip_depth = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref());
                if name == "script" || name == "style" {
                    skip_depth += 1;
                } else if is_block_tag(&name) {
                    out.push('\n');
                }
            }
            Ok(Event::End(e)) => {
                let name = local_name(e.name().as_ref());
                if name == "script" || name == "style" {
                    skip_depth = skip_depth.saturating_sub(1);
                } else if is_block_tag(&name) {
                    out.push('\n');
                }
            }
            Ok(Event::Empty(e)) => {
                if is_block_tag(&local_name(e.name().as_ref())) {
                    out.push('\n');
                }
            }
            Ok(Event::Text(t)) => {
                if skip_depth == 0 {
                    match t.unescape() {
                        Ok(s) => out.push_str(&s),
                        // Unknown entity (e.g. &nbsp;) — keep the raw text.
                        Err(_) => out.push_str(&String::from_utf8_lossy(t.as_ref())),
                    }
                }
            }
            Ok(Event::CData(t)) => {
                if skip_depth == 0 {
                    out.push_str(&String::from_utf8_lossy(t.as_ref()));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(PipelineError::Normalization {
                    id: id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    Ok(out)
}

fn local_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name).to_ascii_lowercase()
}

fn is_block_tag(name: &str) -> bool {
    BLOCK_TAGS.contains(&name)
}

/// Collapse runs of spaces/tabs to one space, trim line ends, reduce runs
/// of blank lines to a single blank line, and drop control characters.
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_blank = false;

    for line in text.lines() {
        let cleaned: String = line.chars().filter(|c| !c.is_control()).collect();
        let words: Vec<&str> = cleaned.split_whitespace().collect();
        if words.is_empty() {
            pending_blank = !out.is_empty();
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
            if pending_blank {
                out.push('\n');
            }
        }
        pending_blank = false;
        out.push_str(&words.join(" "));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_passthrough() {
        let text = normalize("a", "Hello world.").unwrap();
        assert_eq!(text, "Hello world.");
    }

    #[test]
    fn test_strips_tags_and_breaks_blocks() {
        let raw = "<h1>Title</h1><p>First <b>bold</b> paragraph.</p><p>Second.</p>";
        let text = normalize("a", raw).unwrap();
        assert_eq!(text, "Title\n\nFirst bold paragraph.\n\nSecond.");
    }

    #[test]
    fn test_decodes_entities() {
        let text = normalize("a", "<p>fish &amp; chips &lt;today&gt;</p>").unwrap();
        assert_eq!(text, "fish & chips <today>");
    }

    #[test]
    fn test_drops_script_and_style_content() {
        let raw = "<p>keep</p><script>var x = 1;</script><style>.a{}</style><p>also keep</p>";
        let text = normalize("a", raw).unwrap();
        assert_eq!(text, "keep\n\nalso keep");
    }

    #[test]
    fn test_collapses_whitespace() {
        let raw = "one   two\t three\n\n\n\nnext  paragraph\n";
        let text = normalize("a", raw).unwrap();
        assert_eq!(text, "one two three\n\nnext paragraph");
    }

    #[test]
    fn test_removes_control_characters() {
        let text = normalize("a", "be\u{0008}ep \u{0007}done").unwrap();
        assert_eq!(text, "beep done");
    }

    #[test]
    fn test_angle_brackets_in_prose_are_not_markup() {
        let text = normalize("a", "if a < b then b > a").unwrap();
        assert_eq!(text, "if a < b then b > a");
    }

    #[test]
    fn test_unclosed_br_is_tolerated() {
        let text = normalize("a", "<p>line one<br>line two</p>").unwrap();
        assert_eq!(text, "line one\nline two");
    }

    #[test]
    fn test_truncated_tag_is_a_normalization_error() {
        let err = normalize("doc-7", "prefix <div class=").unwrap_err();
        match err {
            PipelineError::Normalization { id, .. } => assert_eq!(id, "doc-7"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_normalization_is_deterministic() {
        let raw = "<p>Same   input</p>\n<p>every&amp;time</p>";
        let a = normalize("x", raw).unwrap();
        let b = normalize("x", raw).unwrap();
        assert_eq!(a, b);
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        assert_ne!(fingerprint("Hello world."), fingerprint("Hello world! Extra."));
        // 256-bit digest, hex encoded.
        assert_eq!(fingerprint("x").len(), 64);
    }
}
