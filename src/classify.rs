//! Change detection against tracked fingerprints.
//!
//! A document is classified by comparing its freshly computed fingerprint
//! with the fingerprint last recorded as successfully indexed. Deletions
//! are detected separately by reconciling tracked ids against the ids seen
//! in the current source pull; that pass runs at the end of every sync.

use std::collections::{HashMap, HashSet};

use crate::models::{Classification, IndexedDocumentRecord, NormalizedDocument};

/// Compare a document against its tracking record, if any.
pub fn classify(
    doc: &NormalizedDocument,
    known: Option<&IndexedDocumentRecord>,
) -> Classification {
    match known {
        None => Classification::New,
        Some(record) if record.fingerprint == doc.fingerprint => Classification::Unchanged,
        Some(_) => Classification::Changed,
    }
}

/// Tracked ids absent from the current pull, in deterministic order.
/// These documents were removed at the source and must be purged from
/// both indices.
pub fn deleted_ids(
    tracked: &HashMap<String, IndexedDocumentRecord>,
    seen: &HashSet<String>,
) -> Vec<String> {
    let mut ids: Vec<String> = tracked
        .keys()
        .filter(|id| !seen.contains(*id))
        .cloned()
        .collect();
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;
    use chrono::Utc;

    fn doc(fingerprint: &str) -> NormalizedDocument {
        NormalizedDocument {
            id: "A".to_string(),
            canonical_text: String::new(),
            metadata: Metadata::new(),
            fingerprint: fingerprint.to_string(),
        }
    }

    fn record(id: &str, fingerprint: &str) -> IndexedDocumentRecord {
        IndexedDocumentRecord {
            id: id.to_string(),
            fingerprint: fingerprint.to_string(),
            chunk_count: 1,
            indexed_at: Utc::now(),
        }
    }

    #[test]
    fn test_no_record_is_new() {
        assert_eq!(classify(&doc("f1"), None), Classification::New);
    }

    #[test]
    fn test_matching_fingerprint_is_unchanged() {
        let rec = record("A", "f1");
        assert_eq!(classify(&doc("f1"), Some(&rec)), Classification::Unchanged);
    }

    #[test]
    fn test_differing_fingerprint_is_changed() {
        let rec = record("A", "f1");
        assert_eq!(classify(&doc("f2"), Some(&rec)), Classification::Changed);
    }

    #[test]
    fn test_deleted_ids_are_tracked_minus_seen() {
        let mut tracked = HashMap::new();
        tracked.insert("A".to_string(), record("A", "f1"));
        tracked.insert("B".to_string(), record("B", "f2"));
        tracked.insert("C".to_string(), record("C", "f3"));

        let seen: HashSet<String> = ["B".to_string()].into();
        assert_eq!(deleted_ids(&tracked, &seen), vec!["A", "C"]);
    }

    #[test]
    fn test_nothing_deleted_when_all_seen() {
        let mut tracked = HashMap::new();
        tracked.insert("A".to_string(), record("A", "f1"));
        let seen: HashSet<String> = ["A".to_string()].into();
        assert!(deleted_ids(&tracked, &seen).is_empty());
    }
}
