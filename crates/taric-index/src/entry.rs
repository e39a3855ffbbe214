//! Index entry and document types.

use serde::{Deserialize, Serialize};
use taric_crypto::Fingerprint;
use taric_types::{DeltaDate, Seq};

use crate::error::{IndexError, IndexResult};

/// Path segment under the API root where delta files are served.
const FILES_ROUTE: &str = "taricfiles";

/// Metadata for one published delta file.
///
/// Serialized as `{"id":200000,"issueDate":"...","url":"...","digest":"...","size":123}`.
/// Unknown fields are rejected on read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IndexEntry {
    pub id: Seq,
    /// ISO-8601 timestamp; either the client-supplied `modtime` or the
    /// backend's last-modified time.
    pub issue_date: String,
    /// Download URL derived from the API root.
    pub url: String,
    /// Lowercase hex SHA-512 of the content.
    pub digest: String,
    pub size: u64,
}

impl IndexEntry {
    pub fn new(id: Seq, issue_date: impl Into<String>, api_root: &str, fingerprint: Fingerprint) -> Self {
        Self {
            id,
            issue_date: issue_date.into(),
            url: file_url(api_root, id),
            digest: fingerprint.digest,
            size: fingerprint.size,
        }
    }
}

/// Download URL for a delta file: `{api_root}taricfiles/{seq}`.
pub fn file_url(api_root: &str, id: Seq) -> String {
    let root = api_root.trim_end_matches('/');
    format!("{root}/{FILES_ROUTE}/{id}")
}

/// The full index: entries unique by id, kept in insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexDocument {
    entries: Vec<IndexEntry>,
}

impl IndexDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a document from entries, keeping the last entry seen for any
    /// repeated id.
    pub fn from_entries(entries: impl IntoIterator<Item = IndexEntry>) -> Self {
        let mut doc = Self::new();
        for entry in entries {
            doc.upsert(entry);
        }
        doc
    }

    /// Parse a stored document. `key` is only used in error messages.
    pub fn from_slice(key: &str, bytes: &[u8]) -> IndexResult<Self> {
        let doc: Self = serde_json::from_slice(bytes).map_err(|e| IndexError::corrupt(key, e))?;
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = doc.entries.iter().find(|e| !seen.insert(e.id)) {
            return Err(IndexError::corrupt(key, format!("duplicate id {}", dup.id)));
        }
        Ok(doc)
    }

    pub fn to_vec(&self) -> IndexResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| IndexError::Serialization(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<IndexEntry> {
        self.entries
    }

    pub fn get(&self, id: Seq) -> Option<&IndexEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Replace the entry with the same id in place, or append.
    /// Returns `true` if an existing entry was replaced.
    pub fn upsert(&mut self, entry: IndexEntry) -> bool {
        match self.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => {
                *existing = entry;
                true
            }
            None => {
                self.entries.push(entry);
                false
            }
        }
    }

    /// Entries whose issue date falls on `date`.
    pub fn on_date(&self, date: &DeltaDate) -> Vec<&IndexEntry> {
        self.entries
            .iter()
            .filter(|e| date.matches(&e.issue_date))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taric_crypto::ContentDigest;

    fn seq(s: &str) -> Seq {
        Seq::parse(s).unwrap()
    }

    fn entry(id: &str, date: &str, content: &[u8]) -> IndexEntry {
        IndexEntry::new(seq(id), date, "http://localhost:8080/api/v1/", ContentDigest::of_bytes(content))
    }

    #[test]
    fn url_joins_root_and_seq() {
        assert_eq!(
            file_url("http://localhost:8080/api/v1/", seq("000042")),
            "http://localhost:8080/api/v1/taricfiles/000042"
        );
        assert_eq!(
            file_url("https://example.test/api/v1", seq("200000")),
            "https://example.test/api/v1/taricfiles/200000"
        );
    }

    #[test]
    fn entry_wire_format() {
        let e = entry("200000", "2024-05-01T10:00:00", b"abc");
        let json: serde_json::Value = serde_json::to_value(&e).unwrap();
        assert_eq!(json["id"], 200000);
        assert_eq!(json["issueDate"], "2024-05-01T10:00:00");
        assert_eq!(json["url"], "http://localhost:8080/api/v1/taricfiles/200000");
        assert_eq!(json["size"], 3);
        assert_eq!(json["digest"].as_str().unwrap().len(), 128);
        assert_eq!(json.as_object().unwrap().len(), 5);
    }

    #[test]
    fn unknown_fields_are_corrupt() {
        let raw = br#"[{"id":1,"issueDate":"2024-01-01","url":"u","digest":"d","size":1,"md5":"x"}]"#;
        assert!(matches!(
            IndexDocument::from_slice("idx", raw),
            Err(IndexError::Corrupt { .. })
        ));
    }

    #[test]
    fn out_of_range_id_is_corrupt() {
        let raw = br#"[{"id":1000000,"issueDate":"2024-01-01","url":"u","digest":"d","size":1}]"#;
        assert!(IndexDocument::from_slice("idx", raw).is_err());
    }

    #[test]
    fn duplicate_ids_are_corrupt() {
        let doc = vec![entry("000001", "2024-01-01", b"a"), entry("000001", "2024-01-02", b"b")];
        let raw = serde_json::to_vec(&doc).unwrap();
        let err = IndexDocument::from_slice("idx", &raw).unwrap_err();
        assert!(err.to_string().contains("duplicate id 000001"));
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut doc = IndexDocument::new();
        assert!(!doc.upsert(entry("000001", "2024-01-01", b"a")));
        assert!(!doc.upsert(entry("000002", "2024-01-01", b"b")));
        assert!(doc.upsert(entry("000001", "2024-02-01", b"cc")));

        assert_eq!(doc.len(), 2);
        assert_eq!(doc.entries()[0].id, seq("000001"));
        assert_eq!(doc.entries()[0].size, 2);
        assert_eq!(doc.get(seq("000001")).unwrap().issue_date, "2024-02-01");
    }

    #[test]
    fn date_filter_is_prefix_match() {
        let doc = IndexDocument::from_entries([
            entry("000001", "2024-01-01T23:59:59", b"a"),
            entry("000002", "2024-01-02T00:00:00", b"b"),
            entry("000003", "2024-01-01", b"c"),
        ]);
        let date = DeltaDate::parse("2024-01-01").unwrap();
        let ids: Vec<Seq> = doc.on_date(&date).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![seq("000001"), seq("000003")]);
    }

    #[test]
    fn document_roundtrip() {
        let doc = IndexDocument::from_entries([entry("000001", "2024-01-01", b"a")]);
        let bytes = doc.to_vec().unwrap();
        assert!(bytes.starts_with(b"[{\"id\":1,"));
        assert_eq!(IndexDocument::from_slice("idx", &bytes).unwrap(), doc);
        assert!(IndexDocument::from_slice("idx", b"[]").unwrap().is_empty());
    }
}
