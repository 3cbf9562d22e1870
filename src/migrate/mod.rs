//! Legacy document migration: inline `data:image/*;base64,` strings are
//! extracted into the asset store and replaced by `asset://` references.

use std::collections::{HashMap, HashSet};

use base64::Engine as _;
use serde_json::Value;
use tracing::{debug, info};

use crate::assets::AssetStore;
use crate::error::{ArchiveError, Result};
use crate::hash::content_hash;
use crate::Document;

/// Counts from one migration pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Distinct inline payloads written to the store.
    pub extracted: usize,
    /// String leaves rewritten to references (duplicates included).
    pub rewritten: usize,
}

/// A recognised inline image: `data:image/<subtype>;base64,<payload>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataUri<'a> {
    pub subtype: &'a str,
    pub payload: &'a str,
}

impl DataUri<'_> {
    /// File extension for the subtype.
    pub fn extension(&self) -> String {
        match self.subtype.to_ascii_lowercase().as_str() {
            "svg+xml" => "svg".to_string(),
            "jpeg" => "jpg".to_string(),
            other => other.to_string(),
        }
    }
}

/// Match `s` against the inline image shape.
pub fn parse_data_uri(s: &str) -> Option<DataUri<'_>> {
    let rest = s.strip_prefix("data:image/")?;
    let (subtype, payload) = rest.split_once(";base64,")?;
    let subtype_ok = !subtype.is_empty()
        && subtype
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    let payload_ok = !payload.is_empty()
        && payload
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='));
    (subtype_ok && payload_ok).then_some(DataUri { subtype, payload })
}

/// Depth-first visit of every string leaf in `value`.
pub fn visit_strings_mut(value: &mut Value, f: &mut impl FnMut(&mut String)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => {
            for item in items {
                visit_strings_mut(item, f);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                visit_strings_mut(item, f);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// Parse `raw` as a legacy JSON document and migrate its inline images
/// into `store`.
pub async fn migrate(raw: &[u8], store: &AssetStore) -> Result<Document> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| ArchiveError::InvalidFormat(format!("not UTF-8: {e}")))?;
    let mut doc: Document = serde_json::from_str(text)
        .map_err(|e| ArchiveError::InvalidFormat(format!("not a container or JSON: {e}")))?;
    let report = migrate_value(&mut doc, store).await?;
    if report.extracted > 0 {
        info!(
            extracted = report.extracted,
            rewritten = report.rewritten,
            "legacy inline images migrated"
        );
    }
    Ok(doc)
}

/// Rewrite inline images in an already-parsed tree.
pub async fn migrate_value(doc: &mut Document, store: &AssetStore) -> Result<MigrationReport> {
    // Distinct inline strings, in first-seen order.
    let mut pending: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    visit_strings_mut(doc, &mut |s| {
        if parse_data_uri(s).is_some() && seen.insert(s.clone()) {
            pending.push(s.clone());
        }
    });

    let mut report = MigrationReport::default();
    // Transient inline string → reference map for this pass only.
    let mut assigned: HashMap<String, String> = HashMap::new();
    for inline in pending {
        let Some(uri) = parse_data_uri(&inline) else {
            continue;
        };
        let bytes = match base64::engine::general_purpose::STANDARD.decode(uri.payload) {
            Ok(b) => b,
            Err(e) => {
                debug!(error = %e, "inline image payload is not valid base64, left as-is");
                continue;
            }
        };
        // Named after the hash of the encoded text, not the decoded bytes.
        let filename = format!("img_{}.{}", content_hash(uri.payload.as_bytes()), uri.extension());
        let reference = store.put_named(&filename, &bytes).await?;
        report.extracted += 1;
        assigned.insert(inline, reference.to_string());
    }

    if !assigned.is_empty() {
        visit_strings_mut(doc, &mut |s| {
            if let Some(reference) = assigned.get(s.as_str()) {
                *s = reference.clone();
                report.rewritten += 1;
            }
        });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcode::Transcoder;
    use serde_json::json;
    use tempfile::TempDir;

    const PNG_1X1: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8z8BQDwAEhQGAhKmMIQAAAABJRU5ErkJggg==";

    fn store(dir: &TempDir) -> AssetStore {
        AssetStore::new(dir.path().join("assets"), Transcoder::default())
    }

    #[test]
    fn data_uri_shapes() {
        let uri = parse_data_uri("data:image/svg+xml;base64,PHN2Zz4=").unwrap();
        assert_eq!(uri.subtype, "svg+xml");
        assert_eq!(uri.extension(), "svg");
        assert_eq!(parse_data_uri("data:image/jpeg;base64,AAAA").unwrap().extension(), "jpg");
        assert_eq!(parse_data_uri("data:image/webp;base64,AAAA").unwrap().extension(), "webp");

        assert!(parse_data_uri("data:text/plain;base64,AAAA").is_none());
        assert!(parse_data_uri("data:image/png,AAAA").is_none());
        assert!(parse_data_uri("data:image/;base64,AAAA").is_none());
        assert!(parse_data_uri("data:image/png;base64,").is_none());
        assert!(parse_data_uri("data:image/png;base64,not base64!").is_none());
        assert!(parse_data_uri("hello").is_none());
    }

    #[tokio::test]
    async fn invalid_json_is_invalid_format() {
        let dir = TempDir::new().unwrap();
        let err = migrate(b"{not json", &store(&dir)).await.unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidFormat(_)));
    }

    #[tokio::test]
    async fn inline_images_become_references() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let inline = format!("data:image/png;base64,{PNG_1X1}");
        let raw = json!({
            "title": "A",
            "image": inline,
            "pages": [{ "bg": inline, "caption": "data:image/png;base64,???" }],
            "count": 3,
        })
        .to_string();

        let doc = migrate(raw.as_bytes(), &s).await.unwrap();
        let expected = format!("asset://img_{}.png", content_hash(PNG_1X1.as_bytes()));
        assert_eq!(doc["title"], "A");
        assert_eq!(doc["image"], expected.as_str());
        assert_eq!(doc["pages"][0]["bg"], expected.as_str());
        assert_eq!(doc["pages"][0]["caption"], "data:image/png;base64,???");
        assert_eq!(doc["count"], 3);

        let bytes = base64::engine::general_purpose::STANDARD.decode(PNG_1X1).unwrap();
        assert_eq!(s.resolve(&expected).await.unwrap(), bytes);
        assert_eq!(s.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn undecodable_payload_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        // Matches the shape but has invalid base64 padding.
        let mut doc = json!({ "x": "data:image/png;base64,A===" });
        let report = migrate_value(&mut doc, &s).await.unwrap();
        assert_eq!(report, MigrationReport::default());
        assert_eq!(doc["x"], "data:image/png;base64,A===");
    }

    #[tokio::test]
    async fn duplicates_counted_once() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let inline = format!("data:image/png;base64,{PNG_1X1}");
        let mut doc = json!([inline, inline, { "k": inline }]);
        let report = migrate_value(&mut doc, &s).await.unwrap();
        assert_eq!(report.extracted, 1);
        assert_eq!(report.rewritten, 3);
    }

    #[tokio::test]
    async fn migration_is_deterministic_across_stores() {
        let inline = format!("data:image/png;base64,{PNG_1X1}");
        let raw = json!({ "a": inline, "b": ["plain", 1, null] }).to_string();

        let d1 = TempDir::new().unwrap();
        let d2 = TempDir::new().unwrap();
        let one = migrate(raw.as_bytes(), &store(&d1)).await.unwrap();
        let two = migrate(raw.as_bytes(), &store(&d2)).await.unwrap();
        assert_eq!(one, two);
    }
}
