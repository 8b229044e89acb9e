//! Manifest parsing
//!
//! Decodes a Snapchat memories export into typed [`ManifestEntry`] values.
//!
//! The document is JSON, either an object whose first array-valued member
//! holds the records (`{"Saved Media": [...]}`) or a bare array. A record looks
//! like:
//!
//! ```json
//! {
//!   "Date": "2024-03-15 14:30:45 UTC",
//!   "Media Type": "Image",
//!   "Location": "Latitude, Longitude: 37.7749, -122.4194",
//!   "Media Download Url": "https://app.snapchat.com/dmd/memories?uid=..."
//! }
//! ```
//!
//! Records that cannot become an entry are reported as [`ParseFailure`]s; only
//! a document that cannot be decoded at all fails the whole parse.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::IngestError;

const FIELD_DATE: &str = "Date";
const FIELD_MEDIA_TYPE: &str = "Media Type";
const FIELD_LOCATION: &str = "Location";
const FIELD_DOWNLOAD_URL: &str = "Media Download Url";
const FIELD_DOWNLOAD_LINK: &str = "Download Link";

/// Key under which rendered manifests list their records
pub const SAVED_MEDIA_KEY: &str = "Saved Media";

/// Timestamp layout used by the export
const EXPORT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

const NAIVE_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S UTC",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S",
];

/// Position of a record in the manifest; correlates every later result back
/// to its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryKey(pub usize);

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Declared media type of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Photo,
    Video,
}

impl MediaType {
    fn from_export(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "image" | "photo" => Some(MediaType::Photo),
            "video" => Some(MediaType::Video),
            _ => None,
        }
    }

    fn as_export(self) -> &'static str {
        match self {
            MediaType::Photo => "Image",
            MediaType::Video => "Video",
        }
    }
}

/// One media item to ingest. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub key: EntryKey,
    pub source_ref: Url,
    pub captured_at: DateTime<Utc>,
    pub location: Option<String>,
    pub media_type: MediaType,
}

impl ManifestEntry {
    /// `(latitude, longitude)` parsed from the location text, if it has them
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        let text = self.location.as_deref()?;
        let values = text.rsplit_once(':').map_or(text, |(_, v)| v);
        let (lat, lon) = values.split_once(',')?;
        let lat: f64 = lat.trim().parse().ok()?;
        let lon: f64 = lon.trim().parse().ok()?;

        ((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)).then_some((lat, lon))
    }

    /// Render this entry back into the export's record shape
    pub fn to_record(&self) -> Value {
        let mut record = Map::new();
        record.insert(
            FIELD_DATE.to_string(),
            Value::String(self.captured_at.format(EXPORT_DATE_FORMAT).to_string()),
        );
        record.insert(
            FIELD_MEDIA_TYPE.to_string(),
            Value::String(self.media_type.as_export().to_string()),
        );
        if let Some(ref location) = self.location {
            record.insert(FIELD_LOCATION.to_string(), Value::String(location.clone()));
        }
        record.insert(
            FIELD_DOWNLOAD_URL.to_string(),
            Value::String(self.source_ref.to_string()),
        );
        Value::Object(record)
    }
}

/// A record that could not become an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseFailure {
    pub key: EntryKey,
    pub source_ref: Option<String>,
    pub reason: String,
}

/// Result of parsing a manifest document
#[derive(Debug, Clone, Default)]
pub struct ParsedManifest {
    /// Number of records in the document, valid or not
    pub total_records: usize,
    /// Valid entries in document order
    pub entries: Vec<ManifestEntry>,
    pub failures: Vec<ParseFailure>,
}

impl ParsedManifest {
    pub fn photos(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| e.media_type == MediaType::Photo)
    }

    pub fn video_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.media_type == MediaType::Video)
            .count()
    }
}

/// Render entries as a manifest document the parser accepts
pub fn render_manifest<'a>(entries: impl IntoIterator<Item = &'a ManifestEntry>) -> Value {
    let records: Vec<Value> = entries.into_iter().map(ManifestEntry::to_record).collect();
    let mut document = Map::new();
    document.insert(SAVED_MEDIA_KEY.to_string(), Value::Array(records));
    Value::Object(document)
}

/// Decoder for memories export documents
#[derive(Debug, Clone, Default)]
pub struct ManifestParser;

impl ManifestParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a whole document.
    ///
    /// Fails with [`IngestError::MalformedManifest`] only when the document is
    /// not JSON or holds no list of records.
    pub fn parse(&self, document: &str) -> Result<ParsedManifest, IngestError> {
        let root: Value = serde_json::from_str(document)
            .map_err(|e| IngestError::MalformedManifest(format!("invalid JSON: {}", e)))?;

        let records = match root {
            Value::Array(records) => records,
            Value::Object(mut members) => {
                // The export's own key wins; otherwise the first list in document order
                let saved = members
                    .get_mut(SAVED_MEDIA_KEY)
                    .and_then(Value::as_array_mut)
                    .map(|records| (SAVED_MEDIA_KEY.to_string(), std::mem::take(records)));
                let (name, records) = saved
                    .or_else(|| {
                        members.into_iter().find_map(|(name, value)| match value {
                            Value::Array(records) => Some((name, records)),
                            _ => None,
                        })
                    })
                    .ok_or_else(|| {
                        IngestError::MalformedManifest("object holds no list of records".into())
                    })?;
                debug!(member = %name, "Found manifest records");
                records
            },
            other => {
                return Err(IngestError::MalformedManifest(format!(
                    "expected an object or array, found {}",
                    json_kind(&other)
                )))
            },
        };

        let mut parsed = ParsedManifest {
            total_records: records.len(),
            ..Default::default()
        };

        for (index, record) in records.iter().enumerate() {
            let key = EntryKey(index);
            match parse_record(key, record) {
                Ok(entry) => parsed.entries.push(entry),
                Err(failure) => {
                    warn!(entry = %key, reason = %failure.reason, "Skipping manifest record");
                    parsed.failures.push(failure);
                },
            }
        }

        info!(
            total = parsed.total_records,
            valid = parsed.entries.len(),
            failed = parsed.failures.len(),
            "Parsed manifest"
        );

        Ok(parsed)
    }
}

fn parse_record(key: EntryKey, record: &Value) -> Result<ManifestEntry, ParseFailure> {
    let fail = |source_ref: Option<&str>, reason: String| ParseFailure {
        key,
        source_ref: source_ref.map(str::to_string),
        reason,
    };

    let Some(fields) = record.as_object() else {
        return Err(fail(None, format!("record is {}, not an object", json_kind(record))));
    };

    let text = |name: &str| {
        fields
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };

    let raw_ref = text(FIELD_DOWNLOAD_URL).or_else(|| text(FIELD_DOWNLOAD_LINK));
    let Some(raw_ref) = raw_ref else {
        return Err(fail(None, "missing download reference".into()));
    };

    let source_ref = Url::parse(raw_ref)
        .map_err(|e| fail(Some(raw_ref), format!("invalid download reference: {}", e)))?;
    if !matches!(source_ref.scheme(), "http" | "https") {
        return Err(fail(
            Some(raw_ref),
            format!("unsupported reference scheme '{}'", source_ref.scheme()),
        ));
    }

    let captured_at = match text(FIELD_DATE) {
        Some(raw) => parse_timestamp(raw)
            .ok_or_else(|| fail(Some(raw_ref), format!("unrecognized timestamp '{}'", raw)))?,
        None => return Err(fail(Some(raw_ref), "missing capture timestamp".into())),
    };

    let media_type = match text(FIELD_MEDIA_TYPE) {
        Some(raw) => MediaType::from_export(raw)
            .ok_or_else(|| fail(Some(raw_ref), format!("unknown media type '{}'", raw)))?,
        None => return Err(fail(Some(raw_ref), "missing media type".into())),
    };

    Ok(ManifestEntry {
        key,
        source_ref,
        captured_at,
        location: text(FIELD_LOCATION).map(str::to_string),
        media_type,
    })
}

/// Parse the export's timestamp layouts, all read as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    NAIVE_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(date: &str, media: &str, url: &str) -> Value {
        json!({
            "Date": date,
            "Media Type": media,
            "Location": "Latitude, Longitude: 37.7749, -122.4194",
            "Media Download Url": url,
        })
    }

    #[test]
    fn test_parse_wrapped_document() {
        let doc = json!({
            "Saved Media": [
                record("2024-03-15 14:30:45 UTC", "Image", "https://cdn.example.com/a"),
                record("2024-03-16 09:00:00 UTC", "Video", "https://cdn.example.com/b"),
            ]
        });

        let parsed = ManifestParser::new().parse(&doc.to_string()).unwrap();
        assert_eq!(parsed.total_records, 2);
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.photos().count(), 1);
        assert_eq!(parsed.video_count(), 1);

        let first = &parsed.entries[0];
        assert_eq!(first.key, EntryKey(0));
        assert_eq!(
            first.captured_at,
            Utc.with_ymd_and_hms(2024, 3, 15, 14, 30, 45).unwrap()
        );
        assert_eq!(first.coordinates(), Some((37.7749, -122.4194)));
    }

    #[test]
    fn test_saved_media_wins_over_other_lists() {
        let rec = record("2024-03-15 14:30:45 UTC", "Image", "https://cdn.example.com/a");
        let doc = format!(r#"{{"Saved Media":[{}],"Archived":[]}}"#, rec);
        let parsed = ManifestParser::new().parse(&doc).unwrap();
        assert_eq!(parsed.total_records, 1);
        assert_eq!(parsed.entries.len(), 1);
    }

    #[test]
    fn test_first_list_in_document_order() {
        let rec = record("2024-03-15 14:30:45 UTC", "Image", "https://cdn.example.com/a");
        let doc = format!(r#"{{"Zeta":[{}],"Alpha":[]}}"#, rec);
        let parsed = ManifestParser::new().parse(&doc).unwrap();
        assert_eq!(parsed.total_records, 1);
        assert_eq!(parsed.entries[0].source_ref.to_string(), "https://cdn.example.com/a");
    }

    #[test]
    fn test_parse_bare_array() {
        let doc = json!([record("2023-01-01T10:00:00Z", "PHOTO", "https://x.test/1")]);
        let parsed = ManifestParser::new().parse(&doc.to_string()).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].media_type, MediaType::Photo);
    }

    #[test]
    fn test_bad_records_are_counted_not_fatal() {
        let doc = json!({
            "Saved Media": [
                record("2024-03-15 14:30:45 UTC", "Image", "https://x.test/ok"),
                { "Date": "2024-03-15 14:30:45 UTC", "Media Type": "Image" },
                record("yesterday", "Image", "https://x.test/bad-date"),
                record("2024-03-15 14:30:45 UTC", "Image", "ftp://x.test/file"),
                record("2024-03-15 14:30:45 UTC", "Sticker", "https://x.test/sticker"),
                "not a record",
            ]
        });

        let parsed = ManifestParser::new().parse(&doc.to_string()).unwrap();
        assert_eq!(parsed.total_records, 6);
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.failures.len(), 5);

        let missing = &parsed.failures[0];
        assert_eq!(missing.key, EntryKey(1));
        assert_eq!(missing.source_ref, None);
        assert!(missing.reason.contains("download reference"));
        assert!(parsed.failures[1].reason.contains("timestamp"));
        assert!(parsed.failures[2].reason.contains("scheme"));
        assert!(parsed.failures[3].reason.contains("media type"));
    }

    #[test]
    fn test_download_link_fallback() {
        let doc = json!([{
            "Date": "2024-03-15 14:30:45",
            "Media Type": "Image",
            "Download Link": "https://x.test/link",
        }]);
        let parsed = ManifestParser::new().parse(&doc.to_string()).unwrap();
        assert_eq!(parsed.entries[0].source_ref.as_str(), "https://x.test/link");
        assert_eq!(parsed.entries[0].location, None);
    }

    #[test]
    fn test_malformed_documents() {
        let parser = ManifestParser::new();
        for doc in ["{not json", "42", r#"{"Saved Media": "none"}"#] {
            let err = parser.parse(doc).unwrap_err();
            assert!(matches!(err, IngestError::MalformedManifest(_)), "{doc}");
        }
    }

    #[test]
    fn test_rendered_manifest_parses_back() {
        let doc = json!([record("2024-03-15 14:30:45 UTC", "Image", "https://x.test/1")]);
        let parsed = ManifestParser::new().parse(&doc.to_string()).unwrap();

        let rendered = render_manifest(&parsed.entries).to_string();
        let again = ManifestParser::new().parse(&rendered).unwrap();
        assert_eq!(again.entries, parsed.entries);
    }

    #[test]
    fn test_coordinates_need_two_numbers() {
        let mut entry = ManifestParser::new()
            .parse(&json!([record("2024-03-15 14:30:45", "Image", "https://x.test/1")]).to_string())
            .unwrap()
            .entries
            .remove(0);
        entry.location = Some("Somewhere nice".into());
        assert_eq!(entry.coordinates(), None);
        entry.location = Some("91.0, 10.0".into());
        assert_eq!(entry.coordinates(), None);
    }
}
