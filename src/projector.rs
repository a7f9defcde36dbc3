//! Normalizes raw service payloads into [`ResultRecord`]s and hands them to
//! downstream side effects.

use serde_json::Value;

use crate::types::{ResultRecord, TaskHandle};

/// Receives each finished result exactly once (download, persistence, ...).
pub trait ResultSink: Send + Sync {
    fn deliver(&self, record: &ResultRecord, handle: Option<&TaskHandle>);
}

impl<F> ResultSink for F
where
    F: Fn(&ResultRecord, Option<&TaskHandle>) + Send + Sync,
{
    fn deliver(&self, record: &ResultRecord, handle: Option<&TaskHandle>) {
        self(record, handle)
    }
}

/// Project a result payload.
///
/// Accepts a bare URL string, an object with `url` (plus optional
/// `filename`, `size`/`dimensions`, `format`), or an object with an
/// `images` array, in which case the first entry is used.
pub fn record_from_value(value: &Value) -> Option<ResultRecord> {
    match value {
        Value::String(url) if !url.trim().is_empty() => Some(record_from_url(url)),
        Value::Object(obj) => {
            if let Some(first) = obj.get("images").and_then(|v| v.as_array()).and_then(|a| a.first()) {
                return record_from_value(first);
            }
            let url = obj.get("url").and_then(|v| v.as_str())?;
            if url.trim().is_empty() {
                return None;
            }
            let derived = record_from_url(url);
            Some(ResultRecord {
                url: url.to_string(),
                filename: str_field(obj.get("filename")).unwrap_or(derived.filename),
                size: str_field(obj.get("size"))
                    .or_else(|| str_field(obj.get("dimensions")))
                    .unwrap_or(derived.size),
                format: str_field(obj.get("format")).unwrap_or(derived.format),
            })
        }
        _ => None,
    }
}

/// Build a record from just a URL, deriving filename and format from the path.
pub fn record_from_url(url: &str) -> ResultRecord {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let filename = path
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .filter(|segment| !segment.contains(':'))
        .unwrap_or("")
        .to_string();
    let format = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    ResultRecord {
        url: url.to_string(),
        filename,
        size: String::new(),
        format,
    }
}

fn str_field(value: Option<&Value>) -> Option<String> {
    value
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_from_images_array() {
        let data = json!({
            "images": [
                {"url": "https://x/out.png", "filename": "out.png", "size": "1024x1024", "format": "png"},
                {"url": "https://x/other.png"}
            ]
        });
        let record = record_from_value(&data).unwrap();
        assert_eq!(
            record,
            ResultRecord {
                url: "https://x/out.png".into(),
                filename: "out.png".into(),
                size: "1024x1024".into(),
                format: "png".into(),
            }
        );
    }

    #[test]
    fn test_record_from_url_derives_fields() {
        let record = record_from_url("https://cdn.example.com/renders/abc/Final.JPG?sig=123");
        assert_eq!(record.filename, "Final.JPG");
        assert_eq!(record.format, "jpg");
        assert_eq!(record.size, "");
    }

    #[test]
    fn test_record_from_url_without_extension() {
        let record = record_from_url("https://x/download/");
        assert_eq!(record.filename, "download");
        assert_eq!(record.format, "");

        let record = record_from_url("https://");
        assert_eq!(record.filename, "");
        assert_eq!(record.format, "");
    }

    #[test]
    fn test_partial_object_fills_from_url() {
        let data = json!({"url": "https://x/clip.mp4", "dimensions": "1080x1920"});
        let record = record_from_value(&data).unwrap();
        assert_eq!(record.filename, "clip.mp4");
        assert_eq!(record.size, "1080x1920");
        assert_eq!(record.format, "mp4");
    }

    #[test]
    fn test_bare_string() {
        let record = record_from_value(&json!("https://x/a.webp")).unwrap();
        assert_eq!(record.format, "webp");
    }

    #[test]
    fn test_unusable_payloads() {
        assert!(record_from_value(&json!(null)).is_none());
        assert!(record_from_value(&json!({"images": []})).is_none());
        assert!(record_from_value(&json!({"url": ""})).is_none());
        assert!(record_from_value(&json!("  ")).is_none());
        assert!(record_from_value(&json!(42)).is_none());
    }

    #[test]
    fn test_closure_sink() {
        use std::sync::Mutex;
        let seen = Mutex::new(Vec::new());
        let sink = |record: &ResultRecord, handle: Option<&TaskHandle>| {
            seen.lock()
                .unwrap()
                .push((record.filename.clone(), handle.map(|h| h.id.clone())));
        };
        sink.deliver(&record_from_url("https://x/a.png"), Some(&TaskHandle::new("t1")));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[("a.png".to_string(), Some("t1".to_string()))]
        );
    }
}
