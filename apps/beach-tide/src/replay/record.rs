//! Recorded timelines: `[{ "time": ms, "reliable": bool, "message": {...} }]`.

use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Offset from the start of the timeline.
    pub offset: Duration,
    pub reliable: bool,
    pub payload: Value,
}

impl RecordedEvent {
    pub fn new(offset_ms: u64, reliable: bool, payload: Value) -> Self {
        Self {
            offset: Duration::from_millis(offset_ms),
            reliable,
            payload,
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("failed to read recording {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to fetch recording {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("malformed recording: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event {index} has invalid time {value}")]
    InvalidOffset { index: usize, value: String },
}

#[derive(Deserialize)]
struct RawEvent {
    time: Value,
    #[serde(default)]
    reliable: bool,
    message: Value,
}

pub fn parse_recording(text: &str) -> Result<Vec<RecordedEvent>, RecordingError> {
    let raw: Vec<RawEvent> = serde_json::from_str(text)?;
    let mut events = Vec::with_capacity(raw.len());
    for (index, entry) in raw.into_iter().enumerate() {
        let millis = entry
            .time
            .as_f64()
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .ok_or_else(|| RecordingError::InvalidOffset {
                index,
                value: entry.time.to_string(),
            })?;
        events.push(RecordedEvent {
            offset: Duration::from_nanos((millis * 1_000_000.0).round() as u64),
            reliable: entry.reliable,
            payload: entry.message,
        });
    }
    if let Some(index) = events.windows(2).position(|pair| pair[1].offset < pair[0].offset) {
        tracing::warn!(
            target = "replay",
            index = index + 1,
            "recording is not sorted by time; events will be replayed in file order"
        );
    }
    Ok(events)
}

/// Loads a recording from a filesystem path or an `http(s)://` URL.
pub async fn load(source: &str) -> Result<Vec<RecordedEvent>, RecordingError> {
    let text = if source.starts_with("http://") || source.starts_with("https://") {
        fetch(source).await.map_err(|source_err| RecordingError::Http {
            url: source.to_string(),
            source: source_err,
        })?
    } else {
        tokio::fs::read_to_string(source)
            .await
            .map_err(|err| RecordingError::Io {
                path: source.to_string(),
                source: err,
            })?
    };
    let events = parse_recording(&text)?;
    tracing::info!(target = "replay", source, events = events.len(), "recording loaded");
    Ok(events)
}

async fn fetch(url: &str) -> Result<String, reqwest::Error> {
    reqwest::get(url).await?.error_for_status()?.text().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_fractional_millisecond_offsets() {
        let events = parse_recording(
            r#"[{"time": 0, "reliable": true, "message": {"a": 1}},
                {"time": 12.5, "reliable": false, "message": {"b": 2}}]"#,
        )
        .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].offset, Duration::ZERO);
        assert!(events[0].reliable);
        assert_eq!(events[1].offset, Duration::from_micros(12_500));
        assert_eq!(events[1].payload, json!({"b": 2}));
    }

    #[test]
    fn rejects_negative_and_non_numeric_times() {
        let err = parse_recording(r#"[{"time": -1, "message": {}}]"#).unwrap_err();
        assert!(matches!(err, RecordingError::InvalidOffset { index: 0, .. }));
        let err = parse_recording(
            r#"[{"time": 1, "message": {}}, {"time": "soon", "message": {}}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, RecordingError::InvalidOffset { index: 1, .. }));
    }

    #[test]
    fn unsorted_input_is_kept_in_file_order() {
        let events = parse_recording(
            r#"[{"time": 50, "message": {"n": 0}}, {"time": 10, "message": {"n": 1}}]"#,
        )
        .unwrap();
        assert_eq!(events[0].payload["n"], 0);
        assert_eq!(events[1].payload["n"], 1);
    }

    #[test]
    fn missing_reliable_flag_defaults_to_unreliable() {
        let events = parse_recording(r#"[{"time": 3, "message": null}]"#).unwrap();
        assert!(!events[0].reliable);
    }

    #[test_timeout::tokio_timeout_test]
    async fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("beach-tide-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, r#"[{"time": 5, "reliable": true, "message": {"x": 1}}]"#)
            .await
            .unwrap();
        let events = load(path.to_str().unwrap()).await.unwrap();
        assert_eq!(events, vec![RecordedEvent::new(5, true, json!({"x": 1}))]);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn missing_file_is_an_io_error() {
        let err = load("/definitely/not/here.json").await.unwrap_err();
        assert!(matches!(err, RecordingError::Io { .. }));
    }
}
