//! Source connectors
//!
//! A connector yields raw items until exhausted. Item-level problems (a line
//! that is not JSON) come back as [`SourceItem::Malformed`] so the engine can
//! dead-letter them; only connector-level failures are errors.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::models::{DeadLetterRecord, SourceItem};

/// Connector-level (fatal) errors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Failed to open source {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Read error on {0}: {1}")]
    Read(String, std::io::Error),
}

/// Stream of raw records
#[async_trait]
pub trait SourceConnector: Send {
    /// Next item, or `None` when the source is exhausted
    async fn next_item(&mut self) -> Result<Option<SourceItem>, ConnectorError>;

    /// Human-readable source description (logs, events)
    fn describe(&self) -> String;
}

fn parse_line(line: &str) -> SourceItem {
    match serde_json::from_str::<Value>(line) {
        Ok(value) => SourceItem::Parsed(value),
        Err(e) => SourceItem::Malformed {
            raw: line.to_string(),
            reason: format!("malformed JSON: {}", e),
        },
    }
}

/// Decode one raw line; invalid UTF-8 is an item-level failure
fn decode_line(bytes: &[u8]) -> Option<SourceItem> {
    match std::str::from_utf8(bytes) {
        Ok(text) if text.trim().is_empty() => None,
        Ok(text) => Some(parse_line(text.trim())),
        Err(e) => Some(SourceItem::Malformed {
            raw: String::from_utf8_lossy(bytes).trim().to_string(),
            reason: format!("invalid UTF-8 at byte {}", e.valid_up_to()),
        }),
    }
}

/// JSON-lines file; blank lines are skipped
pub struct JsonLinesConnector {
    path: PathBuf,
    reader: BufReader<File>,
    buf: Vec<u8>,
}

impl JsonLinesConnector {
    pub async fn open(path: &Path) -> Result<Self, ConnectorError> {
        let file = File::open(path).await.map_err(|source| ConnectorError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            buf: Vec::new(),
        })
    }
}

#[async_trait]
impl SourceConnector for JsonLinesConnector {
    async fn next_item(&mut self) -> Result<Option<SourceItem>, ConnectorError> {
        loop {
            self.buf.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .await
                .map_err(|e| ConnectorError::Read(self.path.display().to_string(), e))?;
            if read == 0 {
                return Ok(None);
            }

            if let Some(item) = decode_line(&self.buf) {
                return Ok(Some(item));
            }
        }
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// In-memory batch of already-parsed payloads
pub struct MemoryConnector {
    items: VecDeque<SourceItem>,
    label: String,
}

impl MemoryConnector {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            items: values.into_iter().map(SourceItem::Parsed).collect(),
            label: "memory".to_string(),
        }
    }

    /// Items as given, including malformed ones
    pub fn from_items(items: Vec<SourceItem>, label: impl Into<String>) -> Self {
        Self {
            items: items.into(),
            label: label.into(),
        }
    }
}

#[async_trait]
impl SourceConnector for MemoryConnector {
    async fn next_item(&mut self) -> Result<Option<SourceItem>, ConnectorError> {
        Ok(self.items.pop_front())
    }

    fn describe(&self) -> String {
        format!("{} ({} pending)", self.label, self.items.len())
    }
}

/// Unbounded feed; exhausted when every sender is dropped
pub struct ChannelConnector {
    rx: mpsc::Receiver<SourceItem>,
}

impl ChannelConnector {
    pub fn new(buffer: usize) -> (mpsc::Sender<SourceItem>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl SourceConnector for ChannelConnector {
    async fn next_item(&mut self) -> Result<Option<SourceItem>, ConnectorError> {
        Ok(self.rx.recv().await)
    }

    fn describe(&self) -> String {
        "channel".to_string()
    }
}

/// Replays the raw payloads of another job's dead letters
pub struct DeadLetterReplayConnector {
    source_job_id: String,
    letters: VecDeque<DeadLetterRecord>,
}

impl DeadLetterReplayConnector {
    pub fn new(source_job_id: impl Into<String>, letters: Vec<DeadLetterRecord>) -> Self {
        Self {
            source_job_id: source_job_id.into(),
            letters: letters.into(),
        }
    }
}

#[async_trait]
impl SourceConnector for DeadLetterReplayConnector {
    async fn next_item(&mut self) -> Result<Option<SourceItem>, ConnectorError> {
        Ok(self
            .letters
            .pop_front()
            .map(|letter| parse_line(&letter.raw_payload)))
    }

    fn describe(&self) -> String {
        format!("dead-letters:{}", self.source_job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[tokio::test]
    async fn test_json_lines_skips_blank_and_flags_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"a\": \"1\"}}").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "not json").unwrap();
        file.flush().unwrap();

        let mut connector = JsonLinesConnector::open(file.path()).await.unwrap();
        assert!(matches!(connector.next_item().await.unwrap(), Some(SourceItem::Parsed(_))));
        match connector.next_item().await.unwrap() {
            Some(SourceItem::Malformed { raw, reason }) => {
                assert_eq!(raw, "not json");
                assert!(reason.starts_with("malformed JSON"));
            }
            other => panic!("expected malformed item, got {:?}", other),
        }
        assert!(connector.next_item().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_malformed_item() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"patient_id\": \"P1\"}\n{\"patient_id\": \"\xff\xfe\"}\n{\"patient_id\": \"P3\"}")
            .unwrap();
        file.flush().unwrap();

        let mut connector = JsonLinesConnector::open(file.path()).await.unwrap();
        assert!(matches!(connector.next_item().await.unwrap(), Some(SourceItem::Parsed(_))));
        match connector.next_item().await.unwrap() {
            Some(SourceItem::Malformed { raw, reason }) => {
                assert!(raw.starts_with("{\"patient_id\""));
                assert!(reason.starts_with("invalid UTF-8"));
            }
            other => panic!("expected malformed item, got {:?}", other),
        }
        // Last line has no trailing newline
        assert!(matches!(connector.next_item().await.unwrap(), Some(SourceItem::Parsed(_))));
        assert!(connector.next_item().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_connector_error() {
        let result = JsonLinesConnector::open(Path::new("/definitely/not/here.jsonl")).await;
        assert!(matches!(result, Err(ConnectorError::Open { .. })));
    }

    #[tokio::test]
    async fn test_channel_ends_when_senders_drop() {
        let (tx, mut connector) = ChannelConnector::new(4);
        tx.send(SourceItem::Parsed(json!({"x": 1}))).await.unwrap();
        drop(tx);

        assert!(connector.next_item().await.unwrap().is_some());
        assert!(connector.next_item().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replay_yields_raw_payloads() {
        let letters = vec![
            DeadLetterRecord::new("A", "{\"id\": \"1\"}".to_string(), "missing required field 'code'"),
            DeadLetterRecord::new("A", "{broken".to_string(), "malformed JSON"),
        ];
        let mut connector = DeadLetterReplayConnector::new("A", letters);

        assert!(matches!(connector.next_item().await.unwrap(), Some(SourceItem::Parsed(_))));
        assert!(matches!(connector.next_item().await.unwrap(), Some(SourceItem::Malformed { .. })));
        assert!(connector.next_item().await.unwrap().is_none());
        assert_eq!(connector.describe(), "dead-letters:A");
    }
}
