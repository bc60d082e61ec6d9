//! Live session recording: one JSON line per event, flushed per write.
//!
//! Shell channels record payload bytes in both directions; exec, SFTP and
//! forward channels record open/close metadata only. A stay has exactly
//! one recording file and one writer.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::{SshProxyError, SshResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "c→s")]
    ClientToServer,
    #[serde(rename = "s→c")]
    ServerToClient,
    #[serde(rename = "close")]
    Close,
    #[serde(rename = "note")]
    Note,
}

/// One recorded event. `t` is unix milliseconds; `channel` is the session
/// id of the channel within the stay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingEvent {
    pub t: i64,
    pub kind: EventKind,
    pub channel: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RecordingEvent {
    fn now(kind: EventKind, channel: i64) -> Self {
        Self {
            t: Utc::now().timestamp_millis(),
            kind,
            channel,
            data: None,
            reason: None,
        }
    }

    pub fn open(channel: i64, kind_label: &str) -> Self {
        let mut event = Self::now(EventKind::Open, channel);
        event.reason = Some(kind_label.to_string());
        event
    }

    pub fn payload(channel: i64, kind: EventKind, bytes: &[u8]) -> Self {
        let mut event = Self::now(kind, channel);
        event.data = Some(BASE64.encode(bytes));
        event
    }

    pub fn close(channel: i64, reason: &str) -> Self {
        let mut event = Self::now(EventKind::Close, channel);
        event.reason = Some(reason.to_string());
        event
    }

    pub fn note(channel: i64, text: &str) -> Self {
        let mut event = Self::now(EventKind::Note, channel);
        event.reason = Some(text.to_string());
        event
    }

    /// Decoded payload bytes, if this is a payload event.
    pub fn decoded(&self) -> Option<Vec<u8>> {
        let data = self.data.as_ref()?;
        BASE64.decode(data).ok()
    }
}

/// Append-only JSONL writer for one stay.
pub struct Recorder {
    file: File,
    path: PathBuf,
}

impl Recorder {
    /// Create the recording file (and its parent directory).
    pub async fn create(path: PathBuf) -> SshResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SshProxyError::Recording(format!("create {}: {e}", parent.display())))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| SshProxyError::Recording(format!("open {}: {e}", path.display())))?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event and flush so live tail readers see it immediately.
    pub async fn append(&mut self, event: &RecordingEvent) -> SshResult<()> {
        let mut line = serde_json::to_vec(event)
            .map_err(|e| SshProxyError::Recording(format!("encode event: {e}")))?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .await
            .map_err(|e| SshProxyError::Recording(format!("write {}: {e}", self.path.display())))?;
        self.file
            .flush()
            .await
            .map_err(|e| SshProxyError::Recording(format!("flush {}: {e}", self.path.display())))?;
        Ok(())
    }
}
