//! Source identification and descriptive metadata.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A unique key identifying one broadcast service.
///
/// Two sources with the same NID/TSID pair belong to the same transport stream,
/// so tuning a device to one of them makes the whole group receivable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId {
    /// Original network ID.
    pub nid: u16,
    /// Transport stream ID.
    pub tsid: u16,
    /// Service ID.
    pub sid: u16,
}

impl SourceId {
    /// Create a source identifier from its three components.
    pub fn new(nid: u16, tsid: u16, sid: u16) -> Self {
        Self { nid, tsid, sid }
    }

    /// The `(nid, tsid)` pair naming the group this source is received in.
    pub fn mux(&self) -> (u16, u16) {
        (self.nid, self.tsid)
    }

    /// Check if both sources are received through the same transport stream.
    pub fn same_group(&self, other: &SourceId) -> bool {
        self.mux() == other.mux()
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}/{:04X}/{:04X}", self.nid, self.tsid, self.sid)
    }
}

/// Descriptive metadata of a source, as read from the broadcast tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInformation {
    pub source: SourceId,
    /// Service name.
    pub name: String,
    /// Service provider name.
    pub provider: String,
    /// Service type (0x01 = digital TV, 0x02 = digital radio, ...).
    pub service_type: u8,
    /// Whether the service is scrambled.
    pub is_encrypted: bool,
    pub video_pid: Option<u16>,
    pub audio_pids: Vec<u16>,
}

/// Opaque identifier of one recording running on a feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordingKey(String);

impl RecordingKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordingKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RecordingKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RecordingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
