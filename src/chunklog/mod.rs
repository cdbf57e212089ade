//! Records protocol chunks for later deterministic replay.
//!
//! The logger is an explicitly constructed component with its own lifecycle
//! (start/stop/export); nothing in the crate holds a global one. Records
//! export as JSON Lines, one record per chunk, and replay re-sorts by
//! sequence number because arrival order in the file is not guaranteed.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::api::Chunk;
use crate::core::message::Message;
use crate::core::reconciler::apply_chunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub mode: String,
    pub location: String,
    pub direction: LogDirection,
    pub sequence_number: u64,
    pub chunk: Chunk,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

pub struct ChunkLogger {
    session_id: String,
    mode: String,
    active: bool,
    records: Vec<ChunkRecord>,
    // Sequence counters are independent per location and start at 1.
    counters: HashMap<String, u64>,
}

impl ChunkLogger {
    pub fn new(session_id: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            mode: mode.into(),
            active: false,
            records: Vec::new(),
            counters: HashMap::new(),
        }
    }

    pub fn start(&mut self) {
        self.active = true;
    }

    pub fn stop(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn record(&mut self, location: &str, direction: LogDirection, chunk: &Chunk) {
        self.record_with_metadata(location, direction, chunk, None);
    }

    pub fn record_with_metadata(
        &mut self,
        location: &str,
        direction: LogDirection,
        chunk: &Chunk,
        metadata: Option<Value>,
    ) {
        if !self.active {
            return;
        }
        let counter = self.counters.entry(location.to_string()).or_insert(0);
        *counter += 1;
        self.records.push(ChunkRecord {
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            mode: self.mode.clone(),
            location: location.to_string(),
            direction,
            sequence_number: *counter,
            chunk: chunk.clone(),
            metadata,
        });
    }

    pub fn records(&self) -> &[ChunkRecord] {
        &self.records
    }

    /// Drop all records and counters, e.g. between test cases or sessions.
    pub fn clear(&mut self) {
        self.records.clear();
        self.counters.clear();
    }

    /// Write all records as JSON Lines. The file only replaces an existing
    /// one after the full export succeeded.
    pub fn export(&self, path: &Path) -> Result<usize, Box<dyn std::error::Error>> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp_file = NamedTempFile::new_in(parent)?;
        for record in &self.records {
            let line = serde_json::to_string(record)?;
            writeln!(temp_file, "{line}")?;
        }
        temp_file.flush()?;
        temp_file.persist(path)?;
        Ok(self.records.len())
    }
}

/// Read an exported log back. Blank lines are tolerated; anything else that
/// fails to parse is an error, since we only ever read our own exports.
pub fn read_log(path: &Path) -> Result<Vec<ChunkRecord>, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let mut records = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        records.push(serde_json::from_str::<ChunkRecord>(line)?);
    }
    Ok(records)
}

/// Chunks recorded at `location`, in playback order. Records are re-sorted
/// by sequence number first.
pub fn replay_chunks(records: &[ChunkRecord], location: &str) -> Vec<Chunk> {
    let mut at_location: Vec<&ChunkRecord> = records
        .iter()
        .filter(|record| record.location == location)
        .collect();
    at_location.sort_by_key(|record| record.sequence_number);
    at_location
        .into_iter()
        .map(|record| record.chunk.clone())
        .collect()
}

/// Replay a recorded stream through the reconciler, for deterministic tests
/// of the folding logic.
pub fn replay_into(records: &[ChunkRecord], location: &str, messages: &mut Vec<Message>) {
    for chunk in replay_chunks(records, location) {
        apply_chunk(messages, chunk);
    }
}
