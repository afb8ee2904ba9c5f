//! Per-session emotion history.
//!
//! Each browser session (keyed by the cookie UUID) accumulates a running
//! count per emotion plus a timestamped log of every detection, exported
//! on demand as CSV. State lives in memory only and idle sessions are
//! pruned whenever a new one starts.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use moodcam_core::types::{Detection, Emotion, EmotionCounts};
use uuid::Uuid;

// --- Named constants ---

const CSV_HEADER: [&str; 2] = ["Timestamp", "Detected Emotion"];
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

struct LogEntry {
    timestamp: DateTime<Utc>,
    emotion: Emotion,
}

struct SessionData {
    counts: EmotionCounts,
    log: Vec<LogEntry>,
    last_seen: Instant,
}

impl SessionData {
    fn new() -> Self {
        Self {
            counts: EmotionCounts::new(),
            log: Vec::new(),
            last_seen: Instant::now(),
        }
    }
}

/// In-memory session table shared by the HTTP and WebSocket handlers.
pub struct SessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<Uuid, SessionData>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, SessionData>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start `id` from a clean slate, dropping any sessions idle past the TTL.
    pub fn reset(&self, id: Uuid) {
        let mut sessions = self.lock();
        sessions.retain(|other, data| *other == id || data.last_seen.elapsed() < self.ttl);
        sessions.insert(id, SessionData::new());
        tracing::debug!(session = %id, active = sessions.len(), "session reset");
    }

    /// Append one log entry per detection and bump the matching counters.
    /// Counts and log move together, under one lock.
    pub fn record(&self, id: Uuid, detections: &[Detection]) {
        let mut sessions = self.lock();
        let data = sessions.entry(id).or_insert_with(SessionData::new);
        data.last_seen = Instant::now();
        let now = Utc::now();
        for detection in detections {
            data.counts.increment(detection.emotion);
            data.log.push(LogEntry {
                timestamp: now,
                emotion: detection.emotion,
            });
        }
    }

    /// Snapshot of the per-emotion counters; all zeros for an unknown session.
    pub fn counts(&self, id: Uuid) -> EmotionCounts {
        self.lock()
            .get(&id)
            .map(|data| data.counts.clone())
            .unwrap_or_default()
    }

    /// Render the detection log as CSV. An unknown session yields only
    /// the header row.
    pub fn export_csv(&self, id: Uuid) -> Result<String, csv::Error> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(CSV_HEADER)?;

        let sessions = self.lock();
        if let Some(data) = sessions.get(&id) {
            for entry in &data.log {
                writer.write_record([
                    entry.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                    entry.emotion.label().to_string(),
                ])?;
            }
        }
        drop(sessions);

        let bytes = writer.into_inner().map_err(|e| e.into_error())?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
