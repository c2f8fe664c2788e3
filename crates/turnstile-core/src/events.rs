//! Append-only sighting log persisted as a JSON array.

use crate::storage::{self, StorageError};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Column order of the CSV export.
pub const CSV_HEADER: &str = "timestamp,camera,person,score";

#[derive(Error, Debug)]
pub enum EventStoreError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

/// One accepted sighting.
///
/// `source` is stored and exported under the name `camera`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub person: String,
    pub score: f64,
    #[serde(rename = "camera")]
    pub source: String,
    /// ISO-8601 timestamp, stored as supplied.
    pub timestamp: String,
}

impl Event {
    fn validate(&self) -> Result<(), EventStoreError> {
        if self.person.is_empty() {
            return Err(EventStoreError::InvalidEvent("person must not be empty".into()));
        }
        if !self.score.is_finite() {
            return Err(EventStoreError::InvalidEvent(format!(
                "score must be a finite number, got {}",
                self.score
            )));
        }
        Ok(())
    }
}

/// Round a similarity score to three decimals for storage and display.
pub fn round_score(score: f64) -> f64 {
    (score * 1000.0).round() / 1000.0
}

/// Current time as an RFC 3339 UTC string plus seconds since the epoch.
pub fn now_timestamp() -> (String, f64) {
    let now = Utc::now();
    (
        now.to_rfc3339_opts(SecondsFormat::Micros, true),
        epoch_seconds(&now),
    )
}

/// Parse an ISO-8601 timestamp into seconds since the epoch.
///
/// Accepts RFC 3339 (with offset) or a naive `YYYY-MM-DDTHH:MM:SS[.frac]`
/// date-time, which is taken to be UTC.
pub fn parse_timestamp(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(epoch_seconds(&dt.with_timezone(&Utc)));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| epoch_seconds(&naive.and_utc()))
}

fn epoch_seconds(dt: &DateTime<Utc>) -> f64 {
    dt.timestamp_micros() as f64 / 1_000_000.0
}

pub struct EventStore {
    path: PathBuf,
    events: Mutex<Vec<Event>>,
}

impl EventStore {
    /// Open the event log at `path`.
    ///
    /// A missing, unreadable, or unparseable file yields an empty log; the
    /// failure is logged at warn level and the old file is kept aside as
    /// `<path>.corrupt`. Startup never fails because of stored events.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let events: Vec<Event> = storage::load_or_default(&path, "events");
        tracing::info!(path = %path.display(), count = events.len(), "events loaded");
        Self {
            path,
            events: Mutex::new(events),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `event` and flush the full log. Returns the new event count.
    ///
    /// If the flush fails the event is dropped from memory too.
    pub fn append(&self, event: Event) -> Result<usize, EventStoreError> {
        event.validate()?;

        let mut events = self.lock();
        events.push(event);
        if let Err(err) = storage::write_json_atomic(&self.path, events.as_slice()) {
            events.pop();
            return Err(err.into());
        }
        Ok(events.len())
    }

    /// All events, newest first. Storage order is unchanged.
    pub fn list(&self) -> Vec<Event> {
        self.lock().iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove every event and persist the empty log.
    pub fn clear(&self) -> Result<(), EventStoreError> {
        let mut events = self.lock();
        storage::write_json_atomic(&self.path, &[] as &[Event])?;
        let dropped = events.len();
        events.clear();
        tracing::info!(dropped, "events cleared");
        Ok(())
    }

    /// CSV export in insertion order: header row, then one row per event.
    pub fn export_csv(&self) -> Vec<u8> {
        let events = self.lock();
        let mut out = String::with_capacity(32 * (events.len() + 1));
        out.push_str(CSV_HEADER);
        out.push_str("\r\n");
        for e in events.iter() {
            let score = format_score(e.score);
            let row = [
                e.timestamp.as_str(),
                e.source.as_str(),
                e.person.as_str(),
                score.as_str(),
            ];
            for (i, field) in row.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                push_csv_field(&mut out, field);
            }
            out.push_str("\r\n");
        }
        out.into_bytes()
    }
}

fn format_score(score: f64) -> String {
    if score.fract() == 0.0 {
        format!("{score:.1}")
    } else {
        score.to_string()
    }
}

fn push_csv_field(out: &mut String, field: &str) {
    if field.contains(&[',', '"', '\r', '\n'][..]) {
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(field);
    }
}
