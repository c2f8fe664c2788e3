//! Request operations shared by every transport.
//!
//! `Service` owns the stores, the debounce cache, and a handle to the engine
//! thread. It is built once in `main` and handed to the HTTP layer behind an
//! `Arc`. Store mutations do blocking file I/O and run on the blocking pool.

use crate::engine::{EngineError, EngineHandle};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use turnstile_core::events::{now_timestamp, parse_timestamp, round_score};
use turnstile_core::{
    CosineMatcher, DebounceCache, Embedding, Event, EventStore, EventStoreError, ExtractError,
    GalleryError, GalleryStore, MatchError, MatchResult, Matcher,
};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("name is required")]
    MissingName,
    #[error("field '{0}' is required")]
    MissingField(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("no usable images: {0}")]
    NoUsableImages(String),
    #[error("Cannot decode image: {0}")]
    DecodeError(String),
    #[error("request body too large: {0}")]
    PayloadTooLarge(String),
    #[error("No face detected")]
    NoFaceDetected,
    #[error("gallery empty, enroll first")]
    EmptyGallery,
    #[error("extraction timed out after {0:?}")]
    ExtractionTimeout(Duration),
    #[error("storage: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Extract(ExtractError::Decode(msg)) => Self::DecodeError(msg),
            EngineError::Extract(ExtractError::NoFaceDetected) => Self::NoFaceDetected,
            EngineError::Extract(e @ ExtractError::Inference(_)) => Self::Internal(e.to_string()),
            EngineError::Timeout(after) => Self::ExtractionTimeout(after),
            e @ (EngineError::Spawn(_) | EngineError::ChannelClosed) => {
                Self::Internal(e.to_string())
            }
        }
    }
}

impl From<GalleryError> for ServiceError {
    fn from(err: GalleryError) -> Self {
        match err {
            GalleryError::InvalidInput(msg) => Self::InvalidInput(msg),
            GalleryError::Storage(e) => Self::Storage(e.to_string()),
        }
    }
}

impl From<EventStoreError> for ServiceError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::InvalidEvent(msg) => Self::InvalidInput(msg),
            EventStoreError::Storage(e) => Self::Storage(e.to_string()),
        }
    }
}

impl From<MatchError> for ServiceError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::EmptyGallery => Self::EmptyGallery,
            other => Self::InvalidInput(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrollOutcome {
    pub name: String,
    /// Images that produced an embedding and went into the average.
    pub images: usize,
    /// Every enrolled name after this enrollment, sorted.
    pub people: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub result: MatchResult,
    pub threshold: f32,
    /// Whether this match was recorded as a new event.
    pub logged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    /// `false` when the debounce window suppressed the event.
    pub accepted: bool,
    /// Events in the log after the call.
    pub count: usize,
}

pub struct Service {
    gallery: Arc<GalleryStore>,
    events: Arc<EventStore>,
    debounce: DebounceCache,
    engine: EngineHandle,
    matcher: CosineMatcher,
}

impl Service {
    pub fn new(
        gallery: GalleryStore,
        events: EventStore,
        debounce: DebounceCache,
        engine: EngineHandle,
    ) -> Self {
        Self {
            gallery: Arc::new(gallery),
            events: Arc::new(events),
            debounce,
            engine,
            matcher: CosineMatcher,
        }
    }

    /// Enroll `name` from one or more sample images.
    ///
    /// Images the extractor rejects are skipped. The reference embedding is
    /// the mean over the rest and replaces any previous one for `name`.
    pub async fn enroll(
        &self,
        name: &str,
        images: Vec<Vec<u8>>,
    ) -> Result<EnrollOutcome, ServiceError> {
        if name.trim().is_empty() {
            return Err(ServiceError::MissingName);
        }
        if images.is_empty() {
            return Err(ServiceError::MissingField("files".into()));
        }

        let total = images.len();
        let mut samples: Vec<Embedding> = Vec::with_capacity(total);
        let mut last_failure = None;
        for (index, image) in images.into_iter().enumerate() {
            match self.engine.extract(image).await {
                Ok(embedding) => samples.push(embedding),
                Err(EngineError::Extract(err)) => {
                    tracing::warn!(name, index, error = %err, "enrollment image skipped");
                    last_failure = Some(err);
                }
                Err(err) => return Err(err.into()),
            }
        }

        if samples.is_empty() {
            let reason = last_failure
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no images".into());
            return Err(ServiceError::NoUsableImages(reason));
        }

        let used = samples.len();
        let gallery = Arc::clone(&self.gallery);
        let owned_name = name.to_string();
        let entry =
            tokio::task::spawn_blocking(move || gallery.upsert_average(&owned_name, &samples))
                .await??;

        tracing::info!(name = %entry.name, samples = used, skipped = total - used, "enrolled");

        Ok(EnrollOutcome {
            name: entry.name,
            images: used,
            people: self.gallery.list(),
        })
    }

    /// Identify the face in `image` and log a sighting if it matches.
    ///
    /// Only a match at or above `threshold` can create an event, and only if
    /// the debounce window for (best name, `source`) allows it.
    pub async fn match_face(
        &self,
        image: Vec<u8>,
        threshold: f32,
        source: &str,
    ) -> Result<MatchOutcome, ServiceError> {
        if !threshold.is_finite() {
            return Err(ServiceError::InvalidInput(format!(
                "threshold must be a finite number, got {threshold}"
            )));
        }
        if self.gallery.is_empty() {
            return Err(ServiceError::EmptyGallery);
        }

        let query = self.engine.extract(image).await?;
        let gallery = self.gallery.snapshot();
        let result = self.matcher.compare(&query, &gallery, threshold)?;

        let mut logged = false;
        if result.is_match {
            let (timestamp, secs) = now_timestamp();
            let event = Event {
                person: result.best_name.clone(),
                score: round_score(f64::from(result.best_score)),
                source: source.to_string(),
                timestamp,
            };
            logged = self.append_debounced(event, secs).await?.is_some();
        }

        tracing::debug!(
            best = %result.best_name,
            score = result.best_score,
            is_match = result.is_match,
            logged,
            source,
            "match"
        );

        Ok(MatchOutcome {
            result,
            threshold,
            logged,
        })
    }

    /// Log a sighting supplied by the caller, matched or not.
    ///
    /// `timestamp` defaults to now. It is stored as given and parsed only to
    /// apply the debounce window.
    pub async fn record_event(
        &self,
        person: &str,
        score: f64,
        source: &str,
        timestamp: Option<String>,
    ) -> Result<RecordOutcome, ServiceError> {
        if person.is_empty() {
            return Err(ServiceError::InvalidInput("person must not be empty".into()));
        }
        if !score.is_finite() {
            return Err(ServiceError::InvalidInput(format!(
                "score must be a finite number, got {score}"
            )));
        }

        let (timestamp, secs) = match timestamp {
            Some(raw) => {
                let secs = parse_timestamp(&raw).ok_or_else(|| {
                    ServiceError::InvalidInput(format!("unrecognized timestamp '{raw}'"))
                })?;
                (raw, secs)
            }
            None => now_timestamp(),
        };

        let event = Event {
            person: person.to_string(),
            score: round_score(score),
            source: source.to_string(),
            timestamp,
        };

        match self.append_debounced(event, secs).await? {
            Some(count) => Ok(RecordOutcome {
                accepted: true,
                count,
            }),
            None => Ok(RecordOutcome {
                accepted: false,
                count: self.events.len(),
            }),
        }
    }

    /// Newest first.
    pub fn list_events(&self) -> Vec<Event> {
        self.events.list()
    }

    pub async fn clear_events(&self) -> Result<(), ServiceError> {
        let events = Arc::clone(&self.events);
        tokio::task::spawn_blocking(move || events.clear()).await??;
        Ok(())
    }

    /// CSV bytes in insertion order.
    pub fn export_events_csv(&self) -> Vec<u8> {
        self.events.export_csv()
    }

    /// Enrolled names, sorted.
    pub fn people(&self) -> Vec<String> {
        self.gallery.list()
    }

    /// Append `event` unless the debounce window suppresses it.
    ///
    /// Returns the new event count, or `None` for a suppressed duplicate. If
    /// the append fails the debounce slot is released again.
    async fn append_debounced(
        &self,
        event: Event,
        secs: f64,
    ) -> Result<Option<usize>, ServiceError> {
        if !self.debounce.should_accept(&event.person, &event.source, secs) {
            tracing::debug!(
                person = %event.person,
                source = %event.source,
                "duplicate sighting suppressed"
            );
            return Ok(None);
        }

        let person = event.person.clone();
        let source = event.source.clone();
        let store = Arc::clone(&self.events);
        let appended = tokio::task::spawn_blocking(move || store.append(event))
            .await
            .map_err(ServiceError::from)
            .and_then(|r| r.map_err(ServiceError::from));

        match appended {
            Ok(count) => {
                tracing::info!(%person, %source, count, "event logged");
                Ok(Some(count))
            }
            Err(err) => {
                self.debounce.revoke(&person, &source, secs);
                Err(err)
            }
        }
    }
}
