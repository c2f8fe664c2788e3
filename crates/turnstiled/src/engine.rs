use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use turnstile_core::{Embedding, ExtractError, FaceExtractor};

/// Pending requests the engine accepts before senders start waiting.
const ENGINE_QUEUE_DEPTH: usize = 8;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from request handlers to the engine thread.
struct ExtractRequest {
    image: Vec<u8>,
    reply: oneshot::Sender<Result<Embedding, ExtractError>>,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<ExtractRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Extract an embedding from encoded image bytes.
    ///
    /// The whole round trip, queueing included, is bounded by the engine's
    /// timeout. A timed-out request is dropped by the engine if it has not
    /// started yet.
    pub async fn extract(&self, image: Vec<u8>) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let round_trip = async {
            self.tx
                .send(ExtractRequest {
                    image,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            let result = reply_rx.await.map_err(|_| EngineError::ChannelClosed)?;
            Ok::<_, EngineError>(result?)
        };

        tokio::time::timeout(self.timeout, round_trip)
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))?
    }
}

/// Run `extractor` on a dedicated OS thread and return a handle to it.
///
/// Model inference is CPU-bound and needs `&mut` access, so a single thread
/// owns the extractor and serves requests in arrival order.
pub fn spawn_engine<E>(mut extractor: E, timeout: Duration) -> Result<EngineHandle, EngineError>
where
    E: FaceExtractor + 'static,
{
    let (tx, mut rx) = mpsc::channel::<ExtractRequest>(ENGINE_QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("turnstile-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(ExtractRequest { image, reply }) = rx.blocking_recv() {
                if reply.is_closed() {
                    tracing::debug!("caller gave up before extraction started; skipping");
                    continue;
                }
                let started = std::time::Instant::now();
                let result = extractor.extract(&image);
                tracing::debug!(
                    bytes = image.len(),
                    ok = result.is_ok(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "extraction finished"
                );
                let _ = reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, timeout })
}
