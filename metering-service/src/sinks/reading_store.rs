use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use metering_client::domain::Reading;
use tokio::sync::Mutex;

use crate::{
    pipeline::{Envelope, PipelineError, Sink},
    store::ReadingStore,
};

/// Per-run outcome collected by [`ReadingStoreSink`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestTally {
    /// Device ids whose reading was stored (or would have been, in dry run).
    pub stored: Vec<String>,
    /// `(device_id, error)` for every device that produced no reading.
    pub failed: Vec<(String, String)>,
    /// Upstream errors that could not be attributed to a device.
    pub unattributed: Vec<String>,
}

/// Appends readings to a [`ReadingStore`] in batches.
///
/// Upstream errors are tallied, never fatal. A batch that still fails after
/// `max_retries` marks every device in it as failed and the sink moves on.
pub struct ReadingStoreSink<R: ?Sized> {
    store: Arc<R>,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
    dry_run: bool,
    tally: Arc<Mutex<IngestTally>>,
}

impl<R> ReadingStoreSink<R>
where
    R: ReadingStore + ?Sized,
{
    pub fn new(store: Arc<R>, batch_size: usize, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            max_retries,
            retry_backoff,
            dry_run: false,
            tally: Arc::new(Mutex::new(IngestTally::default())),
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Shared handle to the tally; read it after the pipeline finishes.
    pub fn tally(&self) -> Arc<Mutex<IngestTally>> {
        self.tally.clone()
    }

    async fn flush_batch(&self, batch: &[Envelope<Reading>]) {
        if batch.is_empty() {
            return;
        }

        if self.dry_run {
            let mut tally = self.tally.lock().await;
            tally.stored.extend(batch.iter().map(|e| e.payload.device_id.clone()));
            return;
        }

        let readings: Vec<Reading> = batch.iter().map(|e| e.payload.clone()).collect();
        let mut attempt: u32 = 0;
        loop {
            match self.store.append_batch(&readings).await {
                Ok(()) => {
                    metrics::counter!("readings_ingested_total").increment(readings.len() as u64);

                    if let Some(min_received) = batch.iter().map(|e| e.received_at).min() {
                        if let Ok(dur) = std::time::SystemTime::now().duration_since(min_received) {
                            metrics::histogram!("ingest_end_to_end_latency_seconds").record(dur.as_secs_f64());
                        }
                    }

                    let mut tally = self.tally.lock().await;
                    tally.stored.extend(readings.iter().map(|r| r.device_id.clone()));
                    return;
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    metrics::counter!("reading_sink_retries_total").increment(1);
                    tracing::warn!(error = %e, attempt, "reading sink flush failed, retrying with backoff");
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, batch = readings.len(), "reading sink flush failed, giving up");
                    metrics::counter!("reading_sink_errors_total").increment(1);
                    let message = PipelineError::Sink(e.to_string()).to_string();
                    let mut tally = self.tally.lock().await;
                    tally
                        .failed
                        .extend(readings.iter().map(|r| (r.device_id.clone(), message.clone())));
                    return;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl<R> Sink<Reading> for ReadingStoreSink<R>
where
    R: ReadingStore + ?Sized + 'static,
{
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<Reading>, PipelineError>> + Send + Unpin + 'static,
    {
        let mut buffer: Vec<Envelope<Reading>> = Vec::with_capacity(self.batch_size);

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!(error = %e, "reading dropped before reaching the store");
                    let mut tally = self.tally.lock().await;
                    match e.device_id() {
                        Some(device_id) => tally.failed.push((device_id.to_string(), e.to_string())),
                        None => tally.unattributed.push(e.to_string()),
                    }
                    continue;
                }
            };

            buffer.push(env);
            if buffer.len() >= self.batch_size {
                self.flush_batch(&buffer).await;
                buffer.clear();
            }
        }

        self.flush_batch(&buffer).await;

        Ok(())
    }
}
