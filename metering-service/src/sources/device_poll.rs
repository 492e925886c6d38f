use std::{sync::Arc, time::Duration};

use futures::{stream, StreamExt};
use metering_client::domain::{MeterDevice, Reading};
use time::OffsetDateTime;

use crate::{
    gateway::{DeviceGateway, GatewayError},
    ingest::accumulate::build_reading,
    pipeline::{Envelope, EnvelopeStream, PipelineError, Source},
    store::ReadingStore,
};

/// Polls every device once and yields one reading (or one error) per device.
///
/// At most `parallel` gateway calls are in flight; each call is bounded by
/// `device_timeout` and a timed-out device is reported, never retried.
pub struct DevicePollSource<R: ?Sized> {
    devices: Vec<MeterDevice>,
    gateway: Arc<dyn DeviceGateway>,
    store: Arc<R>,
    parallel: usize,
    device_timeout: Duration,
}

impl<R> DevicePollSource<R>
where
    R: ReadingStore + ?Sized + 'static,
{
    pub fn new(
        devices: Vec<MeterDevice>,
        gateway: Arc<dyn DeviceGateway>,
        store: Arc<R>,
        parallel: usize,
        device_timeout: Duration,
    ) -> Self {
        Self {
            devices,
            gateway,
            store,
            parallel: parallel.max(1),
            device_timeout,
        }
    }
}

async fn poll_device<R>(
    gateway: Arc<dyn DeviceGateway>,
    store: Arc<R>,
    device: MeterDevice,
    device_timeout: Duration,
) -> Result<Envelope<Reading>, PipelineError>
where
    R: ReadingStore + ?Sized,
{
    let kind = device.kind.as_str();
    let device_err = |message: String| PipelineError::Device {
        device_id: device.device_id.clone(),
        message,
    };

    metrics::counter!("device_polls_total", "kind" => kind).increment(1);
    let started = std::time::Instant::now();
    let status = tokio::time::timeout(device_timeout, gateway.device_status(&device.device_id))
        .await
        .unwrap_or_else(|_| Err(GatewayError::Timeout(device_timeout)));
    metrics::histogram!("device_poll_latency_seconds", "kind" => kind).record(started.elapsed().as_secs_f64());

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            metrics::counter!("device_poll_failures_total", "kind" => kind).increment(1);
            tracing::warn!(device_id = %device.device_id, room = %device.room_number, error = %e, "device poll failed");
            return Err(device_err(e.to_string()));
        }
    };

    let at = OffsetDateTime::now_utc();
    let previous = store
        .latest_before(&device.device_id, device.kind, at)
        .await
        .map_err(|e| device_err(e.to_string()))?;

    Ok(Envelope::now(build_reading(&device, &status, previous.as_ref(), at)))
}

#[async_trait::async_trait]
impl<R> Source<Reading> for DevicePollSource<R>
where
    R: ReadingStore + ?Sized + 'static,
{
    async fn stream(&self) -> EnvelopeStream<Reading> {
        let gateway = self.gateway.clone();
        let store = self.store.clone();
        let device_timeout = self.device_timeout;

        let polls = stream::iter(self.devices.clone())
            .map(move |device| poll_device(gateway.clone(), store.clone(), device, device_timeout))
            .buffer_unordered(self.parallel);

        Box::pin(polls)
    }
}
