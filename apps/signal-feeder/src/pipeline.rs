use crate::encoder::MetricEncoder;
use crate::handoff::{self, HandoffReceiver, HandoffSender};
use crate::publisher::{PublishSummary, Publisher};
use crate::signal::{Sample, SignalSource};
use crate::telemetry::Metric;
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;


#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub emitted: u64,
    pub encoded: u64,
    pub delivery: PublishSummary,
}

/// source -> encoder -> publisher, one task per stage.
pub struct Pipeline {
    source: SignalSource,
    encoder: MetricEncoder,
    publisher: Publisher,
    handoff_capacity: usize,
}

impl Pipeline {
    pub fn new(
        source: SignalSource,
        encoder: MetricEncoder,
        publisher: Publisher,
        handoff_capacity: usize,
    ) -> Self {
        Self {
            source,
            encoder,
            publisher,
            handoff_capacity,
        }
    }

    /// Runs until the source is exhausted (or `cancel` fires) and every
    /// handed-off point has been published, then joins all stages.
    pub async fn run(self, cancel: CancellationToken) -> Result<PipelineSummary> {
        let (sample_tx, sample_rx) = handoff::channel::<Sample>(self.handoff_capacity);
        let (metric_tx, metric_rx) = handoff::channel::<Metric>(self.handoff_capacity);
        let stats = self.publisher.stats();

        tracing::info!(
            url = %self.publisher.url(),
            samples = self.source.len(),
            handoff_capacity = self.handoff_capacity,
            "starting signal pipeline"
        );

        let source_handle = tokio::spawn(
            run_source(self.source, sample_tx, cancel)
                .instrument(tracing::info_span!("stage", name = "source")),
        );
        let encoder_handle = tokio::spawn(
            run_encoder(self.encoder, sample_rx, metric_tx)
                .instrument(tracing::info_span!("stage", name = "encoder")),
        );
        let publisher_handle = tokio::spawn(
            run_publisher(self.publisher, metric_rx)
                .instrument(tracing::info_span!("stage", name = "publisher")),
        );

        let (emitted, encoded, ()) =
            tokio::try_join!(source_handle, encoder_handle, publisher_handle)
                .context("pipeline stage task failed")?;

        let summary = PipelineSummary {
            emitted,
            encoded,
            delivery: stats.snapshot(),
        };
        tracing::info!(
            emitted = summary.emitted,
            published = summary.delivery.published,
            rejected = summary.delivery.rejected,
            failed = summary.delivery.failed,
            "signal pipeline finished"
        );
        Ok(summary)
    }
}

/// Cancellation is checked between samples. A send already under way runs to
/// completion so every sample the encoder received is counted as emitted.
async fn run_source(
    source: SignalSource,
    tx: HandoffSender<Sample>,
    cancel: CancellationToken,
) -> u64 {
    let mut emitted = 0;
    for sample in source {
        if cancel.is_cancelled() {
            tracing::info!(emitted, "signal source cancelled");
            break;
        }
        if tx.send(sample).await.is_err() {
            tracing::debug!("encoder stage gone; stopping source");
            break;
        }
        emitted += 1;
    }
    emitted
}

async fn run_encoder(
    encoder: MetricEncoder,
    mut rx: HandoffReceiver<Sample>,
    tx: HandoffSender<Metric>,
) -> u64 {
    let mut encoded = 0;
    while let Some(sample) = rx.recv().await {
        tracing::trace!(degree = sample.degree, value = sample.value, "encoding sample");
        if tx.send(encoder.encode(sample)).await.is_err() {
            tracing::debug!("publisher stage gone; stopping encoder");
            break;
        }
        encoded += 1;
    }
    encoded
}

async fn run_publisher(publisher: Publisher, mut rx: HandoffReceiver<Metric>) {
    while let Some(metric) = rx.recv().await {
        publisher.deliver(metric).await;
    }
}
