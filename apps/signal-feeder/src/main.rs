use anyhow::Result;
use signal_feeder::config::{Config, LogFormat};
use signal_feeder::encoder::MetricEncoder;
use signal_feeder::pipeline::Pipeline;
use signal_feeder::publisher::Publisher;
use signal_feeder::signal::SignalSource;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::{EnvFilter, Layer, Registry};

type FmtLayer = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

/// Records whether an OTLP pipeline was installed; `shutdown` flushes it
/// through the global tracer provider.
struct TelemetryGuard {
    otlp: bool,
}

impl TelemetryGuard {
    fn shutdown(self) {
        if self.otlp {
            opentelemetry::global::shutdown_tracer_provider();
        }
    }
}

fn init_tracing(config: &Config) -> Result<TelemetryGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,signal_feeder=info".into());
    let fmt_layer: FmtLayer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .boxed(),
    };
    let otel_layer = match config.otlp_endpoint.as_deref().and_then(otlp_traces_url) {
        Some(url) => Some(tracing_opentelemetry::layer().with_tracer(otlp_tracer(url)?)),
        None => None,
    };
    let otlp = otel_layer.is_some();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;
    Ok(TelemetryGuard { otlp })
}

fn otlp_tracer(traces_url: String) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as TraceConfig, Resource};

    let exporter = opentelemetry_otlp::new_exporter()
        .http()
        .with_endpoint(traces_url);
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(TraceConfig::default().with_resource(Resource::new(vec![
            KeyValue::new("service.name", "signal-feeder"),
        ])))
        .install_batch(Tokio)?;
    Ok(tracer)
}

/// The HTTP exporter posts to the URL as given, so the collector base needs
/// the traces path. A blank endpoint disables export.
fn otlp_traces_url(endpoint: &str) -> Option<String> {
    let base = endpoint.trim().trim_end_matches('/');
    if base.is_empty() {
        return None;
    }
    if base.ends_with("/v1/traces") {
        Some(base.to_string())
    } else {
        Some(format!("{base}/v1/traces"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    let telemetry = init_tracing(&config)?;

    let endpoint = config.endpoint();
    tracing::info!(url = %endpoint.write_url(), "ready to send data");

    let publisher = Publisher::new(&endpoint, config.http_timeout())?;
    let pipeline = Pipeline::new(
        SignalSource::new(config.inclusive_end),
        MetricEncoder::new(config.tags()),
        publisher,
        config.handoff_capacity,
    );

    let cancel = CancellationToken::new();
    let signal_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                cancel.cancel();
            }
        })
    };

    let result = pipeline.run(cancel).await;
    signal_handle.abort();
    if let Err(err) = &result {
        tracing::error!(error=%err, "signal pipeline aborted");
    }

    telemetry.shutdown();
    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::otlp_traces_url;

    #[test]
    fn appends_traces_path_once() {
        assert_eq!(
            otlp_traces_url("http://collector:4318/").as_deref(),
            Some("http://collector:4318/v1/traces")
        );
        assert_eq!(
            otlp_traces_url(" http://collector:4318/v1/traces ").as_deref(),
            Some("http://collector:4318/v1/traces")
        );
    }

    #[test]
    fn blank_endpoint_disables_export() {
        assert_eq!(otlp_traces_url("   "), None);
        assert_eq!(otlp_traces_url("/"), None);
    }
}
