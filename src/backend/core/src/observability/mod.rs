//! Observability: structured logging, distributed tracing and metrics.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Initialize the observability stack.
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init(service_name: &str, config: &ObservabilityConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Set up OpenTelemetry tracing if endpoint is provided
    let telemetry_layer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(
                    opentelemetry_sdk::trace::config()
                        .with_resource(opentelemetry_sdk::Resource::new(vec![
                            opentelemetry::KeyValue::new("service.name", service_name.to_string()),
                        ])),
                )
                .install_batch(opentelemetry_sdk::runtime::Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(telemetry_layer);

    if config.json_logging {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer())
            .try_init()?;
    }

    if let Some(addr) = config.metrics_addr.as_deref() {
        let addr: SocketAddr = addr.parse()?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .add_global_label("service", service_name)
            .install()?;
        tracing::info!(address = %addr, "Prometheus exporter listening");
    }

    metrics::register_metrics();

    Ok(())
}

/// Shutdown OpenTelemetry, flushing pending spans.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Metrics registry and helpers.
pub mod metrics {
    use metrics::{counter, describe_counter, describe_histogram, histogram};

    /// Register all metric descriptions.
    pub fn register_metrics() {
        describe_counter!("lectern_jobs_claimed_total", "Jobs leased by this process");
        describe_counter!("lectern_jobs_completed_total", "Jobs whose handler returned Ok");
        describe_counter!("lectern_jobs_failed_total", "Jobs whose handler returned an error");
        describe_counter!(
            "lectern_lease_conflicts_total",
            "Claims lost to another scheduler between select and compare-and-set"
        );
        describe_histogram!("lectern_job_duration_seconds", "Handler wall time in seconds");

        describe_counter!("lectern_renditions_encoded_total", "HLS renditions produced");
        describe_counter!("lectern_videos_timed_out_total", "Videos forced to failed by cleanup");

        describe_counter!("lectern_emails_sent_total", "Recipients accepted by the email provider");
        describe_counter!("lectern_email_batches_abandoned_total", "Batches given up after retries");

        describe_counter!("lectern_backups_completed_total", "Backups uploaded");
        describe_counter!("lectern_backups_failed_total", "Backups that failed");

        describe_counter!("lectern_errors_total", "Errors constructed, by code and category");
    }

    /// Record a finished handler run.
    pub fn record_job_finished(job_name: &str, succeeded: bool, duration_secs: f64) {
        let name = job_name.to_string();
        if succeeded {
            counter!("lectern_jobs_completed_total", "job" => name.clone()).increment(1);
        } else {
            counter!("lectern_jobs_failed_total", "job" => name.clone()).increment(1);
        }
        histogram!("lectern_job_duration_seconds", "job" => name).record(duration_secs);
    }

    pub fn record_job_claimed(job_name: &str) {
        counter!("lectern_jobs_claimed_total", "job" => job_name.to_string()).increment(1);
    }

    pub fn record_lease_conflict() {
        counter!("lectern_lease_conflicts_total").increment(1);
    }

    pub fn record_rendition(quality: &str) {
        counter!("lectern_renditions_encoded_total", "quality" => quality.to_string()).increment(1);
    }

    pub fn record_videos_timed_out(count: u64) {
        counter!("lectern_videos_timed_out_total").increment(count);
    }

    pub fn record_emails_sent(count: u64) {
        counter!("lectern_emails_sent_total").increment(count);
    }

    pub fn record_batch_abandoned() {
        counter!("lectern_email_batches_abandoned_total").increment(1);
    }

    pub fn record_backup(succeeded: bool) {
        if succeeded {
            counter!("lectern_backups_completed_total").increment(1);
        } else {
            counter!("lectern_backups_failed_total").increment(1);
        }
    }
}
