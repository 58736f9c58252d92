use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, WithExportConfig};
use opentelemetry_sdk::{Resource, logs::SdkLoggerProvider};
use tracing::Level;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, Layer, Registry, filter::Targets, fmt, prelude::*};

pub const LOG_FILE: &str = "toolmux.log";
pub const EVENT_FILE: &str = "toolmux_events.log";
/// Target of the per-message routing events that end up in [`EVENT_FILE`].
pub const ROUTING_TARGET: &str = "routing";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct LogSettings {
    /// `EnvFilter` directive, e.g. `info` or `toolmux=debug`.
    pub level: String,
    /// Daily rolling text + JSON files go here when set.
    pub log_dir: Option<PathBuf>,
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`.
    pub otel_endpoint: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            otel_endpoint: None,
        }
    }
}

/// Keep alive for as long as logs should be written. Dropping it flushes
/// the file writers and shuts the OTLP exporter down.
#[derive(Default)]
pub struct LogGuard {
    file_guards: Vec<WorkerGuard>,
    otel: Option<SdkLoggerProvider>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.otel.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to shut down OTLP log exporter: {e}");
            }
        }
        self.file_guards.clear();
    }
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init_tracing(settings: &LogSettings) -> Result<LogGuard> {
    let (layers, guard) = build_layers(settings)?;
    Registry::default()
        .with(layers)
        .try_init()
        .context("a global tracing subscriber is already installed")?;
    Ok(guard)
}

fn build_layers(settings: &LogSettings) -> Result<(Vec<BoxedLayer>, LogGuard)> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = LogGuard::default();

    layers.push(
        fmt::layer()
            .with_target(false)
            .with_filter(level_filter(&settings.level)?)
            .boxed(),
    );

    if let Some(dir) = &settings.log_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("cannot create log directory {}", dir.display()))?;

        let (txt_writer, txt_guard) = tracing_appender::non_blocking(rolling::daily(dir, LOG_FILE));
        layers.push(
            fmt::layer()
                .with_writer(txt_writer)
                .with_ansi(false)
                .with_filter(level_filter(&settings.level)?)
                .boxed(),
        );

        // newline-delimited JSON, routing events only
        let (json_writer, json_guard) =
            tracing_appender::non_blocking(rolling::daily(dir, EVENT_FILE));
        layers.push(
            fmt::layer()
                .json()
                .with_writer(json_writer)
                .with_target(true)
                .with_filter(Targets::new().with_target(ROUTING_TARGET, Level::DEBUG))
                .boxed(),
        );

        guard.file_guards.push(txt_guard);
        guard.file_guards.push(json_guard);
    }

    if let Some(endpoint) = &settings.otel_endpoint {
        let provider = init_logs(endpoint)?;
        let filter = level_filter(&settings.level)?
            .add_directive("hyper=off".parse()?)
            .add_directive("tonic=off".parse()?)
            .add_directive("h2=off".parse()?);
        layers.push(
            OpenTelemetryTracingBridge::new(&provider)
                .with_filter(filter)
                .boxed(),
        );
        guard.otel = Some(provider);
    }

    Ok((layers, guard))
}

fn level_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level).with_context(|| format!("invalid log level `{level}`"))
}

fn init_logs(endpoint: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .with_context(|| format!("cannot build OTLP log exporter for {endpoint}"))?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(Resource::builder().with_service_name("toolmux").build())
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{event, info};

    fn read_prefixed(dir: &std::path::Path, prefix: &str) -> String {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
            .map(|e| fs::read_to_string(e.path()).unwrap())
            .collect()
    }

    #[test]
    fn test_routing_events_go_to_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = LogSettings {
            level: "info".to_string(),
            log_dir: Some(dir.path().to_path_buf()),
            otel_endpoint: None,
        };
        let (layers, guard) = build_layers(&settings).unwrap();
        let subscriber = Registry::default().with(layers);

        tracing::subscriber::with_default(subscriber, || {
            event!(target: "routing", Level::DEBUG, worker = "calc", "forwarded");
            info!("plain line");
        });
        drop(guard);

        let events = read_prefixed(dir.path(), EVENT_FILE);
        assert!(events.contains("forwarded"));
        assert!(events.contains("calc"));
        assert!(!events.contains("plain line"));

        let text = read_prefixed(dir.path(), LOG_FILE);
        assert!(text.contains("plain line"));
        // debug is below the text file's level
        assert!(!text.contains("forwarded"));
    }
}
