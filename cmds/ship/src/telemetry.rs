//! Tracing and log output setup for the ship binary.

use std::io::IsTerminal;

use anyhow::Result;
use clap::ValueEnum;
use opentelemetry::{trace::TracerProvider as _, KeyValue};
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable for service name (not exported by opentelemetry_sdk).
const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";

const SERVICE_NAME: &str = "ship";

/// How log lines are rendered on stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
	/// Pretty when stderr is a terminal, JSON otherwise
	#[default]
	Auto,
	Pretty,
	Json,
}

impl LogFormat {
	fn is_pretty(self) -> bool {
		match self {
			Self::Auto => std::io::stderr().is_terminal(),
			Self::Pretty => true,
			Self::Json => false,
		}
	}
}

/// Keeps the OpenTelemetry pipeline alive; traces are flushed on drop.
pub struct TelemetryGuard {
	tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
	fn drop(&mut self) {
		if let Some(provider) = self.tracer_provider.take() {
			if let Err(e) = provider.shutdown() {
				eprintln!("Failed to shutdown tracer provider: {e}");
			}
		}
	}
}

/// Check if OpenTelemetry export is configured via environment variables.
fn otel_export_enabled() -> bool {
	std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_ENDPOINT).is_ok()
		|| std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_TRACES_ENDPOINT).is_ok()
}

/// Build the level filter: the CLI flag wins over `RUST_LOG`, which wins over `info`.
fn env_filter(log_level: Option<Level>) -> EnvFilter {
	match log_level {
		Some(level) => EnvFilter::new(level.as_str()),
		None => EnvFilter::builder()
			.with_default_directive(Level::INFO.into())
			.from_env_lossy(),
	}
}

/// Install the global subscriber.
///
/// OpenTelemetry export is enabled by `OTEL_EXPORTER_OTLP_ENDPOINT` or
/// `OTEL_EXPORTER_OTLP_TRACES_ENDPOINT` and configured through the standard
/// OTEL variables. The service name defaults to "ship".
pub fn init(log_level: Option<Level>, format: LogFormat) -> Result<TelemetryGuard> {
	let fmt_layer = if format.is_pretty() {
		tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.pretty()
			.boxed()
	} else {
		tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.json()
			.boxed()
	};

	let tracer_provider = if otel_export_enabled() {
		Some(init_tracer_provider()?)
	} else {
		None
	};
	let otel_layer = tracer_provider.as_ref().map(|provider| {
		tracing_opentelemetry::layer()
			.with_error_records_to_exceptions(true)
			.with_tracer(provider.tracer(SERVICE_NAME))
	});

	tracing_subscriber::registry()
		.with(env_filter(log_level))
		.with(fmt_layer)
		.with(otel_layer)
		.init();

	Ok(TelemetryGuard { tracer_provider })
}

fn init_tracer_provider() -> Result<SdkTracerProvider> {
	use opentelemetry_sdk::Resource;

	// Resource::builder() reads `OTEL_SERVICE_NAME` and `OTEL_RESOURCE_ATTRIBUTES` itself
	let mut resource_builder =
		Resource::builder().with_attribute(KeyValue::new("service.version", env!("SHIP_VERSION")));
	if std::env::var(OTEL_SERVICE_NAME).is_err() {
		resource_builder = resource_builder.with_service_name(SERVICE_NAME);
	}

	let exporter = match std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_PROTOCOL)
		.as_deref()
		.unwrap_or(opentelemetry_otlp::OTEL_EXPORTER_OTLP_PROTOCOL_DEFAULT)
	{
		"grpc" => opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.build()?,
		_ => opentelemetry_otlp::SpanExporter::builder()
			.with_http()
			.build()?,
	};

	let tracer_provider = SdkTracerProvider::builder()
		.with_resource(resource_builder.build())
		.with_batch_exporter(exporter)
		.build();
	opentelemetry::global::set_tracer_provider(tracer_provider.clone());

	Ok(tracer_provider)
}
