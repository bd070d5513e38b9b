use std::fmt;

use common::configuration::LogMode;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{propagation::TraceContextPropagator, trace::SdkTracerProvider};
use time::macros::format_description;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format, time::FormatTime, FmtContext, FormatEvent, FormatFields, FormattedFields,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_NAME: &str = "tollgate";

#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("failed to create OTLP span exporter: {0}")]
    Exporter(#[from] opentelemetry_otlp::ExporterBuildError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

struct BracketedTime;

impl FormatTime for BracketedTime {
    fn format_time(&self, w: &mut format::Writer<'_>) -> fmt::Result {
        let now = time::OffsetDateTime::now_utc();
        let formatted = now
            .format(&format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
            ))
            .map_err(|_| fmt::Error)?;
        write!(w, "[{formatted}]")
    }
}

/// `[timestamp][level] span fields event fields`, one line per event.
struct BracketedFormatter;

impl<S, N> FormatEvent<S, N> for BracketedFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        BracketedTime.format_time(&mut writer)?;

        write!(
            writer,
            "[{}] ",
            event.metadata().level().to_string().to_lowercase()
        )?;

        // request_id and key_id live on the enclosing spans
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{fields} ")?;
                    }
                }
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

fn env_filter(log_mode: LogMode) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_mode.default_filter()))
}

/// Install the global subscriber. With `OTEL_TRACING_ENABLED=true` spans are
/// also exported to `OTEL_COLLECTOR_URL` over OTLP.
pub fn init_tracer(log_mode: LogMode) -> Result<SdkTracerProvider, TracingError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel_endpoint = std::env::var("OTEL_COLLECTOR_URL")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let tracing_enabled = std::env::var("OTEL_TRACING_ENABLED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(false);

    if tracing_enabled {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&otel_endpoint)
            .build()?;

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .build();
        global::set_tracer_provider(provider.clone());

        let telemetry_layer =
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME));

        tracing_subscriber::registry()
            .with(telemetry_layer)
            .with(env_filter(log_mode))
            .with(tracing_subscriber::fmt::layer().event_format(BracketedFormatter))
            .try_init()?;

        Ok(provider)
    } else {
        // no-op provider keeps trace context propagation working
        let provider = SdkTracerProvider::builder().build();
        global::set_tracer_provider(provider.clone());

        tracing_subscriber::registry()
            .with(env_filter(log_mode))
            .with(tracing_subscriber::fmt::layer().event_format(BracketedFormatter))
            .try_init()?;

        Ok(provider)
    }
}
