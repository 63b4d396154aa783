use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{propagation::TraceContextPropagator, trace::Sampler};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::{fmt::format::FmtSpan, prelude::*};

/// Installs the global subscriber: an `EnvFilter` (default `info`), a fmt
/// layer on stderr and an OpenTelemetry layer. Spans are exported over OTLP
/// only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
pub fn init_tracing(
    service_name: &'static str,
) -> anyhow::Result<opentelemetry_sdk::trace::SdkTracerProvider> {
    opentelemetry::global::set_text_map_propagator(
        TraceContextPropagator::new(),
    );

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .filter(|s| !s.is_empty());

    let sampling_ratio = std::env::var("OTEL_TRACES_SAMPLER_RATE")
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.1);

    // Remote parents decide for their children.
    let sampler = Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
        sampling_ratio,
    )));
    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(service_name)
        .build();

    let mut builder = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_sampler(sampler)
        .with_resource(resource);
    if let Some(endpoint) = otlp_endpoint {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&endpoint)
            .build()?;
        builder = builder.with_batch_exporter(exporter);
    }
    let tracer_provider = builder.build();

    opentelemetry::global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(service_name);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE),
        )
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()?;

    Ok(tracer_provider)
}

/// Builds an outbound RPC context carrying the current span's trace and a
/// deadline `timeout` from now.
pub fn rpc_context(timeout: Duration) -> tarpc::context::Context {
    let mut ctx = tarpc::context::current().with_current_trace();
    ctx.deadline = Instant::now() + timeout;
    ctx
}

/// Propagates the current OpenTelemetry span into a tarpc context.
pub trait TraceContextInjector {
    fn with_current_trace(self) -> Self;
}

impl TraceContextInjector for tarpc::context::Context {
    fn with_current_trace(mut self) -> Self {
        let cx = tracing::Span::current().context();
        let mut injector = ContextInjector::default();
        opentelemetry::global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&cx, &mut injector)
        });
        if let Some(trace_ctx) = injector.trace_context() {
            self.trace_context = trace_ctx;
        }
        self
    }
}

/// Collects trace context in W3C Trace Context format.
#[derive(Default)]
pub struct ContextInjector {
    inner: HashMap<String, String>,
}

impl ContextInjector {
    pub fn trace_context(&self) -> Option<tarpc::trace::Context> {
        self.inner
            .get("traceparent")
            .map(String::as_str)
            .and_then(parse_traceparent)
    }
}

impl Injector for ContextInjector {
    fn set(&mut self, key: &str, value: String) {
        self.inner.insert(key.to_string(), value);
    }
}

/// Parses a W3C `traceparent` value (`00-<trace id>-<span id>-<flags>`).
fn parse_traceparent(traceparent: &str) -> Option<tarpc::trace::Context> {
    let mut fields = traceparent.split('-');
    let (_version, trace_id, span_id, flags) =
        (fields.next()?, fields.next()?, fields.next()?, fields.next()?);
    if fields.next().is_some() {
        return None;
    }

    let sampling_decision = match u8::from_str_radix(flags, 16).ok()? & 0x01 {
        0 => tarpc::trace::SamplingDecision::Unsampled,
        _ => tarpc::trace::SamplingDecision::Sampled,
    };
    Some(tarpc::trace::Context {
        trace_id: u128::from_str_radix(trace_id, 16).ok()?.into(),
        span_id: u64::from_str_radix(span_id, 16).ok()?.into(),
        sampling_decision,
    })
}

/// Exposes an inbound tarpc context as a W3C traceparent so the server-side
/// span can be parented to the caller's.
pub struct ContextExtractor {
    traceparent: String,
}

impl ContextExtractor {
    pub fn new(ctx: &tarpc::context::Context) -> Self {
        let trace_id: u128 = ctx.trace_context.trace_id.into();
        let span_id: u64 = ctx.trace_context.span_id.into();
        let trace_flags = match ctx.trace_context.sampling_decision {
            tarpc::trace::SamplingDecision::Sampled => "01",
            tarpc::trace::SamplingDecision::Unsampled => "00",
        };

        let traceparent =
            format!("00-{:032x}-{:016x}-{}", trace_id, span_id, trace_flags);
        Self { traceparent }
    }

    /// Parents `span` to the remote caller's trace.
    pub fn attach(&self, span: &tracing::Span) {
        let parent = opentelemetry::global::get_text_map_propagator(
            |propagator| propagator.extract(self),
        );
        span.set_parent(parent);
    }
}

impl Extractor for ContextExtractor {
    fn get(&self, key: &str) -> Option<&str> {
        if key == "traceparent" {
            Some(&self.traceparent)
        } else {
            None
        }
    }

    fn keys(&self) -> Vec<&str> {
        vec!["traceparent"]
    }
}
