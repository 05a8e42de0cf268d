//! OTel internals: tracing layer and sampling.

use opentelemetry::trace::{Link, SamplingResult, SpanKind, TraceId, TracerProvider as _};
use opentelemetry::{Context, KeyValue, global};
use opentelemetry_otlp::SpanExporter;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracer, SdkTracerProvider, ShouldSample, SpanLimits};
use tracing_opentelemetry::OpenTelemetryLayer;

use crate::sample_rate;

/// Shuts down the tracer provider on drop, flushing pending spans.
pub struct OtelGuard {
    provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("OTel shutdown error: {e}");
        }
    }
}

/// Build an OpenTelemetry tracing layer and its guard.
///
/// Must be called inside a Tokio runtime; the batch exporter spawns onto it.
pub fn otel_layer<S>(
    service_name: &str,
) -> Result<(OpenTelemetryLayer<S, SdkTracer>, OtelGuard), Box<dyn std::error::Error + Send + Sync>>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let exporter = SpanExporter::builder().with_tonic().build()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(worker_sampler())
        .with_resource(resource)
        .with_span_limits(SpanLimits::default())
        .build();

    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer("kakehashi");
    let layer = tracing_opentelemetry::layer().with_tracer(tracer);

    Ok((layer, OtelGuard { provider }))
}

/// Root spans are sampled by [`sample_rate`]; children follow their parent.
fn worker_sampler() -> Sampler {
    Sampler::ParentBased(Box::new(CategorySampler))
}

/// Trace-id ratio sampling with the rate picked from the span name.
#[derive(Debug, Clone)]
struct CategorySampler;

impl ShouldSample for CategorySampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        Sampler::TraceIdRatioBased(sample_rate(name)).should_sample(
            parent_context,
            trace_id,
            name,
            span_kind,
            attributes,
            links,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{
        SamplingDecision, SpanContext, SpanId, TraceContextExt, TraceFlags, TraceState,
    };

    fn decide(parent: Option<&Context>, trace_id: u128, name: &str) -> SamplingDecision {
        worker_sampler()
            .should_sample(
                parent,
                TraceId::from_u128(trace_id),
                name,
                &SpanKind::Internal,
                &[],
                &[],
            )
            .decision
    }

    #[test]
    fn test_full_rate_categories_always_sampled() {
        for id in [1_u128, u128::MAX / 3, u128::MAX] {
            assert_eq!(decide(None, id, "skill.run"), SamplingDecision::RecordAndSample);
            assert_eq!(decide(None, id, "callback.call"), SamplingDecision::RecordAndSample);
        }
    }

    #[test]
    fn test_children_follow_sampled_parent() {
        let parent = SpanContext::new(
            TraceId::from_u128(u128::MAX),
            SpanId::from_u64(7),
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        );
        let cx = Context::new().with_remote_span_context(parent);
        assert_eq!(
            decide(Some(&cx), u128::MAX, "dispatch.execute"),
            SamplingDecision::RecordAndSample
        );
    }
}
