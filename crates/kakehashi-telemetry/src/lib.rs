//! OpenTelemetry integration for kakehashi.
//!
//! Provides the OTel tracing layer for the worker binary and a sampler with
//! per-category rates. Built only with the `telemetry` feature; without it
//! [`otel_enabled`] still answers from the environment so the binary can warn.
//!
//! # Activation
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 kakehashi-worker
//! ```
//!
//! Set `OTEL_SDK_DISABLED=true` to disable even when the endpoint is set.

#[cfg(feature = "telemetry")]
mod otel;

#[cfg(feature = "telemetry")]
pub use otel::{OtelGuard, otel_layer};

/// Check whether OTel export should be enabled.
///
/// True when `OTEL_SDK_DISABLED` is not `"true"` and either
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set or `OTEL_TRACES_EXPORTER` is set to
/// something other than `"none"`.
pub fn otel_enabled() -> bool {
    enabled_from(|key| std::env::var(key).ok())
}

fn enabled_from(var: impl Fn(&str) -> Option<String>) -> bool {
    if var("OTEL_SDK_DISABLED").is_some_and(|v| v.eq_ignore_ascii_case("true")) {
        return false;
    }
    if var("OTEL_EXPORTER_OTLP_ENDPOINT").is_some() {
        return true;
    }
    if let Some(exporter) = var("OTEL_TRACES_EXPORTER") {
        return !exporter.eq_ignore_ascii_case("none");
    }
    false
}

/// Sampling rate for a span, by name prefix.
///
/// | Prefix        | Rate |
/// |---------------|------|
/// | `engine.*`    | 100% |
/// | `skill.*`     | 100% |
/// | `callback.*`  | 100% |
/// | `dispatch.*`  | 10%  |
/// | other         | 10%  |
pub fn sample_rate(span_name: &str) -> f64 {
    if ["engine.", "skill.", "callback."]
        .iter()
        .any(|prefix| span_name.starts_with(prefix))
    {
        1.0
    } else {
        0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_enabled_rules() {
        assert!(!enabled_from(env(&[])));
        assert!(enabled_from(env(&[("OTEL_EXPORTER_OTLP_ENDPOINT", "http://x:4317")])));
        assert!(!enabled_from(env(&[
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://x:4317"),
            ("OTEL_SDK_DISABLED", "TRUE"),
        ])));
        assert!(enabled_from(env(&[("OTEL_TRACES_EXPORTER", "otlp")])));
        assert!(!enabled_from(env(&[("OTEL_TRACES_EXPORTER", "none")])));
    }

    #[test]
    fn test_sample_rates() {
        assert_eq!(sample_rate("skill.run"), 1.0);
        assert_eq!(sample_rate("callback.call"), 1.0);
        assert_eq!(sample_rate("engine.execute"), 1.0);
        assert_eq!(sample_rate("dispatch.message"), 0.1);
        assert_eq!(sample_rate("skillful"), 0.1);
    }
}
