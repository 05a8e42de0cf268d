//! Conversions between Rhai values and JSON.
//!
//! Going out, every value produces *something*: anything without a natural
//! JSON shape becomes a `{"__type__", "__dict__"}` object or its display text.

use rhai::{Array, Blob, Dynamic, EvalAltResult, FnPtr, Map};
use serde_json::{Number, Value};

use crate::host::Deferred;

/// Convert a guest value to JSON for the wire.
pub fn to_json(value: &Dynamic) -> Value {
    let value = value.flatten_clone();

    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::Number(i.into());
    }
    if let Ok(f) = value.as_float() {
        return Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(f.to_string()));
    }
    if let Ok(c) = value.as_char() {
        return Value::String(c.to_string());
    }
    if value.is_string() {
        if let Ok(s) = value.clone().into_immutable_string() {
            return Value::String(s.to_string());
        }
    }
    if value.is_array() {
        let items = value.clone().cast::<Array>();
        return Value::Array(items.iter().map(to_json).collect());
    }
    if value.is_map() {
        let map = value.clone().cast::<Map>();
        return Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), to_json(v)))
                .collect(),
        );
    }
    if value.is_blob() {
        let blob = value.clone().cast::<Blob>();
        return Value::Array(blob.iter().map(|b| Value::from(*b)).collect());
    }
    if value.is::<FnPtr>() {
        let ptr = value.clone().cast::<FnPtr>();
        return structured(
            "FnPtr",
            serde_json::json!({
                "name": ptr.fn_name(),
                "curry": ptr.curry().iter().map(to_json).collect::<Vec<_>>(),
            }),
        );
    }
    if value.is::<Deferred>() {
        let deferred = value.clone().cast::<Deferred>();
        return structured(
            "Deferred",
            serde_json::json!({ "correlation_id": deferred.correlation_id() }),
        );
    }

    Value::String(value.to_string())
}

/// Convert JSON into a guest value (objects become object maps).
pub fn from_json(value: &Value) -> Result<Dynamic, Box<EvalAltResult>> {
    rhai::serde::to_dynamic(value)
}

fn structured(type_name: &str, dict: Value) -> Value {
    serde_json::json!({ "__type__": type_name, "__dict__": dict })
}
