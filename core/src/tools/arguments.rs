//! Argument adaptation applied before a tool runs.
//!
//! Models frequently send arguments in slightly wrong shapes. The rules, in order:
//!
//! 1. A JSON string that parses to an object is unwrapped.
//! 2. Any other non-object value becomes `{}`.
//! 3. For "action + blob" tools (schema declares `action` and a `params` blob),
//!    an `action` call whose other fields are not declared properties gets those
//!    fields packed into the blob: a JSON string if the blob is typed `string`,
//!    otherwise an object.
//! 4. String scalars are coerced to a declared `integer`, `number` or `boolean`
//!    type when they parse cleanly.

use serde_json::{Map, Number, Value};
use tracing::debug;

const ACTION_FIELD: &str = "action";
const BLOB_FIELDS: &[&str] = &["params", "parameters"];

/// Adapt `args` to the tool's input schema
pub fn adapt_arguments(schema: &Value, args: Value) -> Value {
    let mut obj = match args {
        Value::Object(map) => map,
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        _ => Map::new(),
    };

    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    repack_scattered_fields(&properties, &mut obj);
    coerce_scalars(&properties, &mut obj);

    Value::Object(obj)
}

fn repack_scattered_fields(properties: &Map<String, Value>, obj: &mut Map<String, Value>) {
    if !properties.contains_key(ACTION_FIELD) || !obj.contains_key(ACTION_FIELD) {
        return;
    }
    let Some(blob) = BLOB_FIELDS.iter().find(|f| properties.contains_key(**f)) else {
        return;
    };
    if obj.contains_key(*blob) {
        return;
    }

    let scattered: Vec<String> = obj
        .keys()
        .filter(|k| !properties.contains_key(k.as_str()))
        .cloned()
        .collect();
    if scattered.is_empty() {
        return;
    }

    let mut packed = Map::new();
    for key in scattered {
        if let Some(v) = obj.remove(&key) {
            packed.insert(key, v);
        }
    }

    let blob_is_string = properties
        .get(*blob)
        .and_then(|p| p.get("type"))
        .and_then(Value::as_str)
        == Some("string");
    let value = if blob_is_string {
        Value::String(Value::Object(packed).to_string())
    } else {
        Value::Object(packed)
    };
    debug!(target: "tool_registry", blob = %blob, "Packed scattered arguments");
    obj.insert((*blob).to_string(), value);
}

fn coerce_scalars(properties: &Map<String, Value>, obj: &mut Map<String, Value>) {
    for (key, value) in obj.iter_mut() {
        let Value::String(s) = value else { continue };
        let declared = properties
            .get(key)
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str);
        let trimmed = s.trim();
        let coerced = match declared {
            Some("integer") => trimmed.parse::<i64>().ok().map(Value::from),
            Some("number") => trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number),
            Some("boolean") => match trimmed.to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        };
        if let Some(v) = coerced {
            *value = v;
        }
    }
}
