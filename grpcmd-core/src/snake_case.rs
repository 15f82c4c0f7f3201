use heck::ToSnakeCase;
use serde_json::{Map, Value};

use crate::error::{FormatError, Result};

/// Rewrite every object key in `value` to snake_case, recursing through
/// nested objects and array elements. Object keys come out sorted. Scalars
/// are returned unchanged.
pub fn to_snake_case_keys(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object
                .into_iter()
                .map(|(key, inner)| (key.to_snake_case(), to_snake_case_keys(inner)))
                .collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(entries.into_iter().collect::<Map<String, Value>>())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(to_snake_case_keys).collect()),
        scalar => scalar,
    }
}

/// Normalize one response message: JSON text is re-rendered with snake_case
/// keys, sorted, indented by two spaces. Anything else passes through.
pub fn format_message_to_snake_case(message: &str) -> Result<String> {
    match serde_json::from_str::<Value>(message) {
        Ok(value) => serde_json::to_string_pretty(&to_snake_case_keys(value))
            .map_err(|e| FormatError::Encode(e.to_string()).into()),
        Err(_) => Ok(message.to_string()),
    }
}

pub fn format_messages_to_snake_case(messages: &[String]) -> Result<Vec<String>> {
    messages
        .iter()
        .map(|m| format_message_to_snake_case(m))
        .collect()
}
