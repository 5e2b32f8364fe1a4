//! Pulling JSON out of model replies

use serde_json::Value;

/// Extract JSON from a response that might contain markdown or other text
pub fn extract_json_from_response(response: &str) -> String {
    if let Some(start) = response.find("```json") {
        let json_start = start + 7;
        if let Some(end) = response[json_start..].find("```") {
            return response[json_start..json_start + end].trim().to_string();
        }
    }

    if let Some(start) = response.find("```") {
        let potential_start = start + 3;
        // Skip a language tag
        let json_start = match response[potential_start..].find('\n') {
            Some(newline) => potential_start + newline + 1,
            None => potential_start,
        };
        if let Some(end) = response[json_start..].find("```") {
            return response[json_start..json_start + end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) {
        if start < end {
            return response[start..=end].to_string();
        }
    }

    response.trim().to_string()
}

/// Top-level `required` keys of `schema` that `value` lacks
pub fn missing_required_fields(schema: &Value, value: &Value) -> Vec<String> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Vec::new();
    };
    let Some(object) = value.as_object() else {
        return required.iter().filter_map(Value::as_str).map(str::to_string).collect();
    };
    required
        .iter()
        .filter_map(Value::as_str)
        .filter(|key| !object.contains_key(*key))
        .map(str::to_string)
        .collect()
}
