use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;

/// Types that can be extracted via a forced tool call.
///
/// Blanket-implemented for anything deriving `JsonSchema` + `Deserialize`.
pub trait StructuredOutput: JsonSchema + DeserializeOwned {
    /// JSON schema suitable as a tool `input_schema`:
    /// every object gets `additionalProperties: false` with all properties
    /// required (the model must emit explicit nulls instead of omitting
    /// fields), and `$ref`s are inlined so the schema is self-contained.
    fn tool_schema() -> serde_json::Value {
        let schema = schema_for!(Self);
        let mut value = serde_json::to_value(schema).unwrap_or_default();

        strengthen_objects(&mut value);

        if let Some(definitions) = value.get("definitions").cloned() {
            inline_definitions(&mut value, &definitions);
        }

        if let serde_json::Value::Object(map) = &mut value {
            map.remove("definitions");
            map.remove("$schema");
        }

        value
    }
}

impl<T: JsonSchema + DeserializeOwned> StructuredOutput for T {}

/// Walk the schema; every `"type": "object"` node gets
/// `additionalProperties: false` and a `required` list covering all
/// properties, optional ones included.
fn strengthen_objects(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            if map.get("type") == Some(&serde_json::Value::String("object".to_string())) {
                map.insert(
                    "additionalProperties".to_string(),
                    serde_json::Value::Bool(false),
                );
                if let Some(serde_json::Value::Object(props)) = map.get("properties") {
                    let all_keys: Vec<serde_json::Value> = props
                        .keys()
                        .map(|k| serde_json::Value::String(k.clone()))
                        .collect();
                    map.insert("required".to_string(), serde_json::Value::Array(all_keys));
                }
            }
            for (_, v) in map.iter_mut() {
                strengthen_objects(v);
            }
        }
        serde_json::Value::Array(arr) => {
            for item in arr.iter_mut() {
                strengthen_objects(item);
            }
        }
        _ => {}
    }
}

/// Replace `$ref` nodes with their definition bodies and collapse the
/// single-element `allOf` wrappers schemars emits for nested structs.
fn inline_definitions(value: &mut serde_json::Value, definitions: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(ref_path)) = map.get("$ref").cloned() {
                if let Some(name) = ref_path.strip_prefix("#/definitions/") {
                    if let Some(def) = definitions.get(name) {
                        *value = def.clone();
                        inline_definitions(value, definitions);
                        return;
                    }
                }
            }

            if let Some(serde_json::Value::Array(all_of)) = map.get("allOf").cloned() {
                if all_of.len() == 1 {
                    *value = all_of.into_iter().next().unwrap();
                    inline_definitions(value, definitions);
                    return;
                }
            }

            for (_, v) in map.iter_mut() {
                inline_definitions(v, definitions);
            }
        }
        serde_json::Value::Array(arr) => {
            for item in arr.iter_mut() {
                inline_definitions(item, definitions);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;
    use serde::Deserialize;

    #[derive(Deserialize, JsonSchema)]
    struct ListedEvent {
        title: String,
        date: Option<String>,
    }

    #[derive(Deserialize, JsonSchema)]
    struct PageScan {
        has_events: bool,
        events: Vec<ListedEvent>,
    }

    #[test]
    fn schema_is_self_contained() {
        let schema = PageScan::tool_schema();
        let obj = schema.as_object().unwrap();
        assert!(!obj.contains_key("definitions"));
        assert!(!obj.contains_key("$schema"));
        assert!(!serde_json::to_string(&schema).unwrap().contains("$ref"));
    }

    #[test]
    fn optional_fields_still_required() {
        let schema = ListedEvent::tool_schema();
        let required = schema["required"].as_array().unwrap();
        let names: Vec<&str> = required.iter().filter_map(|v| v.as_str()).collect();
        assert!(names.contains(&"title"));
        assert!(names.contains(&"date"));
    }

    #[test]
    fn nested_objects_forbid_extras() {
        let schema = PageScan::tool_schema();
        let items = &schema["properties"]["events"]["items"];
        assert_eq!(items["type"], "object");
        assert_eq!(items["additionalProperties"], false);
    }
}
