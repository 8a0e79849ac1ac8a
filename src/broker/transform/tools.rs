//! Tool-definition normalization: one `functionDeclarations` list for the
//! Claude path, `input_schema` guarantees for the Gemini path, plus the
//! anti-hallucination hardening lines.

use serde_json::{json, Map, Value};

/// Marker prefix so the hardening paragraph is never injected twice.
pub(crate) const HARDENING_MARKER: &str = "Tool discipline:";

const HARDENING_PARAGRAPH: &str = "Tool discipline: only call tools that are listed, and only \
with the parameters their schemas declare. Never invent parameter names, never guess values \
for parameters you were not given, and never wrap arguments in extra objects. If a required \
parameter is unknown, ask for it instead of fabricating one.";

/// Schema keywords the upstream's declaration validator rejects.
const STRIPPED_KEYS: [&str; 10] = [
    "$schema",
    "additionalProperties",
    "minLength",
    "maxLength",
    "pattern",
    "default",
    "examples",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "$ref",
];

/// Clamp a tool name into `[A-Za-z0-9_-]{1,64}`.
pub fn sanitize_tool_name(name: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        cleaned = "tool".to_string();
    }
    cleaned.truncate(64);
    cleaned
}

/// Strip schema features the upstream rejects, recursively. `format` is only
/// kept on string types where the upstream understands it.
pub fn clean_json_schema(schema: &mut Value) {
    match schema {
        Value::Object(obj) => {
            for key in STRIPPED_KEYS {
                obj.remove(key);
            }
            let keep_format = obj
                .get("format")
                .and_then(|v| v.as_str())
                .map(|f| f == "date-time" || f == "enum")
                .unwrap_or(false);
            if !keep_format {
                obj.remove("format");
            }
            // minimum/maximum only mean something on numeric types.
            let numeric = obj
                .get("type")
                .and_then(|v| v.as_str())
                .map(|t| t == "number" || t == "integer")
                .unwrap_or(false);
            if !numeric {
                obj.remove("minimum");
                obj.remove("maximum");
            }
            // anyOf/oneOf are not understood; collapse to the first variant.
            for union_key in ["anyOf", "oneOf"] {
                if let Some(Value::Array(variants)) = obj.get(union_key).cloned() {
                    obj.remove(union_key);
                    if let Some(first) = variants.into_iter().next() {
                        if let Value::Object(first) = first {
                            for (k, v) in first {
                                obj.entry(k).or_insert(v);
                            }
                        }
                    }
                }
            }
            for value in obj.values_mut() {
                clean_json_schema(value);
            }
        }
        Value::Array(items) => {
            for item in items {
                clean_json_schema(item);
            }
        }
        _ => {}
    }
}

/// The upstream rejects declarations with an empty `properties` map; give
/// them a single synthetic parameter instead.
fn placeholder_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "reason": {
                "type": "string",
                "description": "Why this tool is being invoked"
            }
        },
        "required": ["reason"]
    })
}

fn schema_has_properties(schema: &Value) -> bool {
    schema
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|p| !p.is_empty())
        .unwrap_or(false)
}

/// Pull a `(name, description, schema)` triple out of whichever tool shape
/// the host sent: Anthropic (`{name, input_schema}`), OpenAI
/// (`{type:"function", function:{...}}`) or already-Gemini
/// (`{functionDeclarations:[...]}` handled by the caller).
fn extract_declaration(tool: &Value) -> Option<(String, String, Option<Value>)> {
    let source = if let Some(function) = tool.get("function") {
        function
    } else {
        tool
    };
    let name = source.get("name").and_then(|v| v.as_str())?;
    let description = source
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let schema = source
        .get("input_schema")
        .or_else(|| source.get("inputSchema"))
        .or_else(|| source.get("parameters"))
        .cloned();
    Some((name.to_string(), description, schema))
}

/// Claude path: collapse every tool definition into a single
/// `tools: [{functionDeclarations: [...]}]` entry with sanitized names and
/// cleaned schemas. Returns the number of tools whose schema could not be
/// recovered (surfaced to the host as a debug header).
pub fn normalize_claude_tools(request: &mut Value) -> u32 {
    let Some(tools) = request.get("tools").cloned() else {
        return 0;
    };
    let Some(tools) = tools.as_array() else {
        return 0;
    };

    let mut missing = 0u32;
    let mut declarations = Vec::new();
    for tool in tools {
        // Pre-wrapped Gemini groups contribute their declarations directly.
        if let Some(existing) = tool.get("functionDeclarations").and_then(|v| v.as_array()) {
            for declaration in existing {
                declarations.push(clean_declaration(declaration.clone(), &mut missing));
            }
            continue;
        }
        match extract_declaration(tool) {
            Some((name, description, schema)) => {
                let declaration = json!({
                    "name": name,
                    "description": description,
                    "parameters": schema.unwrap_or_else(|| json!({"type": "object"})),
                });
                declarations.push(clean_declaration(declaration, &mut missing));
            }
            None => {
                missing += 1;
                tracing::warn!("[Tools] dropping tool with no recoverable declaration");
            }
        }
    }

    if declarations.is_empty() {
        request.as_object_mut().map(|obj| obj.remove("tools"));
    } else {
        request["tools"] = json!([{ "functionDeclarations": declarations }]);
    }
    missing
}

fn clean_declaration(mut declaration: Value, missing: &mut u32) -> Value {
    if !declaration.is_object() {
        *missing += 1;
        return declaration;
    }
    if let Some(name) = declaration.get("name").and_then(|v| v.as_str()) {
        let sanitized = sanitize_tool_name(name);
        declaration["name"] = json!(sanitized);
    } else {
        *missing += 1;
    }
    if let Some(parameters) = declaration.get_mut("parameters") {
        clean_json_schema(parameters);
        if !schema_has_properties(parameters) {
            *parameters = placeholder_schema();
        }
    } else {
        declaration["parameters"] = placeholder_schema();
    }
    declaration
}

/// Gemini path: keep `function`-shaped entries, unwrap nothing else, drop
/// `custom` wrappers, and guarantee an `input_schema` on every survivor.
pub fn normalize_gemini_tools(request: &mut Value) -> u32 {
    let Some(tools) = request.get("tools").cloned() else {
        return 0;
    };
    let Some(tools) = tools.as_array() else {
        return 0;
    };

    let mut missing = 0u32;
    let mut kept = Vec::new();
    for tool in tools {
        if tool.get("custom").is_some() {
            tracing::debug!("[Tools] dropping custom tool wrapper");
            continue;
        }
        if tool.get("functionDeclarations").is_some() {
            kept.push(tool.clone());
            continue;
        }
        let mut entry = if let Some(function) = tool.get("function") {
            function.clone()
        } else {
            tool.clone()
        };
        if entry.get("name").and_then(|v| v.as_str()).is_none() {
            missing += 1;
            continue;
        }
        if entry.get("input_schema").is_none() {
            let fallback = entry
                .get("parameters")
                .or_else(|| entry.get("inputSchema"))
                .cloned()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
            if entry.get("parameters").is_none() && entry.get("inputSchema").is_none() {
                missing += 1;
            }
            entry["input_schema"] = fallback;
        }
        kept.push(entry);
    }

    if kept.is_empty() {
        request.as_object_mut().map(|obj| obj.remove("tools"));
    } else {
        request["tools"] = json!(kept);
    }
    missing
}

/// Top-level parameter names, for the STRICT PARAMETERS line.
fn top_level_params(declaration: &Value) -> Vec<String> {
    declaration
        .get("parameters")
        .and_then(|p| p.get("properties"))
        .and_then(|p| p.as_object())
        .map(|props| props.keys().cloned().collect())
        .unwrap_or_default()
}

/// Claude-only hardening: a fixed system paragraph forbidding parameter
/// hallucination plus a STRICT PARAMETERS suffix on every description.
/// Marker-checked so re-preparing a wrapped body never doubles them.
pub fn harden_claude_tools(request: &mut Value) {
    let Some(groups) = request.get_mut("tools").and_then(|v| v.as_array_mut()) else {
        return;
    };
    for group in groups.iter_mut() {
        let Some(declarations) = group
            .get_mut("functionDeclarations")
            .and_then(|v| v.as_array_mut())
        else {
            continue;
        };
        for declaration in declarations.iter_mut() {
            let params = top_level_params(declaration);
            let description = declaration
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if description.contains("STRICT PARAMETERS:") {
                continue;
            }
            let line = if params.is_empty() {
                "STRICT PARAMETERS: none".to_string()
            } else {
                format!("STRICT PARAMETERS: {}", params.join(", "))
            };
            let appended = if description.is_empty() {
                line
            } else {
                format!("{}\n{}", description, line)
            };
            declaration["description"] = json!(appended);
        }
    }

    append_system_text(request, HARDENING_PARAGRAPH, HARDENING_MARKER);
}

/// Append a paragraph to the system instruction unless `marker` is already
/// present anywhere in it.
pub(crate) fn append_system_text(request: &mut Value, text: &str, marker: &str) {
    let key = if request.get("system_instruction").is_some() {
        "system_instruction"
    } else {
        "systemInstruction"
    };

    let existing = request.get(key).cloned();
    match existing {
        None => {
            request[key] = json!({"role": "user", "parts": [{"text": text}]});
        }
        Some(Value::String(current)) => {
            if current.contains(marker) {
                return;
            }
            request[key] = json!(format!("{}\n\n{}", current, text));
        }
        Some(Value::Object(mut obj)) => {
            let already = obj
                .get("parts")
                .and_then(|p| p.as_array())
                .map(|parts| {
                    parts.iter().any(|part| {
                        part.get("text")
                            .and_then(|t| t.as_str())
                            .is_some_and(|t| t.contains(marker))
                    })
                })
                .unwrap_or(false);
            if already {
                return;
            }
            let parts = obj
                .entry("parts".to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Some(parts) = parts.as_array_mut() {
                parts.push(json!({"text": text}));
            }
            request[key] = Value::Object(obj);
        }
        Some(other) => {
            // Unrecognized shape; replace rather than guess.
            let mut obj = Map::new();
            obj.insert("parts".to_string(), json!([other, {"text": text}]));
            request[key] = Value::Object(obj);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_names_to_the_allowed_alphabet() {
        assert_eq!(sanitize_tool_name("read_file"), "read_file");
        assert_eq!(sanitize_tool_name("mcp.server/tool"), "mcp_server_tool");
        assert_eq!(sanitize_tool_name(""), "tool");
        let long = "x".repeat(100);
        assert_eq!(sanitize_tool_name(&long).len(), 64);
    }

    #[test]
    fn claude_tools_collapse_into_one_declaration_group() {
        let mut request = json!({
            "tools": [
                {"name": "read_file", "description": "Read", "input_schema": {
                    "type": "object",
                    "properties": {"path": {"type": "string", "minLength": 1}},
                    "additionalProperties": false
                }},
                {"type": "function", "function": {"name": "run", "parameters": {
                    "type": "object", "properties": {"cmd": {"type": "string"}}
                }}}
            ]
        });
        let missing = normalize_claude_tools(&mut request);
        assert_eq!(missing, 0);

        let groups = request["tools"].as_array().unwrap();
        assert_eq!(groups.len(), 1);
        let declarations = groups[0]["functionDeclarations"].as_array().unwrap();
        assert_eq!(declarations.len(), 2);
        assert_eq!(declarations[0]["name"], "read_file");
        // Rejected keywords are stripped.
        assert!(declarations[0]["parameters"]["properties"]["path"]
            .get("minLength")
            .is_none());
        assert!(declarations[0]["parameters"].get("additionalProperties").is_none());
        assert_eq!(declarations[1]["name"], "run");
    }

    #[test]
    fn empty_schema_gets_the_reason_placeholder() {
        let mut request = json!({
            "tools": [{"name": "ping", "input_schema": {"type": "object", "properties": {}}}]
        });
        normalize_claude_tools(&mut request);
        let declaration = &request["tools"][0]["functionDeclarations"][0];
        assert_eq!(declaration["parameters"]["required"], json!(["reason"]));
        assert!(declaration["parameters"]["properties"]["reason"].is_object());
    }

    #[test]
    fn unrecoverable_tools_are_counted() {
        let mut request = json!({"tools": [{"description": "nameless"}]});
        let missing = normalize_claude_tools(&mut request);
        assert_eq!(missing, 1);
        assert!(request.get("tools").is_none());
    }

    #[test]
    fn gemini_tools_drop_custom_and_gain_input_schema() {
        let mut request = json!({
            "tools": [
                {"custom": {"name": "weird"}},
                {"type": "function", "function": {"name": "search"}},
                {"name": "fetch", "input_schema": {"type": "object"}}
            ]
        });
        let missing = normalize_gemini_tools(&mut request);
        let tools = request["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "search");
        assert_eq!(tools[0]["input_schema"], json!({"type": "object", "properties": {}}));
        assert_eq!(tools[1]["name"], "fetch");
        // `search` had no schema at all.
        assert_eq!(missing, 1);
    }

    #[test]
    fn hardening_appends_strict_parameters_once() {
        let mut request = json!({
            "tools": [{"functionDeclarations": [{
                "name": "write_file",
                "description": "Write a file",
                "parameters": {"type": "object", "properties": {"path": {}, "content": {}}}
            }]}]
        });
        harden_claude_tools(&mut request);
        let description = request["tools"][0]["functionDeclarations"][0]["description"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(description.contains("STRICT PARAMETERS:"));
        assert!(description.contains("path"));
        assert!(description.contains("content"));

        // Idempotent on a second pass.
        harden_claude_tools(&mut request);
        let again = request["tools"][0]["functionDeclarations"][0]["description"]
            .as_str()
            .unwrap();
        assert_eq!(again.matches("STRICT PARAMETERS:").count(), 1);
        let system = request["systemInstruction"].clone();
        let parts = system["parts"].as_array().unwrap();
        assert_eq!(
            parts
                .iter()
                .filter(|p| p["text"].as_str().unwrap_or("").contains(HARDENING_MARKER))
                .count(),
            1
        );
    }

    #[test]
    fn min_max_survive_only_on_numeric_types() {
        let mut schema = json!({
            "type": "object",
            "properties": {
                "count": {"type": "integer", "minimum": 1, "maximum": 10},
                "ratio": {"type": "number", "minimum": 0.0},
                "name": {"type": "string", "minimum": 1, "maximum": 64},
                "flags": {"type": "array", "maximum": 5}
            }
        });
        clean_json_schema(&mut schema);
        let props = &schema["properties"];
        assert_eq!(props["count"]["minimum"], json!(1));
        assert_eq!(props["count"]["maximum"], json!(10));
        assert_eq!(props["ratio"]["minimum"], json!(0.0));
        assert!(props["name"].get("minimum").is_none());
        assert!(props["name"].get("maximum").is_none());
        assert!(props["flags"].get("maximum").is_none());
    }

    #[test]
    fn anyof_collapses_to_first_variant() {
        let mut schema = json!({
            "type": "object",
            "properties": {
                "value": {"anyOf": [{"type": "string"}, {"type": "number"}]}
            }
        });
        clean_json_schema(&mut schema);
        assert_eq!(schema["properties"]["value"]["type"], "string");
        assert!(schema["properties"]["value"].get("anyOf").is_none());
    }
}
