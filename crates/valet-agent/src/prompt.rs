//! System prompt compilation: persona/filesystem placeholder substitution,
//! the tool usage instructions the stream parser depends on, and the tool
//! catalog rendered with model-safe schemas.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use valet_tools::ToolDefinition;

use crate::parser::{TOOL_END, TOOL_START};

/// Marker separating the compiled prompt from the conversation itself.
const CONVERSATION_MARKER: &str = "--- Conversation ---";

/// Substitute `{persona_definition}` in the base template. A template
/// without the placeholder is used as-is (with a warning) rather than
/// rejected — personas are a refinement, not a requirement.
pub fn resolve_persona(template: &str, persona: &str) -> String {
    if !template.contains("{persona_definition}") {
        warn!("base template has no {{persona_definition}} placeholder, using raw template");
        return template.to_string();
    }
    template.replace("{persona_definition}", persona)
}

/// Substitute `{filesystem_access_info}` with a host-wide description of
/// filesystem reach, derived from the environment at startup.
pub fn resolve_filesystem_info(template: &str, fs_root: Option<&str>) -> String {
    let info = format!(
        "You have access to the local filesystem within the directory: '{}'",
        fs_root.unwrap_or("<Not Specified>")
    );
    if !template.contains("{filesystem_access_info}") {
        warn!("base template has no {{filesystem_access_info}} placeholder, using raw template");
        return template.to_string();
    }
    template.replace("{filesystem_access_info}", &info)
}

/// Compile the final system prompt: base content, tool usage instructions
/// (naming the exact stream delimiters), the sanitized catalog, and the
/// conversation marker.
pub fn compile(base_prompt: &str, tools: &BTreeMap<String, ToolDefinition>) -> String {
    let mut lines: Vec<String> = vec![base_prompt.to_string()];
    lines.push("\n--- Tool Usage Instructions ---".to_string());

    if tools.is_empty() {
        lines.push("No tools are available for you to use.".to_string());
    } else {
        lines.push(format!(
            "When you decide to use a tool to answer a user's request:\n\
             1. First, briefly tell the user what action you are taking (e.g., 'Okay, searching memory for related notes...').\n\
             2. Then, on a **new line**, provide the required tool call JSON object, enclosed *exactly* like this, with **no other text on the same line or within the delimiters**:\n\
             {TOOL_START}{{ \"tool\": \"server_id:tool_name\", \"arguments\": {{ /* ...args... */ }} }}{TOOL_END}\n\
             After you receive the result from the tool, summarize it for the user.\n\n\
             --- Available Tools ---\n\
             Here are the tools available to you (described in a format similar to function declarations):"
        ));

        for (qualified_name, tool) in tools {
            lines.push(format!("\nTool Name: {qualified_name}"));
            let description = if tool.description.is_empty() {
                "No description available."
            } else {
                &tool.description
            };
            lines.push(format!("  Description: {description}"));

            let cleaned = sanitize_schema(&tool.parameters);
            if schema_is_empty(&cleaned) {
                lines.push("  Parameters Schema: None".to_string());
            } else {
                lines.push(format!(
                    "  Parameters Schema (JSON):\n{}",
                    pretty_schema(&cleaned)
                ));
            }
        }
    }

    lines.push(format!("\n{CONVERSATION_MARKER}"));
    lines.join("\n")
}

/// Strip `additionalProperties` and `$schema` at the top level and inside
/// every property. The target provider rejects schemas carrying them.
/// Applying this twice is the same as applying it once.
pub fn sanitize_schema(schema: &Value) -> Value {
    let Value::Object(map) = schema else {
        return Value::Object(Default::default());
    };

    let mut cleaned = map.clone();
    cleaned.remove("additionalProperties");
    cleaned.remove("$schema");

    if let Some(Value::Object(properties)) = cleaned.get_mut("properties") {
        for prop in properties.values_mut() {
            if let Value::Object(prop_map) = prop {
                prop_map.remove("additionalProperties");
                prop_map.remove("$schema");
            }
        }
    }

    Value::Object(cleaned)
}

fn schema_is_empty(schema: &Value) -> bool {
    schema.as_object().is_none_or(|m| m.is_empty())
}

/// Pretty-print with 4-space indentation, matching the declaration style the
/// model is instructed against.
fn pretty_schema(schema: &Value) -> String {
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    if serde::Serialize::serialize(schema, &mut serializer).is_err() {
        return schema.to_string();
    }
    String::from_utf8(out).unwrap_or_else(|_| schema.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, schema: Value) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: format!("{name} things"),
            parameters: schema,
        }
    }

    #[test]
    fn persona_placeholder_is_substituted() {
        let out = resolve_persona("Hello {persona_definition}!", "you serve Tony");
        assert_eq!(out, "Hello you serve Tony!");
    }

    #[test]
    fn missing_placeholder_falls_back_to_raw_template() {
        let out = resolve_persona("no placeholder here", "ignored");
        assert_eq!(out, "no placeholder here");
    }

    #[test]
    fn empty_catalog_uses_literal_no_tools_line() {
        let compiled = compile("base", &BTreeMap::new());
        assert!(compiled.contains("No tools are available for you to use."));
        assert!(compiled.ends_with("--- Conversation ---"));
    }

    #[test]
    fn instructions_name_the_exact_delimiters() {
        let mut tools = BTreeMap::new();
        tools.insert(
            "mem:search".to_string(),
            tool("search", serde_json::json!({"type": "object"})),
        );
        let compiled = compile("base", &tools);
        assert!(compiled.contains(TOOL_START));
        assert!(compiled.contains(TOOL_END));
        assert!(compiled.contains("Tool Name: mem:search"));
    }

    #[test]
    fn schemas_are_sanitized_and_indented() {
        let mut tools = BTreeMap::new();
        tools.insert(
            "fs:read".to_string(),
            tool(
                "read",
                serde_json::json!({
                    "type": "object",
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "additionalProperties": false,
                    "properties": {
                        "path": {"type": "string", "additionalProperties": false}
                    },
                    "required": ["path"]
                }),
            ),
        );
        let compiled = compile("base", &tools);
        assert!(!compiled.contains("$schema"));
        assert!(!compiled.contains("additionalProperties"));
        // 4-space indent from the pretty printer
        assert!(compiled.contains("    \"type\": \"object\""));
    }

    #[test]
    fn sanitation_is_idempotent() {
        let schema = serde_json::json!({
            "type": "object",
            "$schema": "x",
            "additionalProperties": false,
            "properties": {
                "q": {"type": "string", "$schema": "y"}
            }
        });
        let once = sanitize_schema(&schema);
        let twice = sanitize_schema(&once);
        assert_eq!(once, twice);
        assert!(once.get("$schema").is_none());
        assert!(once["properties"]["q"].get("$schema").is_none());
    }

    #[test]
    fn non_object_schema_becomes_empty() {
        assert!(schema_is_empty(&sanitize_schema(&Value::String("x".into()))));
    }
}
