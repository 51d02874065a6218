//! Prompt layout for structured generation.

use std::fmt::Write;

use handlebars::Handlebars;
use serde::Serialize;
use serde_json::Value;

use tessera_core::lm::{GenerationRequest, LmError};
use tessera_core::schema::Schema;

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a precise assistant. You answer with structured JSON only.";

/// Default user prompt.
///
/// Available variables: `instructions` (list of strings), `examples` (list of
/// `{inputs, outputs}` JSON strings), `input` (JSON string) and
/// `output_schema` (JSON Schema string).
pub const DEFAULT_PROMPT_TEMPLATE: &str = r#"{{#if instructions}}
Instructions:
{{#each instructions}}
- {{this}}
{{/each}}

{{/if}}
{{#if examples}}
Examples:
{{#each examples}}
Input: {{inputs}}
Output: {{outputs}}
{{/each}}

{{/if}}
Input:
{{input}}

Return a JSON object matching this JSON Schema:
{{output_schema}}
"#;

/// System and user messages for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}

#[derive(Serialize)]
struct PromptExample {
    inputs: String,
    outputs: String,
}

#[derive(Serialize)]
struct PromptData<'a> {
    instructions: &'a [String],
    examples: Vec<PromptExample>,
    input: String,
    output_schema: String,
}

/// Renders requests into chat messages.
pub struct PromptRenderer {
    engine: Handlebars<'static>,
}

impl PromptRenderer {
    pub fn new() -> Self {
        let mut engine = Handlebars::new();
        engine.register_escape_fn(handlebars::no_escape);
        Self { engine }
    }

    pub fn render(&self, request: &GenerationRequest) -> Result<RenderedPrompt, LmError> {
        let data = PromptData {
            instructions: &request.instructions,
            examples: request
                .examples
                .iter()
                .map(|example| PromptExample {
                    inputs: Value::Object(example.inputs.clone()).to_string(),
                    outputs: Value::Object(example.outputs.clone()).to_string(),
                })
                .collect(),
            input: Value::Object(request.input.data().clone()).to_string(),
            output_schema: to_pretty(&request.output_schema.to_json_schema())?,
        };
        let template = request
            .prompt_template
            .as_deref()
            .unwrap_or(DEFAULT_PROMPT_TEMPLATE);
        let user = self
            .engine
            .render_template(template, &data)
            .map_err(|e| LmError::Template(e.to_string()))?;

        Ok(RenderedPrompt {
            system: build_system_prompt(request.system_prompt.as_deref(), &request.output_schema),
            user,
        })
    }
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::new()
    }
}

fn to_pretty(value: &Value) -> Result<String, LmError> {
    serde_json::to_string_pretty(value).map_err(|e| LmError::Serialization(e.to_string()))
}

fn build_system_prompt(base: Option<&str>, output_schema: &Schema) -> String {
    let mut system = String::new();
    system.push_str(base.unwrap_or(DEFAULT_SYSTEM_PROMPT).trim());
    system.push_str("\n\nOutput Rules:\n");
    system.push_str("1) Return ONLY one valid JSON object matching the output schema.\n");
    system.push_str("2) Include every required field.\n");
    system.push_str("3) Do not add fields that are not listed below.\n");
    append_schema_fields(&mut system, output_schema);
    system
}

fn append_schema_fields(buf: &mut String, schema: &Schema) {
    if schema.is_empty() {
        let _ = writeln!(buf, "\nOutput fields: []");
        return;
    }
    let _ = writeln!(buf, "\nOutput fields:");
    for field in schema.fields() {
        let required_label = if field.required {
            "required"
        } else {
            "optional"
        };
        let mut extras = Vec::new();
        if let Some(desc) = &field.description {
            extras.push(format!("desc={}", desc));
        }
        if let Some(default) = &field.default {
            extras.push(format!("default={}", default));
        }
        if extras.is_empty() {
            let _ = writeln!(
                buf,
                "  - {} ({}, {})",
                field.name,
                field.ty.describe(),
                required_label
            );
        } else {
            let _ = writeln!(
                buf,
                "  - {} ({}, {}): {}",
                field.name,
                field.ty.describe(),
                required_label,
                extras.join("; ")
            );
        }
    }
}
