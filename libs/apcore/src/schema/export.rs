//! Multi-target schema export (spec §4.5.5): MCP, OpenAI-strict, Anthropic,
//! generic.

use serde_json::{Map, Value, json};

use crate::module::{Annotations, ModuleExample};

use super::strict::{apply_llm_descriptions, strip_extensions, to_strict};

/// Which wire profile [`export_module`] should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportProfile {
    Mcp,
    OpenAi,
    Anthropic,
    Generic,
}

/// Everything [`export_module`] needs about one module. Deliberately
/// schema-shaped rather than `&dyn Module`-shaped: exporting needs the raw
/// JSON Schema documents, not the converted [`super::RuntimeSchema`] the
/// executor validates against.
pub struct ExportInput<'a> {
    pub module_id: &'a str,
    pub description: &'a str,
    pub input_schema: &'a Value,
    pub output_schema: &'a Value,
    pub definitions: &'a Value,
    pub annotations: Annotations,
    pub examples: &'a [ModuleExample],
}

/// Renders `input` under `profile`, per spec §4.5.5.
#[must_use]
pub fn export_module(profile: ExportProfile, input: &ExportInput<'_>) -> Value {
    match profile {
        ExportProfile::Mcp => export_mcp(input),
        ExportProfile::OpenAi => export_openai(input),
        ExportProfile::Anthropic => export_anthropic(input),
        ExportProfile::Generic => export_generic(input),
    }
}

fn export_mcp(input: &ExportInput<'_>) -> Value {
    let a = input.annotations;
    json!({
        "name": input.module_id,
        "description": input.description,
        "inputSchema": input.input_schema,
        "annotations": {
            "readOnlyHint": a.readonly,
            "destructiveHint": a.destructive,
            "idempotentHint": a.idempotent,
            "openWorldHint": a.open_world,
        }
    })
}

fn export_openai(input: &ExportInput<'_>) -> Value {
    let parameters = to_strict(input.input_schema);
    json!({
        "type": "function",
        "function": {
            "name": input.module_id.replace('.', "_"),
            "description": input.description,
            "parameters": parameters,
            "strict": true,
        }
    })
}

fn export_anthropic(input: &ExportInput<'_>) -> Value {
    let input_schema = strip_extensions(&apply_llm_descriptions(input.input_schema));
    let description = apply_llm_descriptions(&json!({"description": input.description}))
        .get("description")
        .cloned()
        .unwrap_or_else(|| Value::String(input.description.to_owned()));

    let mut out = Map::new();
    out.insert("name".to_owned(), Value::String(input.module_id.to_owned()));
    out.insert("description".to_owned(), description);
    out.insert("input_schema".to_owned(), input_schema);

    if !input.examples.is_empty() {
        let examples: Vec<Value> = input.examples.iter().map(|e| e.inputs.clone()).collect();
        out.insert("input_examples".to_owned(), Value::Array(examples));
    }
    Value::Object(out)
}

fn export_generic(input: &ExportInput<'_>) -> Value {
    json!({
        "module_id": input.module_id,
        "description": input.description,
        "input_schema": input.input_schema,
        "output_schema": input.output_schema,
        "definitions": input.definitions,
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn sample() -> (Value, Value, Value) {
        (
            json!({"type": "object", "properties": {"a": {"type": "string"}}, "required": []}),
            json!({"type": "object", "properties": {"r": {"type": "integer"}}, "required": ["r"]}),
            Value::Null,
        )
    }

    #[test]
    fn mcp_maps_annotations_to_hints() {
        let (input_schema, output_schema, definitions) = sample();
        let annotations = Annotations {
            readonly: true,
            destructive: false,
            idempotent: true,
            requires_approval: false,
            open_world: true,
            streaming: false,
        };
        let export = ExportInput {
            module_id: "math.add",
            description: "adds",
            input_schema: &input_schema,
            output_schema: &output_schema,
            definitions: &definitions,
            annotations,
            examples: &[],
        };
        let out = export_module(ExportProfile::Mcp, &export);
        assert_eq!(out["annotations"]["readOnlyHint"], json!(true));
        assert_eq!(out["annotations"]["idempotentHint"], json!(true));
        assert_eq!(out["annotations"]["openWorldHint"], json!(true));
    }

    #[test]
    fn openai_replaces_dots_and_applies_strict() {
        let (input_schema, output_schema, definitions) = sample();
        let export = ExportInput {
            module_id: "math.add",
            description: "adds",
            input_schema: &input_schema,
            output_schema: &output_schema,
            definitions: &definitions,
            annotations: Annotations::default(),
            examples: &[],
        };
        let out = export_module(ExportProfile::OpenAi, &export);
        assert_eq!(out["function"]["name"], "math_add");
        assert_eq!(out["strict"], json!(true));
        assert_eq!(out["function"]["parameters"]["additionalProperties"], json!(false));
    }

    #[test]
    fn anthropic_includes_examples_when_present() {
        let (input_schema, output_schema, definitions) = sample();
        let examples = vec![ModuleExample {
            title: "basic".to_owned(),
            inputs: json!({"a": "x"}),
            output: json!({"r": 1}),
            description: None,
        }];
        let export = ExportInput {
            module_id: "math.add",
            description: "adds",
            input_schema: &input_schema,
            output_schema: &output_schema,
            definitions: &definitions,
            annotations: Annotations::default(),
            examples: &examples,
        };
        let out = export_module(ExportProfile::Anthropic, &export);
        assert_eq!(out["input_examples"], json!([{"a": "x"}]));
    }

    #[test]
    fn generic_is_passthrough() {
        let (input_schema, output_schema, definitions) = sample();
        let export = ExportInput {
            module_id: "math.add",
            description: "adds",
            input_schema: &input_schema,
            output_schema: &output_schema,
            definitions: &definitions,
            annotations: Annotations::default(),
            examples: &[],
        };
        let out = export_module(ExportProfile::Generic, &export);
        assert_eq!(out["module_id"], "math.add");
        assert_eq!(out["input_schema"], input_schema);
    }
}
