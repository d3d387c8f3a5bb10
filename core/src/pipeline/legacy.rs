//! Import of legacy YAML pipelines
//!
//! The legacy format names fields differently:
//!
//! | legacy                 | native                        |
//! |------------------------|-------------------------------|
//! | `command`              | `exec`                        |
//! | `stdin: $X.stdout`     | `input: $X.output`            |
//! | `approval: true`       | `approval: { required: true }`|
//! | `approval: "message"`  | required, with that message   |
//! | top-level `args`       | `inputs`                      |
//!
//! `condition` strings are carried over verbatim.

use super::definition::{ApprovalSpec, InputSpec, InputType, PipelineDefinition, PipelineStep};
use crate::errors::{DefinitionError, DefinitionResult};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyPipeline {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub args: BTreeMap<String, LegacyArg>,
    pub steps: Vec<LegacyStep>,
}

/// Legacy args are either a bare default or a full spec.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LegacyArg {
    Spec {
        #[serde(rename = "type", default)]
        arg_type: Option<String>,
        #[serde(default)]
        default: Option<Value>,
        #[serde(default)]
        description: Option<String>,
    },
    Default(Value),
}

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyStep {
    pub id: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub approval: Option<Value>,
}

/// Rewrite `$X.stdout` to `$X.output`; anything else passes through.
fn convert_stdin(stdin: &str) -> String {
    let trimmed = stdin.trim();
    match trimmed
        .strip_prefix('$')
        .and_then(|rest| rest.strip_suffix(".stdout"))
    {
        Some(step_id) if !step_id.is_empty() => format!("${}.output", step_id),
        _ => stdin.to_string(),
    }
}

fn convert_approval(approval: Option<&Value>) -> Option<ApprovalSpec> {
    match approval? {
        Value::Bool(true) => Some(ApprovalSpec {
            required: true,
            message: None,
        }),
        Value::String(message) => Some(ApprovalSpec {
            required: true,
            message: Some(message.clone()),
        }),
        Value::Object(map) => Some(ApprovalSpec {
            required: map.get("required").and_then(Value::as_bool).unwrap_or(true),
            message: map.get("message").and_then(Value::as_str).map(str::to_string),
        }),
        _ => None,
    }
}

fn convert_arg_type(arg_type: Option<&str>) -> InputType {
    match arg_type.map(str::to_ascii_lowercase).as_deref() {
        Some("number" | "float") => InputType::Number,
        Some("integer" | "int") => InputType::Integer,
        Some("boolean" | "bool") => InputType::Boolean,
        Some("array" | "list") => InputType::Array,
        Some("object" | "map") => InputType::Object,
        _ => InputType::String,
    }
}

pub fn convert_legacy_step(step: &LegacyStep) -> PipelineStep {
    PipelineStep {
        id: step.id.clone(),
        exec: step.command.clone(),
        prompt: step.prompt.clone(),
        input: step.stdin.as_deref().map(convert_stdin),
        condition: step.condition.clone(),
        approval: convert_approval(step.approval.as_ref()),
    }
}

pub fn convert_legacy_pipeline(legacy: &LegacyPipeline) -> PipelineDefinition {
    let inputs = legacy
        .args
        .iter()
        .map(|(name, arg)| {
            let spec = match arg {
                LegacyArg::Spec {
                    arg_type,
                    default,
                    description,
                } => InputSpec {
                    input_type: convert_arg_type(arg_type.as_deref()),
                    default: default.clone(),
                    description: description.clone(),
                },
                LegacyArg::Default(value) => InputSpec {
                    input_type: match value {
                        Value::Bool(_) => InputType::Boolean,
                        Value::Number(n) if n.is_i64() => InputType::Integer,
                        Value::Number(_) => InputType::Number,
                        _ => InputType::String,
                    },
                    default: (!value.is_null()).then(|| value.clone()),
                    description: None,
                },
            };
            (name.clone(), spec)
        })
        .collect();

    PipelineDefinition {
        name: legacy.name.clone(),
        description: legacy.description.clone().unwrap_or_default(),
        inputs,
        steps: legacy.steps.iter().map(convert_legacy_step).collect(),
        webhooks: Default::default(),
    }
}

/// Parse and convert a legacy pipeline, validating the result.
pub fn import_legacy_pipeline(source: &str) -> DefinitionResult<PipelineDefinition> {
    let legacy: LegacyPipeline =
        serde_yaml::from_str(source).map_err(|e| DefinitionError::Parse {
            path: "<legacy>".to_string(),
            message: e.to_string(),
        })?;
    let definition = convert_legacy_pipeline(&legacy);
    definition.validate()?;
    Ok(definition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_convert_step() {
        let step: LegacyStep = serde_json::from_value(json!({
            "id": "p",
            "command": "npm test",
            "stdin": "$build.stdout",
            "approval": true
        }))
        .unwrap();

        let converted = convert_legacy_step(&step);
        assert_eq!(converted.id, "p");
        assert_eq!(converted.exec.as_deref(), Some("npm test"));
        assert_eq!(converted.input.as_deref(), Some("$build.output"));
        assert_eq!(
            converted.approval,
            Some(ApprovalSpec {
                required: true,
                message: None
            })
        );
        assert!(converted.prompt.is_none());
        assert!(converted.condition.is_none());
    }

    #[test]
    fn test_approval_variants() {
        assert_eq!(convert_approval(Some(&json!(false))), None);
        assert_eq!(convert_approval(None), None);
        assert_eq!(
            convert_approval(Some(&json!("Deploy?"))),
            Some(ApprovalSpec {
                required: true,
                message: Some("Deploy?".to_string())
            })
        );
    }

    #[test]
    fn test_stdin_passthrough() {
        assert_eq!(convert_stdin("$build.stdout"), "$build.output");
        assert_eq!(convert_stdin("literal text"), "literal text");
        assert_eq!(convert_stdin("$build.stderr"), "$build.stderr");
    }

    #[test]
    fn test_import_pipeline() {
        let yaml = r#"
name: ci
args:
  branch:
    type: string
    default: main
  retries: 2
steps:
  - id: build
    command: make
  - id: test
    command: make test
    stdin: $build.stdout
    condition: inputs.retries > 0
    approval: "Run tests?"
"#;
        let def = import_legacy_pipeline(yaml).unwrap();
        assert_eq!(def.name, "ci");
        assert_eq!(def.inputs["branch"].default, Some(json!("main")));
        assert_eq!(def.inputs["retries"].input_type, InputType::Integer);
        assert_eq!(def.steps[1].condition.as_deref(), Some("inputs.retries > 0"));
        assert_eq!(def.steps[1].input_reference(), Some("build"));
        assert_eq!(
            def.steps[1].approval.as_ref().and_then(|a| a.message.as_deref()),
            Some("Run tests?")
        );
    }
}
