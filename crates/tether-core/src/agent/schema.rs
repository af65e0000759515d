//! JSON Schema validation for agent files.
//!
//! Agent files are checked against `schema/agent.schema.json` before they
//! are deserialized, so structural mistakes get path-qualified messages.

use std::sync::OnceLock;

/// Embedded agent schema (loaded at compile time).
const AGENT_SCHEMA_JSON: &str = include_str!("../../schema/agent.schema.json");

/// Compiled validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

fn get_validator() -> Result<&'static jsonschema::Validator, String> {
    COMPILED_SCHEMA
        .get_or_init(|| {
            let schema_value: serde_json::Value = serde_json::from_str(AGENT_SCHEMA_JSON)
                .map_err(|e| format!("Invalid schema JSON: {}", e))?;
            jsonschema::options()
                .build(&schema_value)
                .map_err(|e| format!("Failed to compile schema: {}", e))
        })
        .as_ref()
        .map_err(Clone::clone)
}

/// Validate a raw agent document.
///
/// Returns every schema error as `"<message> at <instance path>"`.
pub fn validate_agent_schema(agent_json: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e])?;

    let errors: Vec<String> = validator
        .iter_errors(agent_json)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> serde_json::Value {
        json!({
            "name": "writer",
            "description": "Write an article",
            "criteria": [{"name": "quality", "description": "Detailed"}]
        })
    }

    #[test]
    fn test_schema_compiles() {
        assert!(get_validator().is_ok());
    }

    #[test]
    fn test_minimal_agent_passes() {
        assert!(validate_agent_schema(&minimal()).is_ok());
    }

    #[test]
    fn test_missing_criteria_fails() {
        let mut value = minimal();
        value.as_object_mut().unwrap().remove("criteria");
        assert!(validate_agent_schema(&value).is_err());
    }

    #[test]
    fn test_empty_criteria_fails() {
        let mut value = minimal();
        value["criteria"] = json!([]);
        assert!(validate_agent_schema(&value).is_err());
    }

    #[test]
    fn test_zero_max_attempts_fails() {
        let mut value = minimal();
        value["max_attempts"] = json!(0);
        let errors = validate_agent_schema(&value).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("/max_attempts")));
    }

    #[test]
    fn test_unknown_rule_fails() {
        let mut value = minimal();
        value["input_constraints"] = json!([{"name": "x", "rule": "shout"}]);
        assert!(validate_agent_schema(&value).is_err());
    }

    #[test]
    fn test_type_rule_needs_kind() {
        let mut value = minimal();
        value["output_constraints"] = json!([{"name": "x", "rule": "type"}]);
        assert!(validate_agent_schema(&value).is_err());

        value["output_constraints"] = json!([{"name": "x", "rule": "type", "kind": "email"}]);
        assert!(validate_agent_schema(&value).is_ok());
    }

    #[test]
    fn test_duration_forms() {
        let mut value = minimal();
        value["timeout"] = json!("1m 30s");
        assert!(validate_agent_schema(&value).is_ok());
        value["timeout"] = json!(45);
        assert!(validate_agent_schema(&value).is_ok());
        value["timeout"] = json!("soon");
        assert!(validate_agent_schema(&value).is_err());
    }
}
